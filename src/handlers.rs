//! HTTP route handlers for the solver service

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{
        header::{COOKIE, USER_AGENT},
        HeaderMap, HeaderName, StatusCode,
    },
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Config,
    dispatch::{dispatch, SessionLocks},
    envelope::{build_envelope, now_millis},
    error::{ApiError, ValidationError},
    forward::{forward, ForwardedHeaders},
    metrics::{domain_of, Metrics, SolveResult},
    models::{
        ContentQuery, ContentResponse, HealthResponse, IndexResponse, NotFoundResponse, Outcome,
        SolveResponse,
    },
    solver::Solver,
    validation::{parse_solve_request, sanitize_url_for_logging},
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub solver: Arc<Solver>,
    pub semaphore: Arc<Semaphore>,
    pub session_locks: SessionLocks,
    /// Reported by the startup self-test
    pub user_agent: Arc<str>,
    pub metrics: Option<Metrics>,
}

impl AppState {
    pub fn new(config: Config, solver: Arc<Solver>, user_agent: impl Into<Arc<str>>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            config: Arc::new(config),
            solver,
            semaphore,
            session_locks: SessionLocks::new(),
            user_agent: user_agent.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Create the timeout layer (separate function to allow #[allow(deprecated)])
#[allow(deprecated)]
fn create_timeout_layer(timeout_secs: u64) -> tower_http::timeout::TimeoutLayer {
    tower_http::timeout::TimeoutLayer::new(Duration::from_secs(timeout_secs))
}

/// Build the application router.
///
/// Layers only wrap the routes registered before them, so `/health` is added
/// last and never shows up in request traces.
pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_request_body_size;
    let server_timeout = state.config.server_timeout;

    Router::new()
        .route("/", get(index_handler))
        .route("/v1", post(solve_handler))
        .route("/content", get(content_handler))
        // Limit request body size (protects against large payload attacks)
        .layer(DefaultBodyLimit::max(body_limit))
        // Request tracing
        .layer(TraceLayer::new_for_http())
        // Server-side request timeout (protects against slow clients)
        .layer(create_timeout_layer(server_timeout))
        .route("/health", get(health_handler))
        .fallback(not_found_handler)
        .with_state(state)
}

/// GET / - Service identity
pub async fn index_handler(State(state): State<AppState>) -> Json<IndexResponse> {
    Json(IndexResponse::new(state.user_agent.as_ref()))
}

/// GET /health - Health check endpoint
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}

/// POST /v1 - Solve a challenge or manage sessions
///
/// Always answers with the envelope, including for bodies that are not JSON.
pub async fn solve_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> (StatusCode, Json<SolveResponse>) {
    let start = now_millis();
    let outcome = solve(&state, &body).await;
    let end = now_millis();

    if let Err(err) = &outcome {
        warn!(code = %err.code(), error = err.message(), "Solve failed");
    }

    let (status, envelope) = build_envelope(outcome, start, end);
    info!(
        status = status.as_u16(),
        message = %envelope.message,
        elapsed_ms = end - start,
        "Response"
    );
    (status, Json(envelope))
}

async fn solve(state: &AppState, body: &[u8]) -> Result<Outcome, ApiError> {
    let raw: Value = serde_json::from_slice(body).map_err(|e| {
        ValidationError::new("body", format!("Request body is not valid JSON: {}", e))
    })?;

    let request = parse_solve_request(&raw).map_err(|e| {
        warn!(field = e.field, error = %e, "Rejected request");
        e
    })?;

    info!(
        cmd = %request.cmd,
        url = ?request.url.as_ref().map(|u| sanitize_url_for_logging(u.as_str())),
        session = request.session.as_deref(),
        max_timeout_ms = request.max_timeout.as_millis() as u64,
        driver = %state.solver.choice(),
        "Incoming request"
    );

    let domain = state.metrics.as_ref().and_then(|_| domain_of(&request));
    let started = Instant::now();

    let outcome = dispatch(&state.solver, &state.semaphore, &state.session_locks, request).await;

    if let (Some(metrics), Some(domain)) = (&state.metrics, domain) {
        metrics.record(&domain, SolveResult::of(&outcome), started.elapsed());
    }
    outcome
}

/// GET /content - Forward a GET with the caller's headers
pub async fn content_handler(
    State(state): State<AppState>,
    Query(query): Query<ContentQuery>,
    headers: HeaderMap,
) -> Result<Json<ContentResponse>, ApiError> {
    let target_url = query
        .url
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ApiError::invalid_request("Missing 'url' in query parameters."))?;

    let received_headers = ForwardedHeaders {
        user_agent: header_or(&headers, USER_AGENT, "Unknown"),
        cookie: header_or(&headers, COOKIE, ""),
    };

    info!(url = %sanitize_url_for_logging(&target_url), "Forwarding content request");
    let forwarded = forward(state.config.content_tls_profile, &target_url, &received_headers).await?;

    Ok(Json(ContentResponse {
        message: "Request forwarded successfully",
        target_url,
        received_headers,
        status: forwarded.status,
        external_api_response: forwarded.body,
    }))
}

fn header_or(headers: &HeaderMap, name: HeaderName, default: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(default)
        .to_string()
}

/// Any unmatched route
pub async fn not_found_handler() -> (StatusCode, Json<NotFoundResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundResponse {
            error: "Not found".to_string(),
            status_code: StatusCode::NOT_FOUND.as_u16(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::{
        testing::{FakeAsyncBackend, FakeSyncBackend, Tally, FAKE_USER_AGENT},
        AsyncAdapter, SyncAdapter,
    };
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };
    use tower::ServiceExt;
    use tracing::{Event, Subscriber};
    use tracing_subscriber::{
        layer::{Context, SubscriberExt},
        Layer,
    };

    fn app_with(solver: Solver) -> Router {
        let config = Config::from_lookup(|_| None).unwrap();
        router(AppState::new(config, Arc::new(solver), FAKE_USER_AGENT))
    }

    fn sync_app(latency: Duration) -> (Router, Tally) {
        let backend = FakeSyncBackend::new(latency);
        let tally = backend.tally();
        (app_with(Solver::Sync(SyncAdapter::new(backend))), tally)
    }

    fn async_app(latency: Duration) -> (Router, Tally) {
        let backend = FakeAsyncBackend::new(latency);
        let tally = backend.tally();
        let adapter = AsyncAdapter::start(backend).unwrap();
        (app_with(Solver::Async(adapter)), tally)
    }

    async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_v1(body: impl Into<String>) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1")
            .header("content-type", "application/json")
            .body(Body::from(body.into()))
            .unwrap()
    }

    fn get_body(url: &str, max_timeout: u64) -> String {
        serde_json::json!({ "cmd": "request.get", "url": url, "maxTimeout": max_timeout }).to_string()
    }

    /// Counts every event, regardless of level
    struct CountingLayer(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for CountingLayer {
        fn on_event(&self, _event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_index_reports_identity() {
        let (app, _) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, get("/")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["msg"], "Clearance is ready!");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["userAgent"], FAKE_USER_AGENT);
    }

    #[tokio::test]
    async fn test_health() {
        let (app, tally) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, get("/health")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({ "status": "ok" }));
        assert_eq!(tally.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let (app, _) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, get("/nope")).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status_code"], 404);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_invalid_json_is_rejected_before_backend() {
        let (app, tally) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, post_v1("{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["solution"].is_null());
        assert!(body.get("error_500").is_none());
        assert_eq!(tally.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_cmd_is_rejected_before_backend() {
        let (app, tally) = async_app(Duration::ZERO);
        let (status, body) = call(&app, post_v1(r#"{"cmd":"request.put","url":"https://ok.test/"}"#)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("cmd"));
        assert_eq!(tally.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sync_backend_serves_solve() {
        let (app, tally) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, post_v1(get_body("https://ok.test/page", 5_000))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["message"], "Challenge not detected!");
        assert_eq!(body["solution"]["url"], "https://ok.test/page");
        assert_eq!(body["solution"]["userAgent"], FAKE_USER_AGENT);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["startTimestamp"].as_i64().unwrap() <= body["endTimestamp"].as_i64().unwrap());
        assert_eq!(tally.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_backend_serves_solve_off_request_thread() {
        let (app, tally) = async_app(Duration::ZERO);
        let (status, body) = call(&app, post_v1(get_body("https://ok.test/a", 5_000))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["solution"]["url"], "https://ok.test/a");
        assert_eq!(tally.calls.load(Ordering::SeqCst), 1);

        let threads = tally.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert!(!threads.contains(&std::thread::current().id()));
    }

    #[tokio::test]
    async fn test_backend_failure_is_500_envelope() {
        let (app, _) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, post_v1(get_body("https://denied.test/", 5_000))).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "error");
        assert!(body["message"]
            .as_str()
            .unwrap()
            .contains("Cloudflare has blocked this request"));
        assert!(body["solution"].is_null());
    }

    #[tokio::test]
    async fn test_health_leaves_no_trace_logs() {
        let (app, _) = sync_app(Duration::ZERO);
        let events = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(CountingLayer(events.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let (status, _) = call(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events.load(Ordering::SeqCst), 0);

        let (status, _) = call(&app, post_v1(get_body("https://ok.test/", 5_000))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(events.load(Ordering::SeqCst) > 0);
    }

    async fn ten_concurrent(app: Router) -> Duration {
        let started = Instant::now();
        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let app = app.clone();
                tokio::spawn(async move {
                    let url = format!("https://ok.test/{}", i);
                    let (status, body) = call(&app, post_v1(get_body(&url, 5_000))).await;
                    assert_eq!(status, StatusCode::OK);
                    assert_eq!(body["solution"]["url"], url);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        started.elapsed()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_sync_requests_run_in_parallel() {
        let (app, tally) = sync_app(Duration::from_millis(100));
        let elapsed = ten_concurrent(app).await;

        assert!(elapsed < Duration::from_millis(800), "took {:?}", elapsed);
        assert_eq!(tally.calls.load(Ordering::SeqCst), 10);
        assert!(tally.max_active.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_requests_interleave_on_one_loop() {
        let (app, tally) = async_app(Duration::from_millis(100));
        let elapsed = ten_concurrent(app).await;

        assert!(elapsed < Duration::from_millis(900), "took {:?}", elapsed);
        assert_eq!(tally.calls.load(Ordering::SeqCst), 10);
        assert_eq!(tally.threads.lock().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_then_next_request_succeeds() {
        for (app, tally) in [sync_app(Duration::ZERO), async_app(Duration::ZERO)] {
            let (status, body) = call(&app, post_v1(get_body("https://hang.test/", 200))).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body["message"]
                .as_str()
                .unwrap()
                .contains("Timeout after 0.2 seconds"));

            let (status, body) = call(&app, post_v1(get_body("https://ok.test/after", 5_000))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["solution"]["url"], "https://ok.test/after");

            tally.release.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_solves_are_counted_when_metrics_enabled() {
        let metrics = Metrics::new().unwrap();
        let config = Config::from_lookup(|_| None).unwrap();
        let solver = Solver::Sync(SyncAdapter::new(FakeSyncBackend::new(Duration::ZERO)));
        let app = router(AppState::new(config, Arc::new(solver), FAKE_USER_AGENT).with_metrics(metrics.clone()));

        call(&app, post_v1(get_body("https://ok.test/a", 5_000))).await;
        call(&app, post_v1(get_body("https://ok.test/b", 5_000))).await;
        call(&app, post_v1(get_body("https://denied.test/", 5_000))).await;
        // neither rejected bodies nor session commands carry a domain
        call(&app, post_v1("{not json")).await;
        call(&app, post_v1(r#"{"cmd":"sessions.list"}"#)).await;

        assert_eq!(metrics.request_count("ok.test", SolveResult::NotDetected), 2);
        assert_eq!(metrics.request_count("denied.test", SolveResult::Error), 1);
        assert_eq!(metrics.request_count("ok.test", SolveResult::Error), 0);
        assert!(metrics.render().unwrap().contains(r#"clearance_request_duration_count{domain="ok.test"} 2"#));
    }

    async fn spawn_echo_stub() -> String {
        let stub = Router::new().route(
            "/echo",
            axum::routing::get(|headers: HeaderMap| async move {
                format!("cookie={}", header_or(&headers, COOKIE, "<none>"))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, stub).await.unwrap();
        });
        format!("http://{}/echo", addr)
    }

    #[tokio::test]
    async fn test_content_forwards_cookie_and_returns_body() {
        let (app, tally) = sync_app(Duration::ZERO);
        let target = spawn_echo_stub().await;
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();

        let request = Request::builder()
            .uri(format!("/content?url={}", encoded))
            .header("Cookie", "a=b")
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target_url"], target);
        assert_eq!(body["status"], 200);
        assert_eq!(body["external_api_response"], "cookie=a=b");
        assert_eq!(body["received_headers"]["Cookie"], "a=b");
        assert_eq!(body["received_headers"]["User-Agent"], "Unknown");
        assert_eq!(tally.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_content_requires_url() {
        let (app, _) = sync_app(Duration::ZERO);
        let (status, body) = call(&app, get("/content")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Missing 'url' in query parameters.");
    }
}
