//! Prometheus metrics for solve requests
//!
//! Disabled unless `PROMETHEUS_ENABLED` is set. The registry is exposed on its
//! own listener (`PROMETHEUS_PORT`).

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::{net::SocketAddr, time::Duration};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{
    error::ApiError,
    models::Outcome,
    solver::challenge::CHALLENGE_SOLVED,
    validation::SolveRequest,
};

/// Seconds
const DURATION_BUCKETS: &[f64] = &[0.0, 10.0, 25.0, 50.0];

/// `result` label of the request counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveResult {
    Solved,
    NotDetected,
    Error,
}

impl SolveResult {
    pub fn of(outcome: &Result<Outcome, ApiError>) -> Self {
        match outcome {
            Ok(outcome) if outcome.message == CHALLENGE_SOLVED => SolveResult::Solved,
            Ok(_) => SolveResult::NotDetected,
            Err(_) => SolveResult::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SolveResult::Solved => "solved",
            SolveResult::NotDetected => "not_detected",
            SolveResult::Error => "error",
        }
    }
}

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("clearance_request", "Total solve requests by target domain and result"),
            &["domain", "result"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("clearance_request_duration", "Solve duration in seconds")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["domain"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
        })
    }

    pub fn record(&self, domain: &str, result: SolveResult, elapsed: Duration) {
        self.requests
            .with_label_values(&[domain, result.as_str()])
            .inc();
        self.duration
            .with_label_values(&[domain])
            .observe(elapsed.as_secs_f64());
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }

    #[cfg(test)]
    pub fn request_count(&self, domain: &str, result: SolveResult) -> u64 {
        self.requests
            .with_label_values(&[domain, result.as_str()])
            .get()
    }
}

/// `domain` label for a request. Session commands carry no target and are
/// not recorded.
pub fn domain_of(request: &SolveRequest) -> Option<String> {
    request
        .url
        .as_ref()
        .and_then(|url| url.host_str())
        .map(str::to_string)
}

pub fn router(metrics: Metrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

async fn metrics_handler(State(metrics): State<Metrics>) -> Response {
    match metrics.render() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serve `/metrics` on `addr` until the runtime stops.
pub async fn serve(addr: SocketAddr, metrics: Metrics) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;

    info!(address = %addr, "Metrics listening");
    axum::serve(listener, router(metrics)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::Solution, solver::challenge::CHALLENGE_NOT_DETECTED, validation::Command};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use std::collections::HashMap;
    use tower::ServiceExt;
    use url::Url;

    fn solution() -> Solution {
        Solution {
            url: "https://a.test/".to_string(),
            status: 200,
            headers: HashMap::new(),
            response: None,
            cookies: Vec::new(),
            user_agent: String::new(),
        }
    }

    #[test]
    fn test_result_labels() {
        let solved = Ok(Outcome::solved(CHALLENGE_SOLVED, solution()));
        let clear = Ok(Outcome::solved(CHALLENGE_NOT_DETECTED, solution()));
        let failed = Err(ApiError::unknown("boom"));

        assert_eq!(SolveResult::of(&solved), SolveResult::Solved);
        assert_eq!(SolveResult::of(&clear), SolveResult::NotDetected);
        assert_eq!(SolveResult::of(&failed), SolveResult::Error);
        assert_eq!(SolveResult::NotDetected.as_str(), "not_detected");
    }

    #[test]
    fn test_domain_of() {
        let request = SolveRequest::new(Command::RequestGet)
            .with_url(Url::parse("https://www.example.com/path?q=1").unwrap());
        assert_eq!(domain_of(&request).as_deref(), Some("www.example.com"));
        assert_eq!(domain_of(&SolveRequest::new(Command::SessionsList)), None);
    }

    #[test]
    fn test_record_counts_per_label() {
        let metrics = Metrics::new().unwrap();
        metrics.record("a.test", SolveResult::Solved, Duration::from_secs(3));
        metrics.record("a.test", SolveResult::Solved, Duration::from_secs(12));
        metrics.record("a.test", SolveResult::Error, Duration::from_secs(1));

        assert_eq!(metrics.request_count("a.test", SolveResult::Solved), 2);
        assert_eq!(metrics.request_count("a.test", SolveResult::Error), 1);
        assert_eq!(metrics.request_count("b.test", SolveResult::Solved), 0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_renders_text_format() {
        let metrics = Metrics::new().unwrap();
        metrics.record("a.test", SolveResult::NotDetected, Duration::from_secs(2));

        let response = router(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains(r#"clearance_request{domain="a.test",result="not_detected"} 1"#));
        assert!(text.contains("clearance_request_duration_bucket"));
    }
}
