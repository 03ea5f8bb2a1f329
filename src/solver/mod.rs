//! Browser backends and the adapters that bridge them into request handlers
//!
//! Two backends with different concurrency models sit behind one contract:
//!
//! - [`SyncBackend`]: blocking calls, run through [`SyncAdapter`] on the
//!   runtime's blocking pool.
//! - [`AsyncBackend`]: cooperative futures, run through [`AsyncAdapter`] on a
//!   dedicated single-threaded event loop.
//!
//! [`Solver`] owns exactly one of the two for the whole process.

pub mod async_adapter;
pub mod cdp;
pub mod challenge;
pub mod session;
pub mod sync_adapter;
pub mod webdriver;

#[cfg(test)]
pub mod testing;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::info;
use url::{form_urlencoded, Url};

use crate::{
    backend::BackendChoice,
    config::Config,
    dispatch::Lease,
    error::ApiError,
    models::Outcome,
    validation::SolveRequest,
};

pub use async_adapter::AsyncAdapter;
pub use sync_adapter::SyncAdapter;

/// Settings shared by both concrete backends
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub log_html: bool,
}

impl From<&Config> for BrowserOptions {
    fn from(config: &Config) -> Self {
        Self {
            headless: config.headless,
            log_html: config.log_html,
        }
    }
}

/// Blocking browser backend.
///
/// A call may hold its thread for the whole browser interaction. Errors are
/// free-form; name the ones you can with [`crate::error::BackendFault`].
pub trait SyncBackend: Send + Sync {
    /// Start and stop one browser. Returns its user agent.
    fn self_test(&self) -> anyhow::Result<String>;

    fn execute(&self, request: &SolveRequest) -> anyhow::Result<Outcome>;

    /// Release every browser still held.
    fn shutdown(&self) {}
}

/// Event-loop browser backend. Its futures only ever run on the solver loop
/// thread, so they need not be `Send`.
#[async_trait(?Send)]
pub trait AsyncBackend: Send + Sync {
    /// Start and stop one browser. Returns its user agent.
    async fn self_test(&self) -> anyhow::Result<String>;

    async fn execute(&self, request: &SolveRequest) -> anyhow::Result<Outcome>;

    /// Release every browser still held.
    async fn shutdown(&self) {}
}

/// The one backend this process solves with
pub enum Solver {
    Sync(SyncAdapter),
    Async(AsyncAdapter),
}

impl Solver {
    /// Build the concrete backend selected by `config.driver`.
    pub fn start(config: &Config) -> anyhow::Result<Self> {
        let options = BrowserOptions::from(config);
        info!(driver = %config.driver, headless = options.headless, "Starting solver backend");

        match config.driver {
            BackendChoice::WebDriver => {
                let backend = webdriver::WebDriverBackend::new(config.webdriver_url.clone(), options)?;
                Ok(Solver::Sync(SyncAdapter::new(backend)))
            }
            BackendChoice::Cdp => {
                let backend = cdp::CdpBackend::new(options, config.browser_path.clone());
                Ok(Solver::Async(AsyncAdapter::start(backend)?))
            }
        }
    }

    pub fn choice(&self) -> BackendChoice {
        match self {
            Solver::Sync(_) => BackendChoice::WebDriver,
            Solver::Async(_) => BackendChoice::Cdp,
        }
    }

    /// Startup self-test. Blocks; call it before the server runtime exists.
    pub fn self_test_blocking(&self) -> anyhow::Result<String> {
        match self {
            Solver::Sync(adapter) => adapter.self_test(),
            Solver::Async(adapter) => adapter.self_test_blocking(),
        }
    }

    /// Solve `request`. `lease` is released once the backend stops working on it.
    pub async fn solve(&self, request: SolveRequest, lease: Lease) -> Result<Outcome, ApiError> {
        match self {
            Solver::Sync(adapter) => adapter.solve(request, lease).await,
            Solver::Async(adapter) => adapter.solve(request, lease).await,
        }
    }

    /// Close every browser. Blocks; call it after the server runtime is gone.
    pub fn shutdown(&self) {
        match self {
            Solver::Sync(adapter) => adapter.shutdown(),
            Solver::Async(adapter) => adapter.shutdown(),
        }
    }
}

/// Headless Chrome announces itself; present as the regular browser.
pub(crate) fn normalize_user_agent(user_agent: &str) -> String {
    user_agent.replace("HeadlessChrome", "Chrome")
}

/// A `data:` page that immediately POSTs `post_data` to `target`.
///
/// Browsers cannot issue a top-level POST directly, so both backends
/// navigate to this page instead.
pub(crate) fn post_form_url(target: &Url, post_data: &str) -> String {
    let inputs: String = form_urlencoded::parse(post_data.as_bytes())
        .map(|(name, value)| {
            format!(
                r#"<input type="text" name="{}" value="{}">"#,
                html_escape::encode_double_quoted_attribute(&name),
                html_escape::encode_double_quoted_attribute(&value),
            )
        })
        .collect();

    let page = format!(
        concat!(
            "<!DOCTYPE html><html><body>",
            r#"<form id="postForm" action="{}" method="POST">{}</form>"#,
            r#"<script>document.getElementById("postForm").submit();</script>"#,
            "</body></html>"
        ),
        html_escape::encode_double_quoted_attribute(target.as_str()),
        inputs,
    );

    format!("data:text/html;charset=utf-8;base64,{}", BASE64.encode(page))
}

/// Session id for `sessions.create`: the caller's, or a fresh one.
pub(crate) fn session_id_for(request: &SolveRequest) -> String {
    request
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
