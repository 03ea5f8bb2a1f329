//! Event-loop backend driving Chrome over the DevTools protocol
//!
//! Every future here runs on the solver loop thread. One browser process per
//! session, each with its own throwaway profile directory.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chromiumoxide::{
    cdp::browser_protocol::network::{Cookie as CdpCookie, CookieParam, TimeSinceEpoch},
    error::CdpError,
    Browser, BrowserConfig, Page,
};
use futures::StreamExt;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{Duration, Instant},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    challenge::{next_poll_delay, probe_expression, solve_message, PageState},
    normalize_user_agent, post_form_url, session_id_for,
    session::{Lookup, SessionStore},
    AsyncBackend, BrowserOptions,
};
use crate::{
    error::BackendFault,
    models::{Cookie, Outcome, ProxyConfig, Solution},
    validation::{Command, SolveRequest},
};

/// Upper bound for a single protocol round trip
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// One launched browser and its event pump
pub struct CdpSession {
    browser: Mutex<Browser>,
    page: Page,
    handler: JoinHandle<()>,
    profile_dir: PathBuf,
}

impl CdpSession {
    async fn close(&self) {
        let mut browser = self.browser.lock().await;
        shut_browser(&mut browser).await;
    }
}

// Also runs for sessions dropped mid-solve by a timeout; chromiumoxide kills
// a browser process that was never closed explicitly.
impl Drop for CdpSession {
    fn drop(&mut self) {
        self.handler.abort();
        remove_profile(&self.profile_dir);
    }
}

async fn shut_browser(browser: &mut Browser) {
    if let Err(e) = browser.close().await {
        debug!(error = %e, "Browser close command failed");
    }
    if let Err(e) = browser.wait().await {
        warn!(error = %e, "Failed to reap browser process");
    }
}

fn remove_profile(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        debug!(path = %dir.display(), error = %e, "Profile directory not removed");
    }
}

pub struct CdpBackend {
    options: BrowserOptions,
    browser_path: Option<PathBuf>,
    /// Learned during the self-test and pinned on every later browser
    user_agent: OnceLock<String>,
    sessions: SessionStore<CdpSession>,
}

impl CdpBackend {
    pub fn new(options: BrowserOptions, browser_path: Option<PathBuf>) -> Self {
        Self {
            options,
            browser_path,
            user_agent: OnceLock::new(),
            sessions: SessionStore::new(),
        }
    }

    fn browser_config(&self, proxy: Option<&ProxyConfig>, profile_dir: &Path) -> anyhow::Result<BrowserConfig> {
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .user_data_dir(profile_dir)
            .request_timeout(COMMAND_TIMEOUT)
            .window_size(1920, 1080)
            .arg("--disable-dev-shm-usage");

        builder = if self.options.headless {
            builder.new_headless_mode()
        } else {
            builder.with_head()
        };
        if let Some(path) = &self.browser_path {
            builder = builder.chrome_executable(path);
        }
        if let Some(proxy) = proxy {
            if proxy.username.is_some() || proxy.password.is_some() {
                warn!("Proxy credentials are not supported by the CDP backend, ignoring them");
            }
            builder = builder.arg(format!("--proxy-server={}", proxy.url));
        }
        if let Some(user_agent) = self.user_agent.get() {
            builder = builder.arg(format!("--user-agent={}", user_agent));
        }

        builder
            .build()
            .map_err(|e| BackendFault::DriverCrash(format!("invalid browser configuration: {}", e)).into())
    }

    async fn launch(&self, proxy: Option<&ProxyConfig>) -> anyhow::Result<CdpSession> {
        let profile_dir = std::env::temp_dir().join(format!("clearance-profile-{}", uuid::Uuid::new_v4()));
        let config = self.browser_config(proxy, &profile_dir)?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| BackendFault::DriverCrash(format!("browser failed to launch: {}", e)))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!(error = %e, "CDP handler event error");
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                shut_browser(&mut browser).await;
                handler.abort();
                remove_profile(&profile_dir);
                return Err(cdp_error(e));
            }
        };

        debug!(profile = %profile_dir.display(), "Browser started");
        Ok(CdpSession {
            browser: Mutex::new(browser),
            page,
            handler,
            profile_dir,
        })
    }

    async fn user_agent_of(page: &Page) -> anyhow::Result<String> {
        page.evaluate("navigator.userAgent")
            .await
            .map_err(cdp_error)?
            .into_value::<String>()
            .context("navigator.userAgent was not a string")
    }

    async fn page_state(page: &Page) -> anyhow::Result<PageState> {
        let answer: String = page
            .evaluate(probe_expression().as_str())
            .await
            .map_err(cdp_error)?
            .into_value()
            .context("challenge probe returned a non-string")?;
        Ok(PageState::from_probe(&answer))
    }

    /// Poll until no challenge marker remains. Returns whether one was seen.
    async fn wait_for_challenge(page: &Page, limit: Duration) -> anyhow::Result<bool> {
        let deadline = Instant::now() + limit;
        let mut seen = false;

        loop {
            match Self::page_state(page).await? {
                PageState::AccessDenied => return Err(BackendFault::AccessDenied.into()),
                PageState::Clear => return Ok(seen),
                PageState::Loading => {}
                PageState::Challenge => {
                    if !seen {
                        info!("Challenge detected, waiting for it to clear");
                        seen = true;
                    }
                }
            }

            let Some(delay) = next_poll_delay(deadline) else {
                return Err(BackendFault::ChallengeTimeout(limit).into());
            };
            tokio::time::sleep(delay).await;
        }
    }

    async fn collect_solution(&self, page: &Page, request: &SolveRequest) -> anyhow::Result<Solution> {
        let url = page.url().await.map_err(cdp_error)?.unwrap_or_default();
        let cookies = page
            .get_cookies()
            .await
            .map_err(cdp_error)?
            .into_iter()
            .map(from_cdp_cookie)
            .collect();

        let response = if request.return_only_cookies {
            None
        } else {
            let html = page.content().await.map_err(cdp_error)?;
            if self.options.log_html {
                debug!(html = %html, "Response HTML");
            }
            Some(html)
        };

        Ok(Solution {
            url,
            // the main-frame response is not tracked
            status: 200,
            headers: HashMap::new(),
            response,
            cookies,
            user_agent: Self::user_agent_of(page).await?,
        })
    }

    async fn navigate_and_solve(&self, session: &CdpSession, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let page = &session.page;
        let target = request
            .url
            .as_ref()
            .ok_or_else(|| anyhow!("{} without a url", request.cmd))?;

        // cookies can only be set on a page of their domain
        if !request.cookies.is_empty() {
            page.goto(target.as_str()).await.map_err(cdp_error)?;
            let params = request
                .cookies
                .iter()
                .map(|cookie| to_cookie_param(cookie, target))
                .collect();
            page.set_cookies(params).await.map_err(cdp_error)?;
        }

        match (request.cmd, request.post_data.as_deref()) {
            (Command::RequestPost, Some(post_data)) => {
                let form = post_form_url(target, post_data);
                page.goto(form.as_str()).await.map_err(cdp_error)?;
            }
            _ => {
                page.goto(target.as_str()).await.map_err(cdp_error)?;
            }
        }

        let seen = Self::wait_for_challenge(page, request.max_timeout).await?;
        let solution = self.collect_solution(page, request).await?;
        Ok(Outcome::solved(solve_message(seen), solution))
    }

    async fn create_session(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let id = session_id_for(request);
        if self.sessions.contains(&id) {
            return Ok(Outcome::session("Session already exists.", id));
        }

        let session = self.launch(request.proxy.as_ref()).await?;
        self.sessions.insert(id.clone(), session);
        info!(session = %id, "Session created");
        Ok(Outcome::session("Session created successfully.", id))
    }

    async fn destroy_session(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let id = request.session.as_deref().unwrap_or_default();
        let session = self.sessions.remove(id).ok_or(BackendFault::SessionNotFound)?;
        session.close().await;
        info!(session = %id, "Session destroyed");
        Ok(Outcome::message("The session has been removed."))
    }

    async fn solve_request(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let Some(id) = request.session.as_deref() else {
            let session = self.launch(request.proxy.as_ref()).await?;
            let result = self.navigate_and_solve(&session, request).await;
            session.close().await;
            return result;
        };

        let session = match self.sessions.get_fresh(id, request.session_ttl) {
            Lookup::Fresh(session) => session,
            Lookup::Expired => {
                info!(session = %id, "Session expired, recreating it");
                if let Some(old) = self.sessions.remove(id) {
                    old.close().await;
                }
                let fresh = self.launch(request.proxy.as_ref()).await?;
                self.sessions.insert(id, fresh)
            }
            Lookup::Missing => {
                info!(session = %id, "Session not found, creating it");
                let fresh = self.launch(request.proxy.as_ref()).await?;
                self.sessions.insert(id, fresh)
            }
        };

        self.navigate_and_solve(&session, request).await
    }
}

#[async_trait(?Send)]
impl AsyncBackend for CdpBackend {
    async fn self_test(&self) -> anyhow::Result<String> {
        let session = self.launch(None).await.context("test browser failed to start")?;
        let reported = Self::user_agent_of(&session.page).await;
        session.close().await;

        let user_agent = normalize_user_agent(&reported.context("could not read the browser user agent")?);
        let _ = self.user_agent.set(user_agent.clone());
        Ok(user_agent)
    }

    async fn execute(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        match request.cmd {
            Command::SessionsCreate => self.create_session(request).await,
            Command::SessionsList => Ok(Outcome::sessions(self.sessions.ids())),
            Command::SessionsDestroy => self.destroy_session(request).await,
            Command::RequestGet | Command::RequestPost => self.solve_request(request).await,
        }
    }

    async fn shutdown(&self) {
        for (id, session) in self.sessions.drain() {
            debug!(session = %id, "Closing session on shutdown");
            session.close().await;
        }
    }
}

fn to_cookie_param(cookie: &Cookie, target: &Url) -> CookieParam {
    let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
    param.url = Some(target.to_string());
    param.domain = cookie.domain.clone();
    param.path = cookie.path.clone();
    param.secure = Some(cookie.secure);
    param.http_only = Some(cookie.http_only);
    param.expires = cookie.expiry.map(|at| TimeSinceEpoch::new(at as f64));
    param
}

fn from_cdp_cookie(cookie: CdpCookie) -> Cookie {
    Cookie {
        name: cookie.name,
        value: cookie.value,
        domain: Some(cookie.domain),
        path: Some(cookie.path),
        // session cookies report -1
        expiry: (cookie.expires > 0.0).then(|| cookie.expires as i64),
        http_only: cookie.http_only,
        secure: cookie.secure,
        same_site: cookie.same_site.map(|same_site| format!("{:?}", same_site)),
    }
}

/// Name the protocol failures the API has a code for.
fn cdp_error(err: CdpError) -> anyhow::Error {
    let text = err.to_string();
    match classify_cdp_message(&text) {
        Some(fault) => fault.into(),
        None => anyhow!("CDP error: {}", text),
    }
}

fn classify_cdp_message(text: &str) -> Option<BackendFault> {
    let lower = text.to_ascii_lowercase();
    if text.contains("net::ERR_") || lower.contains("timed out") || lower.contains("timeout") {
        Some(BackendFault::Navigation(text.to_string()))
    } else if lower.contains("channel")
        || lower.contains("websocket")
        || lower.contains("connection closed")
        || lower.contains("target closed")
    {
        Some(BackendFault::DriverCrash(text.to_string()))
    } else {
        None
    }
}
