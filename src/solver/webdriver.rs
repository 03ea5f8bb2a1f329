//! Blocking backend speaking W3C WebDriver to a chromedriver endpoint
//!
//! Every browser interaction is a synchronous HTTP round trip, so one solve
//! holds its thread for as long as the page takes.

use anyhow::{anyhow, Context};
use reqwest::{blocking::Client, Method};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    challenge::{next_poll_delay, probe_expression, solve_message, PageState},
    normalize_user_agent, post_form_url, session_id_for,
    session::{Lookup, SessionStore},
    BrowserOptions, SyncBackend,
};
use crate::{
    error::BackendFault,
    models::{Cookie, Outcome, ProxyConfig, Solution},
    validation::{Command, SolveRequest},
};

/// Upper bound for a single driver round trip
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// A live remote browser
pub struct WebDriverSession {
    id: String,
}

pub struct WebDriverBackend {
    client: Client,
    base: Url,
    options: BrowserOptions,
    /// Learned during the self-test and pinned on every later browser
    user_agent: OnceLock<String>,
    sessions: SessionStore<WebDriverSession>,
}

impl WebDriverBackend {
    pub fn new(base: Url, options: BrowserOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(COMMAND_TIMEOUT)
            .build()
            .context("failed to build the WebDriver client")?;

        Ok(Self {
            client,
            base: with_trailing_slash(base),
            options,
            user_agent: OnceLock::new(),
            sessions: SessionStore::new(),
        })
    }

    fn command(&self, method: Method, path: &str, body: Option<Value>) -> anyhow::Result<Value> {
        let url = self
            .base
            .join(path)
            .with_context(|| format!("invalid WebDriver path '{}'", path))?;

        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .map_err(|e| BackendFault::DriverCrash(format!("WebDriver endpoint unreachable: {}", e)))?;
        let status = response.status();
        let payload: Value = response
            .json()
            .map_err(|e| BackendFault::DriverCrash(format!("unreadable WebDriver response: {}", e)))?;

        let value = match payload {
            Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
            other => other,
        };

        if !status.is_success() || value.get("error").is_some() {
            return Err(driver_error(&value));
        }
        Ok(value)
    }

    fn open(&self, proxy: Option<&ProxyConfig>) -> anyhow::Result<WebDriverSession> {
        if let Some(proxy) = proxy {
            if proxy.username.is_some() || proxy.password.is_some() {
                warn!("Proxy credentials are not supported by the WebDriver backend, ignoring them");
            }
        }

        let caps = capabilities(&self.options, proxy, self.user_agent.get().map(String::as_str));
        let value = self.command(Method::POST, "session", Some(caps))?;
        let id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendFault::DriverCrash("new session response carried no sessionId".to_string()))?
            .to_string();

        debug!(webdriver_session = %id, "Browser started");
        Ok(WebDriverSession { id })
    }

    fn close(&self, session: &WebDriverSession) {
        match self.command(Method::DELETE, &format!("session/{}", session.id), None) {
            Ok(_) => debug!(webdriver_session = %session.id, "Browser closed"),
            Err(e) => warn!(webdriver_session = %session.id, error = %format!("{:#}", e), "Failed to close browser"),
        }
    }

    fn session_path(session: &WebDriverSession, tail: &str) -> String {
        format!("session/{}/{}", session.id, tail)
    }

    fn navigate(&self, session: &WebDriverSession, url: &str) -> anyhow::Result<()> {
        self.command(
            Method::POST,
            &Self::session_path(session, "url"),
            Some(json!({ "url": url })),
        )?;
        Ok(())
    }

    fn run_script(&self, session: &WebDriverSession, script: &str) -> anyhow::Result<Value> {
        self.command(
            Method::POST,
            &Self::session_path(session, "execute/sync"),
            Some(json!({ "script": script, "args": [] })),
        )
    }

    fn user_agent_of(&self, session: &WebDriverSession) -> anyhow::Result<String> {
        let value = self.run_script(session, "return navigator.userAgent;")?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("navigator.userAgent was not a string"))
    }

    fn page_state(&self, session: &WebDriverSession) -> anyhow::Result<PageState> {
        let value = self.run_script(session, &format!("return {};", probe_expression()))?;
        Ok(PageState::from_probe(value.as_str().unwrap_or_default()))
    }

    /// Poll until no challenge marker remains. Returns whether one was seen.
    fn wait_for_challenge(&self, session: &WebDriverSession, limit: Duration) -> anyhow::Result<bool> {
        let deadline = Instant::now() + limit;
        let mut seen = false;

        loop {
            match self.page_state(session)? {
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
            thread::sleep(delay);
        }
    }

    fn add_cookie(&self, session: &WebDriverSession, cookie: &Cookie) -> anyhow::Result<()> {
        self.command(
            Method::POST,
            &Self::session_path(session, "cookie"),
            Some(json!({ "cookie": cookie })),
        )?;
        Ok(())
    }

    fn collect_solution(&self, session: &WebDriverSession, request: &SolveRequest) -> anyhow::Result<Solution> {
        let url = self.command(Method::GET, &Self::session_path(session, "url"), None)?;
        let cookies = self.command(Method::GET, &Self::session_path(session, "cookie"), None)?;
        let cookies: Vec<Cookie> = serde_json::from_value(cookies).context("unexpected cookie list shape")?;

        let response = if request.return_only_cookies {
            None
        } else {
            let source = self.command(Method::GET, &Self::session_path(session, "source"), None)?;
            let html = source.as_str().unwrap_or_default().to_string();
            if self.options.log_html {
                debug!(html = %html, "Response HTML");
            }
            Some(html)
        };

        Ok(Solution {
            url: url.as_str().unwrap_or_default().to_string(),
            // WebDriver exposes neither the status line nor the headers
            status: 200,
            headers: HashMap::new(),
            response,
            cookies,
            user_agent: self.user_agent_of(session)?,
        })
    }

    fn navigate_and_solve(&self, session: &WebDriverSession, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let target = request
            .url
            .as_ref()
            .ok_or_else(|| anyhow!("{} without a url", request.cmd))?;

        self.command(
            Method::POST,
            &Self::session_path(session, "timeouts"),
            Some(json!({ "pageLoad": request.max_timeout.as_millis() as u64 })),
        )?;

        // cookies can only be set on a page of their domain
        if !request.cookies.is_empty() {
            self.navigate(session, target.as_str())?;
            for cookie in &request.cookies {
                self.add_cookie(session, cookie)?;
            }
        }

        match (request.cmd, request.post_data.as_deref()) {
            (Command::RequestPost, Some(post_data)) => {
                self.navigate(session, &post_form_url(target, post_data))?
            }
            _ => self.navigate(session, target.as_str())?,
        }

        let seen = self.wait_for_challenge(session, request.max_timeout)?;
        let solution = self.collect_solution(session, request)?;
        Ok(Outcome::solved(solve_message(seen), solution))
    }

    fn create_session(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let id = session_id_for(request);
        if self.sessions.contains(&id) {
            return Ok(Outcome::session("Session already exists.", id));
        }

        let session = self.open(request.proxy.as_ref())?;
        self.sessions.insert(id.clone(), session);
        info!(session = %id, "Session created");
        Ok(Outcome::session("Session created successfully.", id))
    }

    fn destroy_session(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let id = request.session.as_deref().unwrap_or_default();
        let session = self.sessions.remove(id).ok_or(BackendFault::SessionNotFound)?;
        self.close(&session);
        info!(session = %id, "Session destroyed");
        Ok(Outcome::message("The session has been removed."))
    }

    fn solve_request(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let Some(id) = request.session.as_deref() else {
            let session = self.open(request.proxy.as_ref())?;
            let result = self.navigate_and_solve(&session, request);
            self.close(&session);
            return result;
        };

        let session = match self.sessions.get_fresh(id, request.session_ttl) {
            Lookup::Fresh(session) => session,
            Lookup::Expired => {
                info!(session = %id, "Session expired, recreating it");
                if let Some(old) = self.sessions.remove(id) {
                    self.close(&old);
                }
                self.sessions.insert(id, self.open(request.proxy.as_ref())?)
            }
            Lookup::Missing => {
                info!(session = %id, "Session not found, creating it");
                self.sessions.insert(id, self.open(request.proxy.as_ref())?)
            }
        };

        self.navigate_and_solve(&session, request)
    }
}

impl SyncBackend for WebDriverBackend {
    fn self_test(&self) -> anyhow::Result<String> {
        let session = self.open(None).context("test browser failed to start")?;
        let reported = self.user_agent_of(&session);
        self.close(&session);

        let user_agent = normalize_user_agent(&reported.context("could not read the browser user agent")?);
        let _ = self.user_agent.set(user_agent.clone());
        Ok(user_agent)
    }

    fn execute(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        match request.cmd {
            Command::SessionsCreate => self.create_session(request),
            Command::SessionsList => Ok(Outcome::sessions(self.sessions.ids())),
            Command::SessionsDestroy => self.destroy_session(request),
            Command::RequestGet | Command::RequestPost => self.solve_request(request),
        }
    }

    fn shutdown(&self) {
        for (id, session) in self.sessions.drain() {
            debug!(session = %id, "Closing session on shutdown");
            self.close(&session);
        }
    }
}

fn with_trailing_slash(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base
}

/// New-session payload for chromedriver.
fn capabilities(options: &BrowserOptions, proxy: Option<&ProxyConfig>, user_agent: Option<&str>) -> Value {
    let mut args = vec![
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--window-size=1920,1080".to_string(),
    ];
    if options.headless {
        args.push("--headless=new".to_string());
    }
    if let Some(proxy) = proxy {
        args.push(format!("--proxy-server={}", proxy.url));
    }
    if let Some(user_agent) = user_agent {
        args.push(format!("--user-agent={}", user_agent));
    }

    json!({
        "capabilities": {
            "alwaysMatch": {
                "browserName": "chrome",
                "goog:chromeOptions": { "args": args }
            }
        }
    })
}

/// Map a W3C error payload onto the faults the API knows how to name.
fn driver_error(value: &Value) -> anyhow::Error {
    let code = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    // chromedriver appends a stack trace after the first line
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .and_then(|m| m.lines().next())
        .unwrap_or_default();
    let detail = format!("{}: {}", code, message);

    let fault = match code {
        "no such element" => BackendFault::ElementTimeout(detail),
        "invalid session id" | "session not created" => BackendFault::DriverCrash(detail),
        "timeout" | "script timeout" => BackendFault::Navigation(detail),
        _ if message.contains("chrome not reachable") || message.contains("disconnected") => {
            BackendFault::DriverCrash(detail)
        }
        _ if message.contains("net::ERR_") => BackendFault::Navigation(detail),
        _ => return anyhow!("WebDriver {}", detail),
    };
    fault.into()
}
