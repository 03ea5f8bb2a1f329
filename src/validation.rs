//! Request validation: raw JSON into a typed [`SolveRequest`]

use serde_json::{Map, Value};
use std::{fmt, time::Duration};
use url::Url;

use crate::{
    error::ValidationError,
    models::{Cookie, ProxyConfig},
};

/// Applied when `maxTimeout` is absent
pub const DEFAULT_MAX_TIMEOUT_MS: u64 = 60_000;

/// Allowed URL schemes for navigation targets
const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Allowed URL schemes for browser proxies
const PROXY_SCHEMES: &[&str] = &["http", "https", "socks4", "socks5"];

/// Operations accepted by `POST /v1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SessionsCreate,
    SessionsList,
    SessionsDestroy,
    RequestGet,
    RequestPost,
}

impl Command {
    pub fn parse(cmd: &str) -> Option<Self> {
        match cmd {
            "sessions.create" => Some(Command::SessionsCreate),
            "sessions.list" => Some(Command::SessionsList),
            "sessions.destroy" => Some(Command::SessionsDestroy),
            "request.get" => Some(Command::RequestGet),
            "request.post" => Some(Command::RequestPost),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::SessionsCreate => "sessions.create",
            Command::SessionsList => "sessions.list",
            Command::SessionsDestroy => "sessions.destroy",
            Command::RequestGet => "request.get",
            Command::RequestPost => "request.post",
        }
    }

    /// Commands that drive a browser page
    pub fn is_navigation(&self) -> bool {
        matches!(self, Command::RequestGet | Command::RequestPost)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated solve call
#[derive(Debug, Clone)]
pub struct SolveRequest {
    pub cmd: Command,
    /// Always present for `request.*`
    pub url: Option<Url>,
    pub session: Option<String>,
    pub session_ttl: Option<Duration>,
    pub max_timeout: Duration,
    pub cookies: Vec<Cookie>,
    pub proxy: Option<ProxyConfig>,
    /// Form-encoded body; always present for `request.post`
    pub post_data: Option<String>,
    pub return_only_cookies: bool,
}

impl SolveRequest {
    /// Bare request with defaults for every optional field.
    pub fn new(cmd: Command) -> Self {
        Self {
            cmd,
            url: None,
            session: None,
            session_ttl: None,
            max_timeout: Duration::from_millis(DEFAULT_MAX_TIMEOUT_MS),
            cookies: Vec::new(),
            proxy: None,
            post_data: None,
            return_only_cookies: false,
        }
    }

    #[cfg(test)]
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    #[cfg(test)]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    #[cfg(test)]
    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }
}

/// Validate the body of a `POST /v1` call.
///
/// Fails with the first offending field; never touches a backend.
pub fn parse_solve_request(raw: &Value) -> Result<SolveRequest, ValidationError> {
    let obj = raw
        .as_object()
        .ok_or_else(|| ValidationError::new("body", "Request body must be a JSON object."))?;

    let cmd_str = optional_str(obj, "cmd")?
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::new("cmd", "Request parameter 'cmd' is mandatory."))?;
    let cmd = Command::parse(cmd_str).ok_or_else(|| {
        ValidationError::new(
            "cmd",
            format!("Request parameter 'cmd' = '{}' is invalid.", cmd_str),
        )
    })?;

    let mut request = SolveRequest::new(cmd);

    request.session = optional_str(obj, "session")?
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    request.session_ttl = match optional_positive_int(obj, "session_ttl_minutes")? {
        Some(minutes) => Some(minutes.checked_mul(60).map(Duration::from_secs).ok_or_else(|| {
            ValidationError::new(
                "session_ttl_minutes",
                "Request parameter 'session_ttl_minutes' is too large.",
            )
        })?),
        None => None,
    };
    if let Some(ms) = optional_positive_int(obj, "maxTimeout")? {
        request.max_timeout = Duration::from_millis(ms);
    }
    request.return_only_cookies = optional_bool(obj, "returnOnlyCookies")?.unwrap_or(false);
    request.post_data = optional_str(obj, "postData")?.map(str::to_string);
    request.proxy = parse_proxy(obj)?;
    request.cookies = parse_cookies(obj)?;

    if cmd.is_navigation() {
        let url = optional_str(obj, "url")?
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ValidationError::new(
                    "url",
                    format!("Request parameter 'url' is mandatory in '{}' command.", cmd),
                )
            })?;
        request.url = Some(validate_url(url)?);
    }

    match cmd {
        Command::RequestGet if request.post_data.is_some() => {
            return Err(ValidationError::new(
                "postData",
                "Cannot use 'postData' when sending a GET request.",
            ));
        }
        Command::RequestPost if request.post_data.is_none() => {
            return Err(ValidationError::new(
                "postData",
                "Request parameter 'postData' is mandatory in 'request.post' command.",
            ));
        }
        Command::SessionsDestroy if request.session.is_none() => {
            return Err(ValidationError::new(
                "session",
                "Request parameter 'session' is mandatory in 'sessions.destroy' command.",
            ));
        }
        _ => {}
    }

    Ok(request)
}

/// Validate a navigation target
///
/// Checks:
/// 1. URL parses
/// 2. Scheme is http or https
/// 3. There is a hostname
pub fn validate_url(url_str: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(url_str).map_err(|e| {
        ValidationError::new("url", format!("Request parameter 'url' is invalid: {}", e))
    })?;

    let scheme = url.scheme().to_lowercase();
    if !ALLOWED_SCHEMES.contains(&scheme.as_str()) {
        return Err(ValidationError::new(
            "url",
            format!(
                "URL scheme '{}' not allowed. Only http and https are permitted.",
                scheme
            ),
        ));
    }

    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::new(
            "url",
            "URL must have a valid hostname.",
        ));
    }

    Ok(url)
}

fn parse_proxy(obj: &Map<String, Value>) -> Result<Option<ProxyConfig>, ValidationError> {
    let value = match obj.get("proxy") {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    let proxy: ProxyConfig = serde_json::from_value(value.clone()).map_err(|_| {
        ValidationError::new(
            "proxy",
            "Request parameter 'proxy' must be an object with a 'url' string.",
        )
    })?;

    let parsed = Url::parse(&proxy.url).map_err(|e| {
        ValidationError::new("proxy", format!("Proxy URL is invalid: {}", e))
    })?;
    if !PROXY_SCHEMES.contains(&parsed.scheme()) {
        return Err(ValidationError::new(
            "proxy",
            format!("Proxy scheme '{}' is not supported.", parsed.scheme()),
        ));
    }

    Ok(Some(proxy))
}

fn parse_cookies(obj: &Map<String, Value>) -> Result<Vec<Cookie>, ValidationError> {
    match obj.get("cookies") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|_| {
            ValidationError::new(
                "cookies",
                "Request parameter 'cookies' must be a list of objects with 'name' and 'value'.",
            )
        }),
    }
}

fn optional_str<'a>(
    obj: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Option<&'a str>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(ValidationError::new(
            field,
            format!("Request parameter '{}' must be a string.", field),
        )),
    }
}

fn optional_positive_int(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<u64>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(v) if v > 0 => Ok(Some(v as u64)),
            _ => Err(ValidationError::new(
                field,
                format!("Request parameter '{}' must be a positive integer.", field),
            )),
        },
        Some(_) => Err(ValidationError::new(
            field,
            format!("Request parameter '{}' must be a positive integer.", field),
        )),
    }
}

fn optional_bool(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<bool>, ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ValidationError::new(
            field,
            format!("Request parameter '{}' must be a boolean.", field),
        )),
    }
}

/// Sanitize a URL for logging by removing credentials
pub fn sanitize_url_for_logging(url_str: &str) -> String {
    match Url::parse(url_str) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                let _ = url.set_username("***");
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "[invalid URL]".to_string(),
    }
}
