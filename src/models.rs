//! Request and Response models for the solver API

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::forward::ForwardedHeaders;

/// Upstream proxy the browser should route through
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Format: http://host:port or socks5://host:port
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Browser cookie, accepted in requests and returned in solutions
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Seconds since the epoch; absent for session cookies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<i64>,

    #[serde(default)]
    pub http_only: bool,

    #[serde(default)]
    pub secure: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl Cookie {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expiry: None,
            http_only: false,
            secure: false,
            same_site: None,
        }
    }
}

/// What the browser ended up with after the challenge
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Solution {
    /// Final URL after redirects
    pub url: String,

    /// HTTP status observed by the browser
    pub status: u16,

    pub headers: HashMap<String, String>,

    /// Page source; `null` when only cookies were requested
    pub response: Option<String>,

    pub cookies: Vec<Cookie>,

    pub user_agent: String,
}

/// Successful result of one command, before it is wrapped in an envelope
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    pub message: String,
    pub session: Option<String>,
    pub sessions: Option<Vec<String>>,
    pub solution: Option<Solution>,
}

impl Outcome {
    pub fn solved(message: impl Into<String>, solution: Solution) -> Self {
        Self {
            message: message.into(),
            solution: Some(solution),
            ..Self::default()
        }
    }

    pub fn session(message: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            session: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn sessions(ids: Vec<String>) -> Self {
        Self {
            sessions: Some(ids),
            ..Self::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Uniform envelope for every `/v1` call
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveResponse {
    pub status: ResponseStatus,

    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub solution: Option<Solution>,

    /// Milliseconds since the epoch
    pub start_timestamp: i64,

    pub end_timestamp: i64,

    pub version: &'static str,

    /// Selects the 500 status; never serialized
    #[serde(skip)]
    pub error_500: bool,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self { status: "ok" }
    }
}

/// Welcome response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexResponse {
    pub msg: &'static str,
    pub version: &'static str,
    pub user_agent: String,
}

impl IndexResponse {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            msg: "Clearance is ready!",
            version: env!("CARGO_PKG_VERSION"),
            user_agent: user_agent.into(),
        }
    }
}

/// Body for unmatched routes
#[derive(Debug, Serialize)]
pub struct NotFoundResponse {
    pub error: String,
    pub status_code: u16,
}

/// Query string of `GET /content`
#[derive(Debug, Deserialize)]
pub struct ContentQuery {
    pub url: Option<String>,
}

/// Body of a successful `GET /content`
#[derive(Debug, Serialize)]
pub struct ContentResponse {
    pub message: &'static str,
    pub target_url: String,
    pub received_headers: ForwardedHeaders,
    pub status: u16,
    pub external_api_response: String,
}
