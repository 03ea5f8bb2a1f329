//! Error types and error codes for the solver service

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::{fmt, time::Duration};
use thiserror::Error;

/// Error codes returned by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Invalid request parameters
    InvalidRequest,
    /// The browser or its driver died mid-request
    DriverCrash,
    /// Navigation to the target failed
    NavigationFailed,
    /// An expected element never showed up
    ElementTimeout,
    /// The challenge was still present when time ran out
    ChallengeTimeout,
    /// The site refused access outright
    AccessDenied,
    /// A session id that the backend does not know
    SessionNotFound,
    /// The solve exceeded `maxTimeout`
    Timeout,
    /// Content forwarding failed
    ForwardingFailed,
    /// Unknown/internal error
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InvalidRequest => write!(f, "INVALID_REQUEST"),
            ErrorCode::DriverCrash => write!(f, "DRIVER_CRASH"),
            ErrorCode::NavigationFailed => write!(f, "NAVIGATION_FAILED"),
            ErrorCode::ElementTimeout => write!(f, "ELEMENT_TIMEOUT"),
            ErrorCode::ChallengeTimeout => write!(f, "CHALLENGE_TIMEOUT"),
            ErrorCode::AccessDenied => write!(f, "ACCESS_DENIED"),
            ErrorCode::SessionNotFound => write!(f, "SESSION_NOT_FOUND"),
            ErrorCode::Timeout => write!(f, "TIMEOUT"),
            ErrorCode::ForwardingFailed => write!(f, "FORWARDING_FAILED"),
            ErrorCode::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Standard error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: ErrorCode,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}

/// Request-level error with HTTP status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub response: ErrorResponse,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            status,
            response: ErrorResponse::new(error, code),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, ErrorCode::InvalidRequest)
    }

    /// Solve exceeded its budget. Reported as a backend failure (500).
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(
                "Error: Error solving the challenge. Timeout after {:.1} seconds.",
                limit.as_secs_f64()
            ),
            ErrorCode::Timeout,
        )
    }

    pub fn backend(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, code)
    }

    pub fn forwarding(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            ErrorCode::ForwardingFailed,
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message,
            ErrorCode::Unknown,
        )
    }

    pub fn message(&self) -> &str {
        &self.response.error
    }

    pub fn code(&self) -> ErrorCode {
        self.response.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.response)).into_response()
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.response.code, self.response.error)
    }
}

impl std::error::Error for ApiError {}

/// A request field that failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::invalid_request(format!("Error: {}", err.message))
    }
}

/// Startup configuration problems. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown DRIVER '{0}', expected one of: webdriver, cdp")]
    UnknownBackend(String),

    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown TLS profile '{profile}', available: {}", .available.join(", "))]
    InvalidTlsProfile {
        profile: String,
        available: Vec<String>,
    },
}

/// Failures a browser backend knows how to name. Anything else a backend
/// returns is reported as [`ErrorCode::Unknown`].
#[derive(Debug, Error)]
pub enum BackendFault {
    #[error("the browser driver crashed: {0}")]
    DriverCrash(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("timed out waiting for element: {0}")]
    ElementTimeout(String),

    #[error("challenge was not solved within {0:?}")]
    ChallengeTimeout(Duration),

    #[error("Cloudflare has blocked this request. Probably your IP is banned for this site, check in your web browser.")]
    AccessDenied,

    #[error("This session does not exist.")]
    SessionNotFound,
}

impl BackendFault {
    pub fn code(&self) -> ErrorCode {
        match self {
            BackendFault::DriverCrash(_) => ErrorCode::DriverCrash,
            BackendFault::Navigation(_) => ErrorCode::NavigationFailed,
            BackendFault::ElementTimeout(_) => ErrorCode::ElementTimeout,
            BackendFault::ChallengeTimeout(_) => ErrorCode::ChallengeTimeout,
            BackendFault::AccessDenied => ErrorCode::AccessDenied,
            BackendFault::SessionNotFound => ErrorCode::SessionNotFound,
        }
    }
}

/// Classify a backend error into an API error.
///
/// Runs at the adapter boundary so nothing backend specific reaches the
/// HTTP layer.
pub fn classify_backend_error(err: &anyhow::Error) -> ApiError {
    let code = err
        .chain()
        .find_map(|cause| cause.downcast_ref::<BackendFault>())
        .map(BackendFault::code)
        .unwrap_or(ErrorCode::Unknown);

    ApiError::backend(
        code,
        format!("Error: Error solving the challenge. {:#}", err),
    )
}
