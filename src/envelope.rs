//! Response envelope for `/v1`
//!
//! Every solve outcome, whichever backend produced it, leaves through
//! [`build_envelope`].

use axum::http::StatusCode;
use chrono::Utc;

use crate::{
    error::ApiError,
    models::{Outcome, ResponseStatus, SolveResponse},
};

/// Milliseconds since the epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Wrap an outcome into the wire envelope and pick its HTTP status.
///
/// Success is 200 with a payload. Failures never carry a payload and use the
/// status assigned by the error; the hidden `error_500` flag is set exactly
/// when that status is a server error.
pub fn build_envelope(
    outcome: Result<Outcome, ApiError>,
    start_timestamp: i64,
    end_timestamp: i64,
) -> (StatusCode, SolveResponse) {
    let version = env!("CARGO_PKG_VERSION");

    match outcome {
        Ok(outcome) => (
            StatusCode::OK,
            SolveResponse {
                status: ResponseStatus::Ok,
                message: outcome.message,
                session: outcome.session,
                sessions: outcome.sessions,
                solution: outcome.solution,
                start_timestamp,
                end_timestamp,
                version,
                error_500: false,
            },
        ),
        Err(err) => {
            let status = err.status;
            (
                status,
                SolveResponse {
                    status: ResponseStatus::Error,
                    message: err.response.error,
                    session: None,
                    sessions: None,
                    solution: None,
                    start_timestamp,
                    end_timestamp,
                    version,
                    error_500: status.is_server_error(),
                },
            )
        }
    }
}
