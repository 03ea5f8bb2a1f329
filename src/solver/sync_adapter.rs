//! Synchronous solve adapter

use std::sync::Arc;
use tracing::{error, warn};

use super::SyncBackend;
use crate::{
    dispatch::Lease,
    error::{classify_backend_error, ApiError},
    models::Outcome,
    validation::SolveRequest,
};

/// Runs a [`SyncBackend`] and translates whatever it raises.
#[derive(Clone)]
pub struct SyncAdapter {
    backend: Arc<dyn SyncBackend>,
}

impl SyncAdapter {
    pub fn new(backend: impl SyncBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn self_test(&self) -> anyhow::Result<String> {
        self.backend.self_test()
    }

    /// Solve on the calling thread. Blocks for the whole browser interaction.
    pub fn solve_blocking(&self, request: &SolveRequest) -> Result<Outcome, ApiError> {
        self.backend.execute(request).map_err(|err| {
            error!(cmd = %request.cmd, error = %format!("{:#}", err), "Backend failed");
            classify_backend_error(&err)
        })
    }

    /// Solve on a blocking-pool thread, bounded by `maxTimeout`.
    ///
    /// On expiry the worker thread is abandoned, not interrupted; the
    /// backend's own deadline is what eventually frees it. The worker keeps
    /// `lease` until then.
    pub async fn solve(&self, request: SolveRequest, lease: Lease) -> Result<Outcome, ApiError> {
        let limit = request.max_timeout;
        let cmd = request.cmd;
        let adapter = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _lease = lease;
            adapter.solve_blocking(&request)
        });

        match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(cmd = %cmd, error = %join_error, "Solver thread crashed");
                Err(ApiError::unknown(
                    "Error: Error solving the challenge. The solver thread crashed.",
                ))
            }
            Err(_) => {
                warn!(cmd = %cmd, timeout_ms = limit.as_millis() as u64, "Solve timed out, abandoning worker");
                Err(ApiError::timeout(limit))
            }
        }
    }

    pub fn shutdown(&self) {
        self.backend.shutdown();
    }
}
