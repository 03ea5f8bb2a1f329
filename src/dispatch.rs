//! Routes a validated request to the configured solver
//!
//! Requests naming the same session are run one at a time, and every solve
//! takes one of the global concurrency slots. Waiting for either comes out of
//! the request's `maxTimeout`.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::{
    sync::{OwnedMutexGuard, OwnedSemaphorePermit, Semaphore},
    time::{timeout_at, Instant},
};
use tracing::debug;

use crate::{
    error::{ApiError, ErrorCode},
    models::Outcome,
    solver::Solver,
    validation::{Command, SolveRequest},
};

type LockMap = HashMap<String, Arc<tokio::sync::Mutex<()>>>;

/// Per-session async mutexes, created on demand
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<Mutex<LockMap>>,
}

/// Held for the duration of one session-bound solve.
pub struct SessionGuard {
    id: String,
    locks: SessionLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        // release first so the count below sees only waiters
        drop(self.guard.take());

        let mut map = self.locks.map();
        if let Some(lock) = map.get(&self.id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(&self.id);
            }
        }
    }
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, LockMap> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn acquire(&self, id: &str) -> SessionGuard {
        let lock = self
            .map()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        SessionGuard {
            id: id.to_string(),
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    /// Sessions that currently have a holder or waiter.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a solve holds until the backend is really done with it.
///
/// The adapters move this into the backend work itself, so a solve that the
/// caller gave up on keeps its session and its slot until it stops.
#[derive(Default)]
pub struct Lease {
    _permit: Option<OwnedSemaphorePermit>,
    _session: Option<SessionGuard>,
}

/// Run `request` on `solver`, serializing per session id and bounded by
/// `semaphore`.
pub async fn dispatch(
    solver: &Solver,
    semaphore: &Arc<Semaphore>,
    locks: &SessionLocks,
    mut request: SolveRequest,
) -> Result<Outcome, ApiError> {
    let budget = request.max_timeout;
    let deadline = Instant::now() + budget;

    let session = match request.cmd {
        Command::SessionsList => None,
        _ => request.session.clone(),
    };

    let session = match session {
        Some(id) => match timeout_at(deadline, locks.acquire(&id)).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!(session = %id, "Gave up waiting for a busy session");
                return Err(ApiError::timeout(budget));
            }
        },
        None => None,
    };

    let permit = match timeout_at(deadline, semaphore.clone().acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return Err(ApiError::unknown("Service unavailable")),
        Err(_) => {
            debug!("Gave up waiting for a free solver slot");
            return Err(ApiError::timeout(budget));
        }
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(ApiError::timeout(budget));
    }
    request.max_timeout = remaining;

    let lease = Lease {
        _permit: Some(permit),
        _session: session,
    };

    // report against the caller's budget, not what was left of it
    solver.solve(request, lease).await.map_err(|err| match err.code() {
        ErrorCode::Timeout => ApiError::timeout(budget),
        _ => err,
    })
}
