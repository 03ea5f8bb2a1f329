//! Asynchronous solve adapter
//!
//! The event-loop backend runs on one dedicated OS thread that owns a
//! current-thread runtime and a [`LocalSet`]. Handlers submit work over a
//! channel and wait on a one-shot reply:
//!
//! ```text
//! handler task ──Job::Solve──▶ solver-loop thread
//!      ▲                         spawn_local(timeout(maxTimeout, backend.execute))
//!      └──────── oneshot reply ◀─┘
//! ```
//!
//! Each submission is its own local task, so a timeout, panic, or caller
//! disconnect only ever drops that task. The loop keeps serving.

use anyhow::Context;
use std::{
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};
use tokio::{
    runtime::{self, Runtime},
    sync::{mpsc, oneshot},
    task::LocalSet,
};
use tracing::{debug, error, warn};

use super::AsyncBackend;
use crate::{
    dispatch::Lease,
    error::{classify_backend_error, ApiError},
    models::Outcome,
    validation::SolveRequest,
};

/// How long past `maxTimeout` a caller waits for the loop to answer
const REPLY_GRACE: Duration = Duration::from_secs(2);

/// Upper bound for the startup browser round trip
const SELF_TEST_TIMEOUT: Duration = Duration::from_secs(120);

type Reply<T> = oneshot::Sender<Result<T, ApiError>>;

enum Job {
    Solve {
        request: SolveRequest,
        lease: Lease,
        reply: Reply<Outcome>,
    },
    SelfTest {
        reply: oneshot::Sender<anyhow::Result<String>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Handle to the solver event loop
pub struct AsyncAdapter {
    jobs: mpsc::UnboundedSender<Job>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl AsyncAdapter {
    /// Spawn the loop thread and hand it the backend.
    pub fn start(backend: impl AsyncBackend + 'static) -> anyhow::Result<Self> {
        let backend: Arc<dyn AsyncBackend> = Arc::new(backend);
        let (jobs, rx) = mpsc::unbounded_channel();

        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .thread_name("solver-loop")
            .build()
            .context("failed to build the solver event loop")?;

        let worker = thread::Builder::new()
            .name("solver-loop".to_string())
            .spawn(move || run_loop(runtime, backend, rx))
            .context("failed to spawn the solver event loop thread")?;

        Ok(Self {
            jobs,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Submit one solve and wait for its reply. The loop task owns `lease`.
    pub async fn solve(&self, request: SolveRequest, lease: Lease) -> Result<Outcome, ApiError> {
        let limit = request.max_timeout;
        let (reply, rx) = oneshot::channel();

        self.jobs
            .send(Job::Solve { request, lease, reply })
            .map_err(|_| ApiError::unknown("Error: The solver event loop is not running."))?;

        // Dropping `rx` on expiry tells the loop to abandon the task.
        match tokio::time::timeout(limit + REPLY_GRACE, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::unknown(
                "Error: Error solving the challenge. The solver task was aborted.",
            )),
            Err(_) => Err(ApiError::timeout(limit)),
        }
    }

    /// Run the backend self-test from a thread outside any runtime.
    pub fn self_test_blocking(&self) -> anyhow::Result<String> {
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::SelfTest { reply })
            .map_err(|_| anyhow::anyhow!("the solver event loop is not running"))?;
        rx.blocking_recv()
            .context("the solver event loop stopped during the self-test")?
    }

    /// Close every browser and stop the loop thread. Blocks.
    pub fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.jobs.send(Job::Shutdown { done }).is_ok() {
            let _ = rx.blocking_recv();
        }

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Solver event loop thread panicked");
            }
        }
    }
}

fn run_loop(
    runtime: Runtime,
    backend: Arc<dyn AsyncBackend>,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    let local = LocalSet::new();

    local.block_on(&runtime, async move {
        let mut shutdown_ack = None;

        while let Some(job) = jobs.recv().await {
            match job {
                Job::Solve { request, lease, reply } => {
                    tokio::task::spawn_local(run_solve(backend.clone(), request, lease, reply));
                }
                Job::SelfTest { reply } => {
                    let backend = backend.clone();
                    tokio::task::spawn_local(async move {
                        let result = tokio::time::timeout(SELF_TEST_TIMEOUT, backend.self_test())
                            .await
                            .unwrap_or_else(|_| {
                                Err(anyhow::anyhow!(
                                    "self-test timed out after {:?}",
                                    SELF_TEST_TIMEOUT
                                ))
                            });
                        let _ = reply.send(result);
                    });
                }
                Job::Shutdown { done } => {
                    shutdown_ack = Some(done);
                    break;
                }
            }
        }

        backend.shutdown().await;
        if let Some(done) = shutdown_ack {
            let _ = done.send(());
        }
        debug!("Solver event loop stopped");
    });
}

async fn run_solve(
    backend: Arc<dyn AsyncBackend>,
    request: SolveRequest,
    lease: Lease,
    mut reply: Reply<Outcome>,
) {
    let _lease = lease;
    let limit = request.max_timeout;

    let work = async {
        match tokio::time::timeout(limit, backend.execute(&request)).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => {
                error!(cmd = %request.cmd, error = %format!("{:#}", err), "Backend failed");
                Err(classify_backend_error(&err))
            }
            Err(_) => {
                warn!(cmd = %request.cmd, timeout_ms = limit.as_millis() as u64, "Solve timed out, task cancelled");
                Err(ApiError::timeout(limit))
            }
        }
    };

    let result = tokio::select! {
        result = work => Some(result),
        _ = reply.closed() => None,
    };

    match result {
        Some(result) => {
            let _ = reply.send(result);
        }
        None => debug!(cmd = %request.cmd, "Caller went away, solve abandoned"),
    }
}
