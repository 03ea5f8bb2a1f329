//! Scriptable fake backends for tests
//!
//! Behaviour is picked by the target host:
//! `hang.test` never finishes, `panic.test` panics, `denied.test` fails with
//! an access-denied fault. Anything else echoes the URL after `latency`.

use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use url::Url;

use super::{AsyncBackend, SyncBackend};
use crate::{
    error::BackendFault,
    models::{Outcome, Solution},
    validation::{Command, SolveRequest},
};

pub const FAKE_USER_AGENT: &str = "FakeAgent/1.0";

pub fn get_request(url: &str, max_timeout_ms: u64) -> SolveRequest {
    SolveRequest::new(Command::RequestGet)
        .with_url(Url::parse(url).unwrap())
        .with_max_timeout(Duration::from_millis(max_timeout_ms))
}

/// Shared bookkeeping for both fakes
#[derive(Clone, Default)]
pub struct Tally {
    pub calls: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
    pub threads: Arc<Mutex<HashSet<ThreadId>>>,
    pub active: Arc<AtomicUsize>,
    pub max_active: Arc<AtomicUsize>,
    pub release: Arc<AtomicBool>,
}

impl Tally {
    fn enter(&self) -> Active<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.threads.lock().unwrap().insert(thread::current().id());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        Active(self)
    }
}

/// Counts as in flight until dropped, including on cancel or panic
struct Active<'a>(&'a Tally);

impl Drop for Active<'_> {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Script {
    Hang,
    Panic,
    Denied,
    Echo,
}

fn script_for(request: &SolveRequest) -> Script {
    match request.url.as_ref().and_then(|u| u.host_str()) {
        Some("hang.test") => Script::Hang,
        Some("panic.test") => Script::Panic,
        Some("denied.test") => Script::Denied,
        _ => Script::Echo,
    }
}

fn echo(request: &SolveRequest) -> Outcome {
    match request.cmd {
        Command::SessionsList => Outcome::sessions(Vec::new()),
        Command::SessionsCreate | Command::SessionsDestroy => {
            Outcome::session("ok", request.session.clone().unwrap_or_default())
        }
        Command::RequestGet | Command::RequestPost => Outcome::solved(
            "Challenge not detected!",
            Solution {
                url: request.url.as_ref().map(Url::to_string).unwrap_or_default(),
                status: 200,
                headers: HashMap::new(),
                response: Some("<html></html>".to_string()),
                cookies: Vec::new(),
                user_agent: FAKE_USER_AGENT.to_string(),
            },
        ),
    }
}

pub struct FakeSyncBackend {
    latency: Duration,
    tally: Tally,
    pub calls: Arc<AtomicUsize>,
    pub threads: Arc<Mutex<HashSet<ThreadId>>>,
    pub release: Arc<AtomicBool>,
}

impl FakeSyncBackend {
    pub fn new(latency: Duration) -> Self {
        let tally = Tally::default();
        Self {
            latency,
            calls: tally.calls.clone(),
            threads: tally.threads.clone(),
            release: tally.release.clone(),
            tally,
        }
    }

    pub fn tally(&self) -> Tally {
        self.tally.clone()
    }
}

impl SyncBackend for FakeSyncBackend {
    fn self_test(&self) -> anyhow::Result<String> {
        Ok(FAKE_USER_AGENT.to_string())
    }

    fn execute(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let _active = self.tally.enter();
        match script_for(request) {
            Script::Hang => {
                // parked until the test releases it, capped so a forgotten
                // release cannot stall the test binary
                let parked = Instant::now();
                while !self.release.load(Ordering::SeqCst) && parked.elapsed() < Duration::from_secs(5) {
                    thread::sleep(Duration::from_millis(10));
                }
                Err(anyhow::anyhow!("released"))
            }
            Script::Panic => panic!("driver exploded"),
            Script::Denied => Err(BackendFault::AccessDenied.into()),
            Script::Echo => {
                thread::sleep(self.latency);
                Ok(echo(request))
            }
        }
    }

    fn shutdown(&self) {
        self.tally.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeAsyncBackend {
    latency: Duration,
    tally: Tally,
    pub calls: Arc<AtomicUsize>,
    pub threads: Arc<Mutex<HashSet<ThreadId>>>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl FakeAsyncBackend {
    pub fn new(latency: Duration) -> Self {
        let tally = Tally::default();
        Self {
            latency,
            calls: tally.calls.clone(),
            threads: tally.threads.clone(),
            shutdowns: tally.shutdowns.clone(),
            tally,
        }
    }

    pub fn tally(&self) -> Tally {
        self.tally.clone()
    }
}

#[async_trait(?Send)]
impl AsyncBackend for FakeAsyncBackend {
    async fn self_test(&self) -> anyhow::Result<String> {
        Ok(FAKE_USER_AGENT.to_string())
    }

    async fn execute(&self, request: &SolveRequest) -> anyhow::Result<Outcome> {
        let _active = self.tally.enter();
        match script_for(request) {
            Script::Hang => std::future::pending().await,
            Script::Panic => panic!("event loop task exploded"),
            Script::Denied => Err(BackendFault::AccessDenied.into()),
            Script::Echo => {
                tokio::time::sleep(self.latency).await;
                Ok(echo(request))
            }
        }
    }

    async fn shutdown(&self) {
        self.tally.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}
