//! Clearance - browser challenge solving service
//!
//! An HTTP API that drives a real browser through anti-bot challenge pages
//! and hands the resulting cookies, user agent and HTML back to the caller.

mod backend;
mod config;
mod dispatch;
mod envelope;
mod error;
mod forward;
mod handlers;
mod metrics;
mod models;
mod solver;
mod validation;

use anyhow::Context;
use axum::Router;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    config::Config,
    handlers::{router, AppState},
    metrics::Metrics,
    solver::Solver,
};

/// How long in-flight work may keep the runtime alive after the server stops
const RUNTIME_DRAIN: Duration = Duration::from_secs(10);

/// Browser protocol crates are chatty below warn
const QUIET_CRATES: &str = "chromiumoxide=warn,tungstenite=warn,hyper=warn,reqwest=warn";

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if config.is_verbose() {
            EnvFilter::new(&config.log_level)
        } else {
            EnvFilter::new(format!("{},{}", config.log_level, QUIET_CRATES))
        }
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_thread_ids(config.is_verbose()))
        .init();
}

// Not #[tokio::main]: the WebDriver backend's blocking client must be built
// and self-tested outside any runtime.
fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let config = Config::from_env()?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.host,
        port = config.port,
        driver = %config.driver,
        headless = config.headless,
        max_concurrent = config.max_concurrent,
        prometheus = config.prometheus_enabled,
        server_timeout = config.server_timeout,
        max_request_body_size = config.max_request_body_size,
        "Starting Clearance"
    );

    let metrics = match config.metrics_addr() {
        Some(addr) => Some((addr, Metrics::new().context("failed to register metrics")?)),
        None => None,
    };

    let solver = Arc::new(Solver::start(&config)?);

    // fatal on failure
    let user_agent = match solver.self_test_blocking() {
        Ok(user_agent) => user_agent,
        Err(e) => {
            error!(error = %format!("{:#}", e), "Browser self-test failed");
            solver.shutdown();
            return Err(e.context("browser self-test failed"));
        }
    };
    info!(user_agent = %user_agent, "Browser self-test passed");

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            solver.shutdown();
            return Err(anyhow::Error::new(e).context("failed to build the server runtime"));
        }
    };

    let addr = config.bind_addr();
    let mut state = AppState::new(config, solver.clone(), user_agent);
    if let Some((_, metrics)) = &metrics {
        state = state.with_metrics(metrics.clone());
    }
    let served = runtime.block_on(serve(addr, router(state), metrics));

    runtime.shutdown_timeout(RUNTIME_DRAIN);
    solver.shutdown();

    info!("Server shutdown complete");
    served
}

async fn serve(addr: SocketAddr, app: Router, metrics: Option<(SocketAddr, Metrics)>) -> anyhow::Result<()> {
    if let Some((metrics_addr, metrics)) = metrics {
        tokio::spawn(async move {
            if let Err(e) = crate::metrics::serve(metrics_addr, metrics).await {
                error!(error = %format!("{:#}", e), "Metrics listener failed");
            }
        });
    }

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    info!(address = %addr, "Server listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Wait for shutdown signals (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}
