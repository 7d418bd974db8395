//! clidock daemon entry point.

use std::sync::Arc;

use log::{error, info, warn};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use clidock::{build_router, AppState, Config, DockerRuntime, JobStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting clidock with config: {:?}", cfg);

    // Container Runtime (Docker)
    let runtime = Arc::new(DockerRuntime::connect(cfg.docker_host.as_deref())?);
    let state = AppState::new(&cfg, runtime);

    // Job event log
    let mut events = state.orchestrator.subscribe();
    let events_handle = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.status == JobStatus::Error => {
                    warn!("Job {} for {} ended in error", event.job_id, event.image)
                }
                Ok(event) if event.status.is_terminal() => {
                    info!("Job {} for {} succeeded", event.job_id, event.image)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!("Job event listener skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    // HTTP API
    let router = build_router(state, &cfg.route_prefix);
    let listener = TcpListener::bind(cfg.bind).await?;
    info!("HTTP API listening on {}", cfg.bind);

    // Graceful Shutdown
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down..."),
            Err(err) => error!("Unable to listen for shutdown signal: {}", err),
        }
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    events_handle.abort();
    info!("Shutdown complete.");
    Ok(())
}
