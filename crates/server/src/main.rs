use std::{future::IntoFuture, sync::Arc, time::Duration};

use execution::{
    docker::DockerRuntime,
    process::ProcessRunner,
    registry::ExecutionRegistry,
    runtime::{ContainerRuntime, RuntimeError},
};
use server::{AppState, routes};
use services::services::{
    commands::CommandService, config::SandboxConfig, container::ContainerPool,
    events::EventService,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, prelude::*};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},services={level},execution={level},utils={level}",
        level = log_level
    );
    let env_filter =
        EnvFilter::try_new(&filter_string).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = SandboxConfig::from_env();
    tracing::info!(
        profile = ?config.profile,
        max_containers = config.max_containers,
        "starting sandbox server"
    );
    std::fs::create_dir_all(&config.sandbox_root)?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    let events = EventService::new();
    let pool = Arc::new(ContainerPool::new(
        config.clone(),
        runtime.clone(),
        events.clone(),
    ));
    let sweep = pool.spawn_eviction_sweep();
    pool.resync_proxy().await;

    let runner = Arc::new(ProcessRunner::new(
        runtime.clone(),
        config.timeouts,
        config.mount_target.clone(),
    ));
    let registry = Arc::new(ExecutionRegistry::new(runtime, runner));
    let commands = Arc::new(CommandService::new(pool.clone(), registry, events.clone()));

    let app = routes::router(AppState::new(pool, commands.clone(), events));

    let host = std::env::var("SBX_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = std::env::var("SBX_PORT")
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(8420);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("shutdown signal received, press Ctrl+C again to force exit");
        let _ = shutdown_tx.send(true);
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
    });

    let mut serve_shutdown = shutdown_rx.clone();
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        })
        .into_future();

    // Open SSE streams can hold graceful shutdown forever; cap the wait.
    let mut deadline_shutdown = shutdown_rx;
    tokio::select! {
        result = serve => {
            result?;
        }
        _ = async {
            let _ = deadline_shutdown.changed().await;
            tokio::time::sleep(GRACEFUL_SHUTDOWN_TIMEOUT).await;
        } => {
            tracing::warn!(
                "graceful shutdown timed out after {GRACEFUL_SHUTDOWN_TIMEOUT:?}, continuing with cleanup"
            );
        }
    }

    tracing::info!("cancelling running executions");
    if tokio::time::timeout(CLEANUP_TIMEOUT, commands.cancel_all())
        .await
        .is_err()
    {
        tracing::warn!("execution cleanup timed out after {CLEANUP_TIMEOUT:?}");
    }
    sweep.abort();

    Ok(())
}
