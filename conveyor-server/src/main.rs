//! Conveyor
//!
//! Entry point for the `conveyor` binary: loads configuration, opens the job
//! store and runs either the admin API (server role) or the bridge listener
//! (worker role). Both roles process the queues their role allows.

use std::sync::Arc;

use clap::Parser;
use conveyor_job_queue::bridge::serve_tcp;
use conveyor_job_queue::{JobQueueService, ProcessRole};
use tokio::net::TcpListener;
use tokio::sync::watch;

use conveyor_server::background::spawn_buffer_flusher;
use conveyor_server::config_helpers::{
    bridge_from_config, job_queue_config, parse_bind_address, process_role, queue_options,
    strategy_from_config,
};
use conveyor_server::{build_router, AppState};

mod cli;
mod tracing_setup;

use cli::CliArgs;
use tracing_setup::install_tracing_from_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("[STARTUP] Conveyor starting...");
    let args = CliArgs::parse();

    let config_path = args.resolved_config_path();
    eprintln!("[STARTUP] Loading config from: {:?}", config_path);
    let mut config = conveyor_config::load_config(config_path.as_deref()).map_err(|e| {
        eprintln!("failed to load configuration: {e}");
        anyhow::anyhow!(e.to_string())
    })?;
    if let Some(role) = args.role {
        config.process.role = role;
    }
    conveyor_config::validate_config(&config).map_err(|e| {
        eprintln!("invalid configuration: {e}");
        anyhow::anyhow!(e.to_string())
    })?;
    eprintln!("[STARTUP] Config loaded successfully");

    install_tracing_from_config(&config.logging)?;
    let role = process_role(&config)?;

    eprintln!("[STARTUP] Opening job store ({})...", config.job_queue.strategy);
    let strategy = strategy_from_config(&config).await?;
    let service = JobQueueService::new(strategy, job_queue_config(&config, role));
    conveyor_jobs::register_all(&service, |queue| queue_options(&config, queue)).await?;

    tracing::info!(
        %role,
        strategy = %config.job_queue.strategy,
        queues = ?service.queue_names(),
        bridge = config.bridge.address.as_deref().unwrap_or("in-process"),
        "job service configured"
    );

    service.start().await?;
    eprintln!("[STARTUP] Job service started as {role}");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flusher = spawn_buffer_flusher(
        service.clone(),
        config.job_queue.buffer_flush_interval(),
        shutdown_rx.clone(),
    );

    match role {
        ProcessRole::Server => {
            let bridge = bridge_from_config(&config, role)?;
            let app = build_router(Arc::new(AppState::new(service.clone(), bridge)));

            let addr = parse_bind_address(&config.server.host, config.server.port);
            let listener = TcpListener::bind(addr).await?;
            eprintln!("[STARTUP] Server listening on {addr}");
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        ProcessRole::Worker => {
            let bridge_task = match config.bridge.socket_address()? {
                Some(address) => {
                    let listener = TcpListener::bind(&address).await?;
                    eprintln!("[STARTUP] Bridge listening on {address}");
                    Some(tokio::spawn(serve_tcp(
                        listener,
                        conveyor_jobs::bridge_router(),
                        shutdown_rx.clone(),
                    )))
                }
                None => None,
            };
            eprintln!("[STARTUP] Worker ready");
            shutdown_signal().await;

            let _ = shutdown_tx.send(true);
            if let Some(bridge_task) = bridge_task {
                match bridge_task.await {
                    Ok(Err(error)) => tracing::warn!(%error, "bridge listener failed"),
                    Err(error) => tracing::warn!(%error, "bridge listener panicked"),
                    Ok(Ok(())) => {}
                }
            }
        }
    }

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(error) = flusher.await {
        tracing::warn!(%error, "buffer flusher panicked");
    }
    // Held jobs would be lost otherwise.
    if let Err(error) = service.flush(&[]).await {
        tracing::warn!(%error, "final buffer flush failed");
    }
    service.stop().await;
    tracing::info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }
}
