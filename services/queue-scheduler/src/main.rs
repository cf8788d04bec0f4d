//! mqplane Queue Scheduler
//!
//! For every named group of queues the scheduler keeps the queues actually
//! present on the group's live broker synchronized with desired
//! configuration, via management calls on the broker's inbound session.
//!
//! ## Architecture
//!
//! - **Config watch loop**: polls address-entry sources, emits per-group
//!   desired-state events
//! - **AMQP listener**: admits one broker connection per group
//! - **Reconciler**: converges each connected group's queue set, one
//!   serialized event stream, sync passes on a bounded worker pool
//! - **Status server**: per-group queue counts for orchestrator probes

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mqplane_queue_scheduler::{
    config::Config, configsource::run_config_watch_loop, health, listener::ConnectionRegistry,
    Listener, ListenerConfig, Reconciler,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting mqplane queue scheduler");

    // Load configuration
    let config = Config::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        status_addr = %config.status_addr,
        config_dirs = ?config.config_dirs,
        worker_pool_size = config.worker_pool_size,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The single serialized event stream everything feeds into
    let (events_tx, events_rx) = mpsc::channel(1024);

    // Reconciler owns the scheduler state; sync passes report back through
    // the same event stream
    let (reconciler, status) = Reconciler::new(&config, events_rx, events_tx.clone());
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // AMQP listener
    let registry = Arc::new(ConnectionRegistry::new());
    let listener = Arc::new(
        Listener::bind(
            ListenerConfig::from_config(&config),
            Arc::clone(&registry),
            events_tx.clone(),
        )
        .await?,
    );
    let listener_handle = tokio::spawn(Arc::clone(&listener).run());

    // Config source watch loop
    let config_handle = tokio::spawn({
        let dirs = config.config_dirs.clone();
        let poll_interval = config.poll_interval;
        let events_tx = events_tx.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { run_config_watch_loop(dirs, poll_interval, events_tx, shutdown_rx).await }
    });

    // Status/readiness surface
    let status_handle = tokio::spawn({
        let status_addr = config.status_addr;
        let shutdown_rx = shutdown_rx.clone();
        async move { health::run_status_server(status_addr, status, shutdown_rx).await }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = listener_handle => {
            match result {
                Ok(Ok(())) => info!("Listener exited normally"),
                Ok(Err(e)) => error!(error = %e, "Listener error"),
                Err(e) => error!(error = %e, "Listener task panicked"),
            }
        }
        _ = reconciler_handle => {
            info!("Reconciler exited");
        }
        result = config_handle => {
            match result {
                Ok(Ok(())) => info!("Config watch loop exited normally"),
                Ok(Err(e)) => error!(error = %e, "Config watch loop error"),
                Err(e) => error!(error = %e, "Config watch task panicked"),
            }
        }
        result = status_handle => {
            match result {
                Ok(Ok(())) => info!("Status server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Status server error"),
                Err(e) => error!(error = %e, "Status server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Give workers time to shut down gracefully
    info!("Waiting for workers to shut down...");
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    info!("Queue scheduler shutdown complete");
    Ok(())
}
