//! jobplane control plane
//!
//! Serves the `/my` API and runs the job executor that applies accepted
//! changes.

use std::sync::Arc;

use anyhow::Result;
use jobplane_control_plane::{
    actuation::{BackoffPolicy, RetryingActuator, SimulatedActuator},
    api,
    config,
    control::ControlPlane,
    executor::ExecutorConfig,
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to JOBPLANE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting jobplane control plane");
    info!(
        listen_addr = %config.listen_addr,
        dev_mode = config.dev_mode,
        executor_concurrency = config.executor_concurrency,
        "Configuration loaded"
    );

    let actuator = RetryingActuator::new(
        SimulatedActuator::new(config.actuation_latency),
        config.actuation_max_attempts,
        BackoffPolicy::default(),
    );
    let (control, executor, receiver) = ControlPlane::builder()
        .actuator(Arc::new(actuator))
        .executor_config(ExecutorConfig {
            concurrency: config.executor_concurrency,
        })
        .build();

    for name in &config.seed_machines {
        control.register_machine(name).await?;
    }

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start job executor in background
    let executor_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            executor.run(receiver, shutdown_rx).await;
        }
    });

    let state = AppState::new(control, config.max_wait);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to the executor
    let _ = shutdown_tx.send(true);

    info!("Waiting for in-flight jobs...");
    let shutdown_timeout = std::time::Duration::from_secs(10);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, executor_handle).await {
        warn!(error = %e, "Job executor did not shut down in time");
    }

    info!("Control plane shutdown complete");
    Ok(())
}
