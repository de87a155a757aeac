mod bootstrap;
mod handlers;
mod health;
mod ingress;
mod messaging;
mod worker;

use std::time::Duration;

use anyhow::Result;
use carelink_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

fn init_logging(config: &AppConfig) {
    use carelink_core::config::LogFormat::*;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.as_str()));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let router = health::router(health::HealthState::new(app.db_pool.clone(), app.store.jobs.clone()))
        .merge(ingress::router(ingress::IngressState::new(
            app.store.jobs.clone(),
            &app.config.webhooks,
        )));
    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.listening",
        correlation_id = "bootstrap",
        bind_address = %address,
        "http listener bound"
    );

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stopping| *stopping).await;
            })
            .await
    });

    let worker = if app.config.worker.enabled {
        let worker_shutdown = shutdown_rx.clone();
        let worker = app.worker;
        Some(tokio::spawn(async move { worker.run_until_shutdown(worker_shutdown).await }))
    } else {
        tracing::info!(event_name = "worker.disabled", "outbox worker disabled by config");
        None
    };

    tracing::info!(event_name = "system.server.started", correlation_id = "bootstrap", "carelink-server started");
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", correlation_id = "shutdown", "carelink-server stopping");

    shutdown_tx.send_replace(true);
    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    if let Some(worker) = worker {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!(event_name = "worker.shutdown_timeout", "worker did not stop within grace period");
        }
    }
    match tokio::time::timeout(grace, server).await {
        Ok(Ok(Err(error))) => tracing::error!(event_name = "system.server.error", error = %error, "http server failed"),
        Err(_) => tracing::warn!(event_name = "system.server.shutdown_timeout", "http server did not stop within grace period"),
        _ => {}
    }

    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
