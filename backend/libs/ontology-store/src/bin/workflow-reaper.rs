//! Standalone stale lease reaper
//!
//! Resets ownership of workflows whose owner stopped heartbeating. Run one
//! or more instances next to the workflow processors; the conditional reset
//! makes concurrent reapers safe.

use std::sync::Arc;

use anyhow::{Context, Result};
use ontology_store::{
    create_pool, migrate, PgScopeProvider, PgWorkflowRepository, StaleLeaseReaper, StoreConfig,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = StoreConfig::from_env().context("Failed to load configuration")?;
    config.log_config();

    let pool = create_pool(&config.database)
        .await
        .context("Failed to create database pool")?;

    if config.run_migrations {
        migrate(&pool).await.context("Failed to run migrations")?;
    }

    let reaper = StaleLeaseReaper::new(
        Arc::new(PgScopeProvider::new(pool.clone())),
        Arc::new(PgWorkflowRepository::new()),
        config.reaper,
    )
    .context("Invalid reaper configuration")?;
    let (shutdown_tx, handle) = reaper.spawn();

    shutdown_signal().await;
    info!("Shutdown signal received, stopping reaper");

    let _ = shutdown_tx.send(());
    match handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Reaper exited with error"),
        Err(e) => error!(error = %e, "Reaper task panicked"),
    }

    pool.close().await;
    info!("workflow-reaper stopped");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
