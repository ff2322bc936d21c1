//! Database connection pool
//!
//! Pooled connections are handed out as tenant scopes by
//! [`PgScopeProvider`](crate::scope::PgScopeProvider). The pool clears the
//! tenant and administrative bindings whenever a connection comes back, so an
//! idle connection sees no rows until a provider binds it again.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, error, info, warn};

use crate::config::DatabaseConfig;
use crate::error::StoreResult;
use crate::metrics::update_pool_metrics;
use crate::scope::{ADMIN_SETTING, TENANT_SETTING};

/// Create a PostgreSQL connection pool with automatic metrics monitoring
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    debug!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout_secs,
        "Creating database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .after_release(|conn, _meta| {
            Box::pin(async move {
                // A connection that cannot be reset is closed instead of reused
                match sqlx::query("SELECT set_config($1, '', false), set_config($2, '', false)")
                    .bind(TENANT_SETTING)
                    .bind(ADMIN_SETTING)
                    .execute(&mut *conn)
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(e) => {
                        warn!(error = %e, "Failed to clear scope binding, closing connection");
                        Ok(false)
                    }
                }
            })
        })
        .connect(&config.url)
        .await?;

    // Verify connection with connect timeout
    match tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    {
        Ok(Ok(_)) => {
            info!("Database pool created and verified successfully");

            update_pool_metrics(&pool);

            {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(Duration::from_secs(30));
                    loop {
                        interval.tick().await;
                        if pool.is_closed() {
                            break;
                        }
                        update_pool_metrics(&pool);
                    }
                });
            }

            Ok(pool)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Database connection verification failed");
            Err(e)
        }
        Err(_) => {
            error!(
                timeout_secs = config.connect_timeout_secs,
                "Database connection verification timeout"
            );
            Err(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Database verification timeout",
            )))
        }
    }
}

/// Apply the embedded schema migrations
pub async fn migrate(pool: &PgPool) -> StoreResult<()> {
    debug!("Running ontology store migrations");

    sqlx::migrate!("./migrations").run(pool).await?;

    info!("Database migrations completed successfully");
    Ok(())
}
