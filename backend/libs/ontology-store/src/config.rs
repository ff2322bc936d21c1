//! Configuration for the ontology store
//!
//! Loaded from environment variables.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lease::{LeaseConfig, OwnerId};
use crate::reaper::ReaperConfig;

/// Database connection pool configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections
    pub max_connections: u32,
    /// Minimum number of connections
    pub min_connections: u32,
    /// Connection creation timeout (new connection to PostgreSQL)
    pub connect_timeout_secs: u64,
    /// Connection acquisition timeout (get connection from pool)
    pub acquire_timeout_secs: u64,
    /// Connection idle timeout
    pub idle_timeout_secs: u64,
    /// Connection maximum lifetime
    pub max_lifetime_secs: u64,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .finish()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 5,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env_or("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: env_or("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", defaults.connect_timeout_secs)?,
            acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", defaults.acquire_timeout_secs)?,
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", defaults.idle_timeout_secs)?,
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", defaults.max_lifetime_secs)?,
        })
    }
}

/// Everything a process embedding the store needs
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database: DatabaseConfig,
    pub lease: LeaseConfig,
    pub reaper: ReaperConfig,
    /// Owner id of this instance; generated when unset
    pub instance_id: Option<String>,
    /// Apply embedded migrations at startup
    pub run_migrations: bool,
}

impl StoreConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let database = DatabaseConfig::from_env()?;

        let heartbeat_secs: u64 = env_or("WORKFLOW_HEARTBEAT_INTERVAL_SECS", 10)?;
        let default_stale_secs = heartbeat_secs
            .checked_mul(3)
            .context("WORKFLOW_HEARTBEAT_INTERVAL_SECS is too large")?;
        let stale_after_secs: u64 = env_or("WORKFLOW_STALE_AFTER_SECS", default_stale_secs)?;
        let lease = LeaseConfig {
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            stale_after: Duration::from_secs(stale_after_secs),
            max_heartbeat_failures: env_or("WORKFLOW_MAX_HEARTBEAT_FAILURES", 2)?,
        };
        lease.validate().context("Invalid workflow lease configuration")?;

        let reaper = ReaperConfig {
            interval: Duration::from_secs(env_or("WORKFLOW_REAPER_INTERVAL_SECS", 30)?),
            batch_size: env_or("WORKFLOW_REAPER_BATCH_SIZE", 100)?,
            ..ReaperConfig::from_lease(&lease)
        };
        reaper
            .validate_against(&lease)
            .context("Invalid workflow reaper configuration")?;

        let instance_id = std::env::var("INSTANCE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let run_migrations = std::env::var("RUN_MIGRATIONS")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            database,
            lease,
            reaper,
            instance_id,
            run_migrations,
        })
    }

    /// Owner id for this process
    pub fn owner_id(&self) -> OwnerId {
        match &self.instance_id {
            Some(id) => OwnerId::new(id.clone()),
            None => OwnerId::generate(),
        }
    }

    /// Log configuration details
    pub fn log_config(&self) {
        info!(
            max_connections = self.database.max_connections,
            min_connections = self.database.min_connections,
            heartbeat_interval_secs = self.lease.heartbeat_interval.as_secs(),
            stale_after_secs = self.lease.stale_after.as_secs(),
            max_heartbeat_failures = self.lease.max_heartbeat_failures,
            reaper_interval_secs = self.reaper.interval.as_secs(),
            reaper_batch_size = self.reaper.batch_size,
            run_migrations = self.run_migrations,
            "Ontology store configuration loaded"
        );
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, value)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "DB_MAX_CONNECTIONS",
        "DB_MIN_CONNECTIONS",
        "DB_CONNECT_TIMEOUT_SECS",
        "DB_ACQUIRE_TIMEOUT_SECS",
        "DB_IDLE_TIMEOUT_SECS",
        "DB_MAX_LIFETIME_SECS",
        "WORKFLOW_HEARTBEAT_INTERVAL_SECS",
        "WORKFLOW_STALE_AFTER_SECS",
        "WORKFLOW_MAX_HEARTBEAT_FAILURES",
        "WORKFLOW_REAPER_INTERVAL_SECS",
        "WORKFLOW_REAPER_BATCH_SIZE",
        "INSTANCE_ID",
        "RUN_MIGRATIONS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial_test::serial]
    fn test_defaults() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ontology_test");

        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.lease.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.lease.stale_after, Duration::from_secs(30));
        assert_eq!(config.lease.max_heartbeat_failures, 2);
        assert_eq!(config.reaper.stale_after, config.lease.stale_after);
        assert_eq!(config.reaper.batch_size, 100);
        assert!(config.instance_id.is_none());
        assert!(!config.run_migrations);

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_missing_database_url() {
        clear_env();
        assert!(StoreConfig::from_env().is_err());
    }

    #[test]
    #[serial_test::serial]
    fn test_stale_after_follows_heartbeat_interval() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ontology_test");
        std::env::set_var("WORKFLOW_HEARTBEAT_INTERVAL_SECS", "4");
        std::env::set_var("INSTANCE_ID", "worker-7");
        std::env::set_var("RUN_MIGRATIONS", "true");

        let config = StoreConfig::from_env().unwrap();
        assert_eq!(config.lease.stale_after, Duration::from_secs(12));
        assert_eq!(config.owner_id().as_str(), "worker-7");
        assert!(config.run_migrations);

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_rejects_unsafe_lease_timing() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ontology_test");
        std::env::set_var("WORKFLOW_HEARTBEAT_INTERVAL_SECS", "10");
        std::env::set_var("WORKFLOW_STALE_AFTER_SECS", "15");

        assert!(StoreConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_rejects_overflowing_heartbeat_interval() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ontology_test");
        std::env::set_var("WORKFLOW_HEARTBEAT_INTERVAL_SECS", u64::MAX.to_string());

        let err = StoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("WORKFLOW_HEARTBEAT_INTERVAL_SECS"));

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_rejects_empty_reaper_batch() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ontology_test");
        std::env::set_var("WORKFLOW_REAPER_BATCH_SIZE", "0");

        assert!(StoreConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn test_rejects_garbage_numbers() {
        clear_env();
        std::env::set_var("DATABASE_URL", "postgres://localhost/ontology_test");
        std::env::set_var("DB_MAX_CONNECTIONS", "lots");

        let err = StoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("DB_MAX_CONNECTIONS"));

        clear_env();
    }

    #[test]
    fn test_debug_redacts_url() {
        let config = DatabaseConfig {
            url: "postgres://user:secret@db/ontology".to_string(),
            ..DatabaseConfig::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
