//! Stale lease reaper
//!
//! Periodically clears ownership of workflows whose owner stopped sending
//! heartbeats, so another instance can claim them. Runs under an
//! administrative scope because stale leases are looked for across all
//! tenants.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;
use crate::error::{StoreError, StoreResult};
use crate::lease::LeaseConfig;
use crate::metrics::record_reaped;
use crate::repository::WorkflowRepository;
use crate::scope::ScopeProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Time between scans
    pub interval: Duration,
    /// Heartbeat age after which a lease is considered abandoned
    pub stale_after: Duration,
    /// Maximum leases reset per scan
    pub batch_size: i64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl ReaperConfig {
    /// Reaper settings matching the lease timing of the processing instances
    pub fn from_lease(lease: &LeaseConfig) -> Self {
        Self {
            stale_after: lease.stale_after,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.interval.is_zero() {
            return Err(StoreError::InvalidInput(
                "reaper interval must be positive".to_string(),
            ));
        }
        if self.stale_after.is_zero() {
            return Err(StoreError::InvalidInput(
                "reaper stale threshold must be positive".to_string(),
            ));
        }
        if self.batch_size <= 0 {
            return Err(StoreError::InvalidInput(
                "reaper batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Reject a threshold shorter than the one the lease keepers give up by
    pub fn validate_against(&self, lease: &LeaseConfig) -> StoreResult<()> {
        self.validate()?;
        if self.stale_after < lease.stale_after {
            return Err(StoreError::InvalidInput(format!(
                "reaper stale threshold {:?} is shorter than the lease stale threshold {:?}",
                self.stale_after, lease.stale_after
            )));
        }
        Ok(())
    }
}

/// Outcome of one scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Stale leases returned by the scan
    pub found: usize,
    /// Leases actually cleared
    pub reset: usize,
    /// Leases renewed or re-claimed between scan and reset
    pub skipped: usize,
    /// Resets that failed
    pub failed: usize,
}

/// Background job resetting abandoned workflow leases
///
/// ```no_run
/// # use std::sync::Arc;
/// # use ontology_store::*;
/// # async fn run(pool: sqlx::PgPool) -> StoreResult<()> {
/// let reaper = StaleLeaseReaper::new(
///     Arc::new(PgScopeProvider::new(pool)),
///     Arc::new(PgWorkflowRepository::new()),
///     ReaperConfig::from_lease(&LeaseConfig::default()),
/// )?;
///
/// let (shutdown_tx, handle) = reaper.spawn();
///
/// // Later: shutdown
/// let _ = shutdown_tx.send(());
/// let _ = handle.await;
/// # Ok(())
/// # }
/// ```
pub struct StaleLeaseReaper<P, R> {
    provider: Arc<P>,
    repository: Arc<R>,
    config: ReaperConfig,
}

impl<P, R> StaleLeaseReaper<P, R>
where
    P: ScopeProvider + 'static,
    R: WorkflowRepository<Conn = P::Conn> + 'static,
{
    /// Fails with `InvalidInput` for a zero interval or threshold, or a
    /// non-positive batch size.
    pub fn new(
        provider: Arc<P>,
        repository: Arc<R>,
        config: ReaperConfig,
    ) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            repository,
            config,
        })
    }

    pub fn config(&self) -> &ReaperConfig {
        &self.config
    }

    /// Spawn background reaping task
    ///
    /// # Returns
    /// - `watch::Sender<()>` - Send signal to shutdown
    /// - `tokio::task::JoinHandle` - Task handle for awaiting completion
    pub fn spawn(self) -> (watch::Sender<()>, tokio::task::JoinHandle<StoreResult<()>>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                stale_after_secs = self.config.stale_after.as_secs(),
                batch_size = self.config.batch_size,
                "Stale lease reaper started"
            );

            let mut timer = interval(self.config.interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Stale lease reaper received shutdown signal");
                        break;
                    }
                    _ = timer.tick() => {
                        if let Err(e) = self.run_once().await {
                            error!(error = %e, "Stale lease scan failed");
                        }
                    }
                }
            }

            info!("Stale lease reaper stopped");
            Ok(())
        });

        (shutdown_tx, handle)
    }

    /// Run a single scan and reset every lease that is still stale
    pub async fn run_once(&self) -> StoreResult<ReapReport> {
        let start = std::time::Instant::now();
        let mut ctx = RequestContext::scoped(self.provider.acquire_administrative().await?);

        let stale = self
            .repository
            .list_stale_leases(&mut ctx, self.config.stale_after, self.config.batch_size)
            .await?;

        let mut report = ReapReport {
            found: stale.len(),
            ..ReapReport::default()
        };

        if stale.is_empty() {
            debug!("No stale leases");
            return Ok(report);
        }

        for lease in stale {
            match self
                .repository
                .reset_stale_lease(
                    &mut ctx,
                    lease.workflow_id,
                    &lease.owner_id,
                    self.config.stale_after,
                )
                .await
            {
                Ok(true) => {
                    report.reset += 1;
                    record_reaped(true);
                    info!(
                        workflow_id = %lease.workflow_id,
                        tenant_id = %lease.project_id,
                        owner_id = %lease.owner_id,
                        last_heartbeat = %lease.last_heartbeat,
                        "Reclaimed stale workflow lease"
                    );
                }
                Ok(false) => {
                    report.skipped += 1;
                    debug!(
                        workflow_id = %lease.workflow_id,
                        owner_id = %lease.owner_id,
                        "Lease renewed since scan, left alone"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    record_reaped(false);
                    warn!(
                        workflow_id = %lease.workflow_id,
                        error = %e,
                        "Failed to reset stale lease"
                    );
                    if e.is_transient() {
                        break;
                    }
                }
            }
        }

        info!(
            found = report.found,
            reset = report.reset,
            skipped = report.skipped,
            failed = report.failed,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Stale lease scan completed"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryScopeProvider, MemoryStore, MemoryWorkflowRepository};

    fn reaper(
        config: ReaperConfig,
    ) -> StoreResult<StaleLeaseReaper<MemoryScopeProvider, MemoryWorkflowRepository>> {
        StaleLeaseReaper::new(
            Arc::new(MemoryScopeProvider::new(MemoryStore::new())),
            Arc::new(MemoryWorkflowRepository::new()),
            config,
        )
    }

    #[test]
    fn test_from_lease_follows_lease_threshold() {
        let lease = LeaseConfig {
            heartbeat_interval: Duration::from_secs(4),
            stale_after: Duration::from_secs(12),
            max_heartbeat_failures: 2,
        };
        let config = ReaperConfig::from_lease(&lease);
        assert_eq!(config.stale_after, Duration::from_secs(12));
        assert!(config.validate_against(&lease).is_ok());
    }

    #[test]
    fn test_threshold_shorter_than_lease_is_rejected() {
        let lease = LeaseConfig::default();
        let config = ReaperConfig {
            stale_after: Duration::from_secs(5),
            ..ReaperConfig::default()
        };
        assert!(matches!(
            config.validate_against(&lease),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let zero_threshold = ReaperConfig {
            stale_after: Duration::ZERO,
            ..ReaperConfig::default()
        };
        assert!(matches!(
            reaper(zero_threshold),
            Err(StoreError::InvalidInput(_))
        ));

        let empty_batch = ReaperConfig {
            batch_size: 0,
            ..ReaperConfig::default()
        };
        assert!(reaper(empty_batch).is_err());

        let zero_interval = ReaperConfig {
            interval: Duration::ZERO,
            ..ReaperConfig::default()
        };
        assert!(reaper(zero_interval).is_err());

        assert!(reaper(ReaperConfig::default()).is_ok());
    }
}
