//! Workflow ownership leases
//!
//! [`LeaseManager`] claims a workflow for this instance and keeps the claim
//! alive with a background [`HeartbeatKeeper`]. The lease is a store-side
//! compare-and-set, not a lock: nothing here waits for another owner.
//!
//! Lease loss is reported, never hidden. Once the keeper sees `NotOwned`, or
//! exhausts its failure budget, the lease is marked lost and every further
//! owner-guarded write through the manager is refused.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use ontology_store::*;
//! # async fn run(pool: sqlx::PgPool, tenant: TenantId, workflow_id: uuid::Uuid) -> StoreResult<()> {
//! let provider = Arc::new(PgScopeProvider::new(pool));
//! let manager = LeaseManager::new(
//!     provider.clone(),
//!     Arc::new(PgWorkflowRepository::new()),
//!     OwnerId::generate(),
//!     LeaseConfig::default(),
//! )?;
//!
//! let mut ctx = RequestContext::scoped(provider.acquire(tenant).await?);
//! if let Some(lease) = manager.acquire(&mut ctx, workflow_id).await? {
//!     manager
//!         .apply(&mut ctx, &lease, &WorkflowChange::state(WorkflowState::Running))
//!         .await?;
//!     manager.release(&mut ctx, lease).await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::{StoreError, StoreResult};
use crate::metrics::record_lease_lost;
use crate::repository::WorkflowRepository;
use crate::scope::{ScopeProvider, TenantId, TenantScope};
use crate::workflow::WorkflowChange;

/// Identifier of one server instance competing for workflows
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `<hostname>-<uuid>`, unique per process start
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "ontology-store".to_string());
        Self(format!("{}-{}", host, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lease timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Time between heartbeats
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which the reaper may reclaim a lease
    pub stale_after: Duration,
    /// Consecutive failed heartbeats before the keeper gives the lease up
    pub max_heartbeat_failures: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let heartbeat_interval = Duration::from_secs(10);
        Self {
            heartbeat_interval,
            stale_after: heartbeat_interval * 3,
            max_heartbeat_failures: 2,
        }
    }
}

impl LeaseConfig {
    /// The keeper must give up before the reaper can reclaim, otherwise two
    /// instances could both believe they hold the lease. The keeper gives up
    /// one interval short of `stale_after`, so the failure budget has to fit
    /// in what is left.
    pub fn validate(&self) -> StoreResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(StoreError::InvalidInput(
                "heartbeat interval must be positive".to_string(),
            ));
        }
        if self.max_heartbeat_failures == 0 {
            return Err(StoreError::InvalidInput(
                "max heartbeat failures must be at least 1".to_string(),
            ));
        }

        let required = self
            .heartbeat_interval
            .checked_mul(self.max_heartbeat_failures.saturating_add(1))
            .ok_or_else(|| {
                StoreError::InvalidInput("heartbeat budget overflows".to_string())
            })?;
        if required > self.stale_after {
            return Err(StoreError::InvalidInput(format!(
                "stale threshold {:?} must be at least {:?} ({} failures + 1) x {:?}",
                self.stale_after,
                required,
                self.max_heartbeat_failures,
                self.heartbeat_interval
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The store reports another owner, or none
    NotOwned,
    /// Heartbeats kept failing until the budget ran out
    HeartbeatFailures,
}

impl LossReason {
    fn as_str(&self) -> &'static str {
        match self {
            LossReason::NotOwned => "not_owned",
            LossReason::HeartbeatFailures => "heartbeat_failures",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Held,
    Lost(LossReason),
}

impl LeaseStatus {
    pub fn is_lost(&self) -> bool {
        matches!(self, LeaseStatus::Lost(_))
    }
}

fn mark_lost(status: &watch::Sender<LeaseStatus>, workflow_id: Uuid, reason: LossReason) {
    let changed = status.send_if_modified(|current| {
        if current.is_lost() {
            false
        } else {
            *current = LeaseStatus::Lost(reason);
            true
        }
    });

    if changed {
        record_lease_lost(reason.as_str());
        warn!(workflow_id = %workflow_id, reason = reason.as_str(), "Workflow lease lost");
    }
}

/// Background task renewing one lease
///
/// Each beat acquires its own short-lived scope, so the keeper never holds
/// a connection between beats. Loss is measured from the start of the last
/// successful renewal: the keeper gives the lease up one heartbeat interval
/// before the reaper could consider it stale, however slow the store is.
pub struct HeartbeatKeeper<P, R> {
    provider: Arc<P>,
    repository: Arc<R>,
    tenant: Option<TenantId>,
    workflow_id: Uuid,
    owner_id: OwnerId,
    config: LeaseConfig,
    status: Arc<watch::Sender<LeaseStatus>>,
    renewed_at: Instant,
}

impl<P, R> HeartbeatKeeper<P, R>
where
    P: ScopeProvider + 'static,
    R: WorkflowRepository<Conn = P::Conn> + 'static,
{
    pub fn new(
        provider: Arc<P>,
        repository: Arc<R>,
        tenant: Option<TenantId>,
        workflow_id: Uuid,
        owner_id: OwnerId,
        config: LeaseConfig,
        status: Arc<watch::Sender<LeaseStatus>>,
    ) -> Self {
        Self {
            provider,
            repository,
            tenant,
            workflow_id,
            owner_id,
            config,
            status,
            renewed_at: Instant::now(),
        }
    }

    /// When the claim the keeper takes over was written.
    ///
    /// Pass a time taken before the claim was issued; the keeper counts the
    /// lease's age from it.
    pub fn renewed_at(mut self, at: Instant) -> Self {
        self.renewed_at = at;
        self
    }

    /// Age after which the keeper declares the lease lost
    fn give_up_after(&self) -> Duration {
        self.config
            .stale_after
            .saturating_sub(self.config.heartbeat_interval)
    }

    /// Spawn the renewal loop
    ///
    /// # Returns
    /// - `watch::Sender<()>` - Send (or drop) to stop the keeper
    /// - `JoinHandle<()>` - Completes when the keeper stops or the lease is lost
    pub fn spawn(mut self) -> (watch::Sender<()>, JoinHandle<()>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(async move {
            debug!(
                workflow_id = %self.workflow_id,
                owner_id = %self.owner_id,
                interval_ms = self.config.heartbeat_interval.as_millis() as u64,
                "Heartbeat keeper started"
            );

            let period = self.config.heartbeat_interval;
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failures = 0u32;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        debug!(workflow_id = %self.workflow_id, "Heartbeat keeper stopping");
                        break;
                    }
                    _ = timer.tick() => {
                        let started = Instant::now();
                        let give_up_at = self.renewed_at + self.give_up_after();
                        if started >= give_up_at {
                            mark_lost(&self.status, self.workflow_id, LossReason::HeartbeatFailures);
                            break;
                        }

                        match self.beat(give_up_at.min(started + period)).await {
                            Ok(()) => {
                                failures = 0;
                                self.renewed_at = started;
                            }
                            Err(e) if e.is_lease_lost() => {
                                mark_lost(&self.status, self.workflow_id, LossReason::NotOwned);
                                break;
                            }
                            Err(e) => {
                                failures += 1;
                                warn!(
                                    workflow_id = %self.workflow_id,
                                    owner_id = %self.owner_id,
                                    failures,
                                    error = %e,
                                    "Heartbeat failed"
                                );
                                if failures >= self.config.max_heartbeat_failures
                                    || Instant::now() >= give_up_at
                                {
                                    mark_lost(
                                        &self.status,
                                        self.workflow_id,
                                        LossReason::HeartbeatFailures,
                                    );
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        (shutdown_tx, handle)
    }

    /// One renewal; scope acquisition and the write together must finish
    /// before `deadline`
    async fn beat(&self, deadline: Instant) -> StoreResult<()> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let renewal = async {
            let scope = self.acquire_scope().await?;
            let mut ctx = RequestContext::scoped(scope).with_deadline(deadline);
            self.repository
                .update_heartbeat(&mut ctx, self.workflow_id, self.owner_id.as_str())
                .await
        };

        match tokio::time::timeout_at(deadline, renewal).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::DeadlineExceeded(budget)),
        }
    }

    async fn acquire_scope(&self) -> StoreResult<TenantScope<P::Conn>> {
        match self.tenant {
            Some(tenant) => self.provider.acquire(tenant).await,
            None => self.provider.acquire_administrative().await,
        }
    }
}

/// Handle to a workflow this instance has claimed
///
/// Dropping the handle stops its heartbeat keeper without releasing the
/// claim; the reaper clears it once it goes stale.
pub struct WorkflowLease {
    workflow_id: Uuid,
    tenant: Option<TenantId>,
    owner_id: OwnerId,
    status: Arc<watch::Sender<LeaseStatus>>,
    shutdown: Option<watch::Sender<()>>,
    keeper: Option<JoinHandle<()>>,
}

impl WorkflowLease {
    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn status(&self) -> LeaseStatus {
        *self.status.borrow()
    }

    pub fn is_lost(&self) -> bool {
        self.status().is_lost()
    }

    /// Resolves once the lease is lost
    pub async fn lost(&self) -> LossReason {
        let mut rx = self.status.subscribe();
        loop {
            if let LeaseStatus::Lost(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return LossReason::NotOwned;
            }
        }
    }

    async fn stop_keeper(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(keeper) = self.keeper.take() {
            if let Err(e) = keeper.await {
                error!(workflow_id = %self.workflow_id, error = %e, "Heartbeat keeper panicked");
            }
        }
    }
}

impl fmt::Debug for WorkflowLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowLease")
            .field("workflow_id", &self.workflow_id)
            .field("owner_id", &self.owner_id)
            .field("status", &self.status())
            .finish()
    }
}

/// Claims, renews and releases workflow leases for one instance
pub struct LeaseManager<P, R> {
    provider: Arc<P>,
    repository: Arc<R>,
    owner_id: OwnerId,
    config: LeaseConfig,
}

impl<P, R> LeaseManager<P, R>
where
    P: ScopeProvider + 'static,
    R: WorkflowRepository<Conn = P::Conn> + 'static,
{
    /// Fails with `InvalidInput` if `config` lets the reaper reclaim a lease
    /// before the keeper gives it up.
    pub fn new(
        provider: Arc<P>,
        repository: Arc<R>,
        owner_id: OwnerId,
        config: LeaseConfig,
    ) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self {
            provider,
            repository,
            owner_id,
            config,
        })
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Claim `workflow_id` and start renewing it.
    ///
    /// `Ok(None)` means another instance holds the workflow or it is not
    /// visible to the context's scope.
    pub async fn acquire(
        &self,
        ctx: &mut RequestContext<P::Conn>,
        workflow_id: Uuid,
    ) -> StoreResult<Option<WorkflowLease>> {
        let claim_started = Instant::now();
        let claimed = self
            .repository
            .claim_ownership(ctx, workflow_id, self.owner_id.as_str())
            .await?;
        if !claimed {
            return Ok(None);
        }

        let tenant = ctx.tenant();
        let (status, _) = watch::channel(LeaseStatus::Held);
        let status = Arc::new(status);

        let keeper = HeartbeatKeeper::new(
            self.provider.clone(),
            self.repository.clone(),
            tenant,
            workflow_id,
            self.owner_id.clone(),
            self.config,
            status.clone(),
        )
        .renewed_at(claim_started);
        let (shutdown, handle) = keeper.spawn();

        Ok(Some(WorkflowLease {
            workflow_id,
            tenant,
            owner_id: self.owner_id.clone(),
            status,
            shutdown: Some(shutdown),
            keeper: Some(handle),
        }))
    }

    /// Owner-guarded write under `lease`.
    ///
    /// Refused with `NotOwned` once the lease is known lost; a `NotOwned`
    /// from the store marks the lease lost.
    pub async fn apply(
        &self,
        ctx: &mut RequestContext<P::Conn>,
        lease: &WorkflowLease,
        change: &WorkflowChange,
    ) -> StoreResult<()> {
        if lease.is_lost() {
            return Err(StoreError::not_owned(
                lease.workflow_id,
                lease.owner_id.as_str(),
            ));
        }

        let result = self
            .repository
            .apply_as_owner(ctx, lease.workflow_id, lease.owner_id.as_str(), change)
            .await;

        if let Err(e) = &result {
            if e.is_lease_lost() {
                mark_lost(&lease.status, lease.workflow_id, LossReason::NotOwned);
            }
        }
        result
    }

    /// Stop renewing and give the workflow back.
    ///
    /// Returns `false` when the lease was already lost or the store no longer
    /// names this instance as owner. The release is owner-guarded, so it never
    /// clears a claim another instance has taken since.
    pub async fn release(
        &self,
        ctx: &mut RequestContext<P::Conn>,
        mut lease: WorkflowLease,
    ) -> StoreResult<bool> {
        lease.stop_keeper().await;

        if let LeaseStatus::Lost(reason) = lease.status() {
            info!(
                workflow_id = %lease.workflow_id,
                reason = reason.as_str(),
                "Skipping release of lost lease"
            );
            return Ok(false);
        }

        let released = self
            .repository
            .release_owned(ctx, lease.workflow_id, lease.owner_id.as_str())
            .await?;
        if !released {
            mark_lost(&lease.status, lease.workflow_id, LossReason::NotOwned);
        }
        Ok(released)
    }
}
