//! In-memory workflow store
//!
//! Same semantics as the Postgres backend, including tenant filtering: a
//! tenant-bound session sees and writes only its own tenant's rows, an
//! administrative session sees everything. Conditional writes happen under a
//! single write lock, which makes each of them atomic.
//!
//! Used for embedding and tests. [`MemoryStore::round_trips`] counts every
//! store access, and [`MemoryStore::set_available`] simulates an outage.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::WorkflowRepository;
use crate::context::{bounded, RequestContext};
use crate::error::{StoreError, StoreResult};
use crate::metrics::{record_claim, record_heartbeat};
use crate::scope::{ScopeProvider, TenantId, TenantScope};
use crate::workflow::{
    StaleLease, Workflow, WorkflowChange, WorkflowProgress, WorkflowState, WorkflowTask,
};

struct Inner {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    round_trips: AtomicU64,
    open_sessions: AtomicI64,
    available: AtomicBool,
}

/// Shared in-memory workflow table
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                workflows: RwLock::new(HashMap::new()),
                round_trips: AtomicU64::new(0),
                open_sessions: AtomicI64::new(0),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Number of store accesses so far, scope binding included
    pub fn round_trips(&self) -> u64 {
        self.inner.round_trips.load(Ordering::SeqCst)
    }

    /// Sessions acquired and not yet released
    pub fn open_sessions(&self) -> i64 {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    /// While unavailable every access fails with `StorageUnavailable`
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn enter(&self) -> StoreResult<()> {
        self.inner.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn open(&self, tenant: Option<TenantId>) -> StoreResult<MemorySession> {
        self.enter()?;
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        Ok(MemorySession {
            store: self.clone(),
            tenant,
        })
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("round_trips", &self.round_trips())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}

/// Connection to a [`MemoryStore`], bound to zero or one tenant
pub struct MemorySession {
    store: MemoryStore,
    tenant: Option<TenantId>,
}

impl MemorySession {
    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    fn visible(&self, workflow: &Workflow) -> bool {
        match self.tenant {
            None => true,
            Some(tenant) => workflow.project_id == tenant,
        }
    }

    fn check_write(&self, project_id: TenantId) -> StoreResult<()> {
        match self.tenant {
            Some(tenant) if tenant != project_id => Err(StoreError::IsolationViolation(format!(
                "scope bound to tenant {} cannot write rows of tenant {}",
                tenant, project_id
            ))),
            _ => Ok(()),
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.store.inner.open_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}

impl fmt::Debug for MemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySession")
            .field("tenant", &self.tenant)
            .finish()
    }
}

/// Scope provider over a [`MemoryStore`]
#[derive(Debug, Clone)]
pub struct MemoryScopeProvider {
    store: MemoryStore,
}

impl MemoryScopeProvider {
    pub fn new(store: MemoryStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl ScopeProvider for MemoryScopeProvider {
    type Conn = MemorySession;

    async fn acquire(&self, tenant: TenantId) -> StoreResult<TenantScope<Self::Conn>> {
        let session = self.store.open(Some(tenant))?;
        Ok(TenantScope::new(Some(tenant), session))
    }

    async fn acquire_administrative(&self) -> StoreResult<TenantScope<Self::Conn>> {
        let session = self.store.open(None)?;
        Ok(TenantScope::new(None, session))
    }
}

fn chrono_duration(d: Duration) -> StoreResult<chrono::Duration> {
    chrono::Duration::from_std(d)
        .map_err(|_| StoreError::InvalidInput(format!("duration out of range: {:?}", d)))
}

fn apply_change(workflow: &mut Workflow, change: &WorkflowChange) {
    let now = Utc::now();
    match change {
        WorkflowChange::State {
            state,
            error_message,
        } => {
            workflow.state = *state;
            workflow.error_message = error_message.clone();
            if state.is_terminal() && workflow.completed_at.is_none() {
                workflow.completed_at = Some(now);
            }
        }
        WorkflowChange::Progress(progress) => workflow.progress = progress.clone(),
        WorkflowChange::TaskQueue(tasks) => workflow.task_queue = tasks.clone(),
    }
    workflow.updated_at = now;
}

/// Workflow repository over [`MemorySession`]s
#[derive(Debug, Clone, Default)]
pub struct MemoryWorkflowRepository;

impl MemoryWorkflowRepository {
    pub fn new() -> Self {
        Self
    }

    /// Shared body of the guarded and unguarded change writes.
    /// Returns whether a row matched.
    async fn write_change(
        &self,
        ctx: &mut RequestContext<MemorySession>,
        id: Uuid,
        owner_id: Option<&str>,
        change: &WorkflowChange,
    ) -> StoreResult<bool> {
        let (session, deadline) = ctx.session()?;

        bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            let matched = match workflows.get_mut(&id) {
                Some(wf) if session.visible(wf) => {
                    if owner_id.map_or(true, |owner| wf.owner_id.as_deref() == Some(owner)) {
                        apply_change(wf, change);
                        true
                    } else {
                        false
                    }
                }
                _ => false,
            };
            Ok::<_, StoreError>(matched)
        })
        .await
    }

    async fn apply_unguarded(
        &self,
        ctx: &mut RequestContext<MemorySession>,
        id: Uuid,
        change: WorkflowChange,
    ) -> StoreResult<()> {
        if !self.write_change(ctx, id, None, &change).await? {
            return Err(StoreError::NotFound(id));
        }
        debug!(workflow_id = %id, change = change.kind(), "Workflow updated");
        Ok(())
    }
}

#[async_trait]
impl WorkflowRepository for MemoryWorkflowRepository {
    type Conn = MemorySession;

    async fn create(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        workflow: &Workflow,
    ) -> StoreResult<()> {
        let (session, deadline) = ctx.session()?;

        bounded(deadline, async {
            session.store.enter()?;
            session.check_write(workflow.project_id)?;

            let mut workflows = session.store.inner.workflows.write().await;
            if workflows.contains_key(&workflow.id) {
                return Err(StoreError::InvalidInput(format!(
                    "workflow {} already exists",
                    workflow.id
                )));
            }

            let mut row = workflow.clone();
            row.owner_id = None;
            row.last_heartbeat = None;
            workflows.insert(row.id, row);
            Ok::<_, StoreError>(())
        })
        .await?;

        debug!(
            workflow_id = %workflow.id,
            tenant_id = %workflow.project_id,
            "Workflow created"
        );
        Ok(())
    }

    async fn get_by_id(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
    ) -> StoreResult<Option<Workflow>> {
        let (session, deadline) = ctx.session()?;

        bounded(deadline, async {
            session.store.enter()?;
            let workflows = session.store.inner.workflows.read().await;
            Ok::<_, StoreError>(workflows
                .get(&id)
                .filter(|wf| session.visible(wf))
                .cloned())
        })
        .await
    }

    async fn get_latest_by_ontology(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        ontology_id: Uuid,
    ) -> StoreResult<Option<Workflow>> {
        let (session, deadline) = ctx.session()?;

        bounded(deadline, async {
            session.store.enter()?;
            let workflows = session.store.inner.workflows.read().await;
            Ok::<_, StoreError>(workflows
                .values()
                .filter(|wf| wf.ontology_id == ontology_id && session.visible(wf))
                .max_by_key(|wf| wf.created_at)
                .cloned())
        })
        .await
    }

    async fn update(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        workflow: &Workflow,
    ) -> StoreResult<()> {
        let (session, deadline) = ctx.session()?;

        let matched = bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            match workflows.get_mut(&workflow.id) {
                Some(wf) if session.visible(wf) => {
                    wf.state = workflow.state;
                    wf.progress = workflow.progress.clone();
                    wf.task_queue = workflow.task_queue.clone();
                    wf.config = workflow.config.clone();
                    wf.error_message = workflow.error_message.clone();
                    wf.started_at = workflow.started_at;
                    wf.completed_at = workflow.completed_at;
                    wf.phase = workflow.phase;
                    wf.datasource_id = workflow.datasource_id;
                    wf.updated_at = Utc::now();
                    Ok(true)
                }
                _ => Ok::<_, StoreError>(false),
            }
        })
        .await?;

        if !matched {
            return Err(StoreError::NotFound(workflow.id));
        }
        Ok(())
    }

    async fn update_state(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> StoreResult<()> {
        let change = WorkflowChange::State {
            state,
            error_message: error_message.map(str::to_string),
        };
        self.apply_unguarded(ctx, id, change).await
    }

    async fn update_progress(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        progress: &WorkflowProgress,
    ) -> StoreResult<()> {
        self.apply_unguarded(ctx, id, WorkflowChange::Progress(progress.clone()))
            .await
    }

    async fn update_task_queue(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        tasks: &[WorkflowTask],
    ) -> StoreResult<()> {
        self.apply_unguarded(ctx, id, WorkflowChange::TaskQueue(tasks.to_vec()))
            .await
    }

    async fn apply_as_owner(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
        change: &WorkflowChange,
    ) -> StoreResult<()> {
        if !self.write_change(ctx, id, Some(owner_id), change).await? {
            return Err(StoreError::not_owned(id, owner_id));
        }
        Ok(())
    }

    async fn delete(&self, ctx: &mut RequestContext<Self::Conn>, id: Uuid) -> StoreResult<()> {
        let (session, deadline) = ctx.session()?;

        let removed = bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            let visible = workflows.get(&id).map_or(false, |wf| session.visible(wf));
            Ok::<_, StoreError>(visible && workflows.remove(&id).is_some())
        })
        .await?;

        if !removed {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn claim_ownership(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<bool> {
        let (session, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            match workflows.get_mut(&id) {
                Some(wf)
                    if session.visible(wf)
                        && wf.owner_id.as_deref().map_or(true, |o| o == owner_id) =>
                {
                    wf.owner_id = Some(owner_id.to_string());
                    wf.last_heartbeat = Some(Utc::now());
                    Ok(true)
                }
                _ => Ok::<_, StoreError>(false),
            }
        })
        .await;

        match result {
            Ok(true) => {
                record_claim("acquired");
                info!(workflow_id = %id, owner_id = %owner_id, "Workflow ownership claimed");
                Ok(true)
            }
            Ok(false) => {
                record_claim("conflict");
                Ok(false)
            }
            Err(e) => {
                record_claim("error");
                Err(e)
            }
        }
    }

    async fn update_heartbeat(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<()> {
        let (session, deadline) = ctx.session()?;

        let result = bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            match workflows.get_mut(&id) {
                Some(wf) if session.visible(wf) && wf.owner_id.as_deref() == Some(owner_id) => {
                    wf.last_heartbeat = Some(Utc::now());
                    Ok(true)
                }
                _ => Ok::<_, StoreError>(false),
            }
        })
        .await;

        match result {
            Ok(true) => {
                record_heartbeat("renewed");
                Ok(())
            }
            Ok(false) => {
                record_heartbeat("not_owned");
                Err(StoreError::not_owned(id, owner_id))
            }
            Err(e) => {
                record_heartbeat("error");
                Err(e)
            }
        }
    }

    async fn release_ownership(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
    ) -> StoreResult<()> {
        let (session, deadline) = ctx.session()?;

        let matched = bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            match workflows.get_mut(&id) {
                Some(wf) if session.visible(wf) => {
                    wf.owner_id = None;
                    wf.last_heartbeat = None;
                    Ok(true)
                }
                _ => Ok::<_, StoreError>(false),
            }
        })
        .await?;

        if !matched {
            return Err(StoreError::NotFound(id));
        }

        info!(workflow_id = %id, "Workflow ownership released");
        Ok(())
    }

    async fn release_owned(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<bool> {
        let (session, deadline) = ctx.session()?;

        let released = bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            match workflows.get_mut(&id) {
                Some(wf) if session.visible(wf) && wf.owner_id.as_deref() == Some(owner_id) => {
                    wf.owner_id = None;
                    wf.last_heartbeat = None;
                    Ok(true)
                }
                _ => Ok::<_, StoreError>(false),
            }
        })
        .await?;

        if released {
            info!(workflow_id = %id, owner_id = %owner_id, "Workflow ownership released");
        } else {
            warn!(
                workflow_id = %id,
                owner_id = %owner_id,
                "Release skipped: lease held by another owner"
            );
        }
        Ok(released)
    }

    async fn list_stale_leases(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        stale_after: Duration,
        limit: i64,
    ) -> StoreResult<Vec<StaleLease>> {
        let (session, deadline) = ctx.session()?;
        let cutoff = Utc::now() - chrono_duration(stale_after)?;
        let limit = usize::try_from(limit).unwrap_or(0);

        bounded(deadline, async {
            session.store.enter()?;
            let workflows = session.store.inner.workflows.read().await;
            let mut stale: Vec<StaleLease> = workflows
                .values()
                .filter(|wf| session.visible(wf))
                .filter_map(|wf| match (&wf.owner_id, wf.last_heartbeat) {
                    (Some(owner), Some(beat)) if beat < cutoff => Some(StaleLease {
                        workflow_id: wf.id,
                        project_id: wf.project_id,
                        owner_id: owner.clone(),
                        last_heartbeat: beat,
                    }),
                    _ => None,
                })
                .collect();
            stale.sort_by_key(|lease| lease.last_heartbeat);
            stale.truncate(limit);
            Ok::<_, StoreError>(stale)
        })
        .await
    }

    async fn reset_stale_lease(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
        stale_after: Duration,
    ) -> StoreResult<bool> {
        let (session, deadline) = ctx.session()?;
        let cutoff = Utc::now() - chrono_duration(stale_after)?;

        bounded(deadline, async {
            session.store.enter()?;
            let mut workflows = session.store.inner.workflows.write().await;
            match workflows.get_mut(&id) {
                Some(wf)
                    if session.visible(wf)
                        && wf.owner_id.as_deref() == Some(owner_id)
                        && wf.last_heartbeat.map_or(false, |beat| beat < cutoff) =>
                {
                    wf.owner_id = None;
                    wf.last_heartbeat = None;
                    Ok(true)
                }
                _ => Ok::<_, StoreError>(false),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn scoped(
        provider: &MemoryScopeProvider,
        tenant: TenantId,
    ) -> RequestContext<MemorySession> {
        RequestContext::scoped(provider.acquire(tenant).await.unwrap())
    }

    #[tokio::test]
    async fn test_sessions_are_counted_and_released() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store.clone());
        let tenant = TenantId::new(Uuid::new_v4());

        {
            let _ctx = scoped(&provider, tenant).await;
            assert_eq!(store.open_sessions(), 1);
        }
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_acquire() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store.clone());
        store.set_available(false);

        let err = provider.acquire_administrative().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_create_ignores_ownership_fields() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store);
        let repo = MemoryWorkflowRepository::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let mut ctx = scoped(&provider, tenant).await;

        let mut wf = Workflow::new(tenant, Uuid::new_v4());
        wf.owner_id = Some("sneaky".to_string());
        wf.last_heartbeat = Some(Utc::now());
        repo.create(&mut ctx, &wf).await.unwrap();

        let stored = repo.get_by_id(&mut ctx, wf.id).await.unwrap().unwrap();
        assert!(stored.owner_id.is_none());
        assert!(stored.last_heartbeat.is_none());
    }

    #[tokio::test]
    async fn test_cross_tenant_create_is_isolation_violation() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store);
        let repo = MemoryWorkflowRepository::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let other = TenantId::new(Uuid::new_v4());
        let mut ctx = scoped(&provider, tenant).await;

        let err = repo
            .create(&mut ctx, &Workflow::new(other, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IsolationViolation(_)));
        assert!(err.is_caller_bug());
    }

    #[tokio::test]
    async fn test_latest_by_ontology() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store);
        let repo = MemoryWorkflowRepository::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let ontology = Uuid::new_v4();
        let mut ctx = scoped(&provider, tenant).await;

        let mut older = Workflow::new(tenant, ontology);
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = Workflow::new(tenant, ontology);
        repo.create(&mut ctx, &older).await.unwrap();
        repo.create(&mut ctx, &newer).await.unwrap();

        let latest = repo
            .get_latest_by_ontology(&mut ctx, ontology)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, newer.id);
        assert!(repo
            .get_latest_by_ontology(&mut ctx, Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_ownership() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store);
        let repo = MemoryWorkflowRepository::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let mut ctx = scoped(&provider, tenant).await;

        let wf = Workflow::new(tenant, Uuid::new_v4());
        repo.create(&mut ctx, &wf).await.unwrap();
        assert!(repo.claim_ownership(&mut ctx, wf.id, "worker-a").await.unwrap());

        let mut changed = wf.clone();
        changed.state = WorkflowState::Running;
        changed.phase = crate::workflow::WorkflowPhase::EntityInference;
        repo.update(&mut ctx, &changed).await.unwrap();

        let stored = repo.get_by_id(&mut ctx, wf.id).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkflowState::Running);
        assert_eq!(stored.owner_id.as_deref(), Some("worker-a"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let provider = MemoryScopeProvider::new(store);
        let repo = MemoryWorkflowRepository::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let mut ctx = scoped(&provider, tenant).await;

        let wf = Workflow::new(tenant, Uuid::new_v4());
        repo.create(&mut ctx, &wf).await.unwrap();
        repo.delete(&mut ctx, wf.id).await.unwrap();

        assert!(matches!(
            repo.delete(&mut ctx, wf.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
