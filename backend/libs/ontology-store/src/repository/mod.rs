//! Workflow repositories
//!
//! Every operation takes the request context first and fails with
//! `MissingScope` before touching the store when no scope is attached.
//! Tenant filtering is the storage layer's job; no method here takes a
//! tenant argument.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::error::StoreResult;
use crate::workflow::{
    StaleLease, Workflow, WorkflowChange, WorkflowProgress, WorkflowState, WorkflowTask,
};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryScopeProvider, MemorySession, MemoryStore, MemoryWorkflowRepository};
pub use postgres::PgWorkflowRepository;

/// Persistence of ontology workflows and their ownership lease
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Connection type of the scopes this repository reads from the context
    type Conn: Send + 'static;

    /// Insert a new workflow. Ownership fields are ignored; new rows are unowned.
    async fn create(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        workflow: &Workflow,
    ) -> StoreResult<()>;

    async fn get_by_id(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
    ) -> StoreResult<Option<Workflow>>;

    /// Most recently created workflow for an ontology
    async fn get_latest_by_ontology(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        ontology_id: Uuid,
    ) -> StoreResult<Option<Workflow>>;

    /// Replace all mutable fields. Identity and ownership are left untouched.
    async fn update(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        workflow: &Workflow,
    ) -> StoreResult<()>;

    /// Set state and error message.
    ///
    /// The first write of a terminal state stamps `completed_at`; later
    /// writes keep the original timestamp.
    async fn update_state(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        state: WorkflowState,
        error_message: Option<&str>,
    ) -> StoreResult<()>;

    async fn update_progress(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        progress: &WorkflowProgress,
    ) -> StoreResult<()>;

    async fn update_task_queue(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        tasks: &[WorkflowTask],
    ) -> StoreResult<()>;

    /// Apply `change` only while `owner_id` holds the lease.
    ///
    /// Zero rows affected means the lease is gone: `NotOwned`.
    async fn apply_as_owner(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
        change: &WorkflowChange,
    ) -> StoreResult<()>;

    async fn delete(&self, ctx: &mut RequestContext<Self::Conn>, id: Uuid) -> StoreResult<()>;

    /// Take the lease if it is free or already ours.
    ///
    /// Returns `false` when another owner holds it or the row is not visible
    /// to the scope. Errors only on storage failures.
    async fn claim_ownership(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<bool>;

    /// Refresh the heartbeat; `NotOwned` if `owner_id` no longer holds the lease
    async fn update_heartbeat(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<()>;

    /// Clear owner and heartbeat unconditionally
    async fn release_ownership(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
    ) -> StoreResult<()>;

    /// Clear owner and heartbeat only while `owner_id` holds the lease.
    ///
    /// Returns `false` when another owner, or none, holds it.
    async fn release_owned(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
    ) -> StoreResult<bool>;

    /// Owned workflows whose heartbeat is older than `stale_after`, oldest first
    async fn list_stale_leases(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        stale_after: Duration,
        limit: i64,
    ) -> StoreResult<Vec<StaleLease>>;

    /// Clear a stale lease if `owner_id` still holds it and it is still stale.
    ///
    /// Returns `false` when the lease was renewed or changed hands since the scan.
    async fn reset_stale_lease(
        &self,
        ctx: &mut RequestContext<Self::Conn>,
        id: Uuid,
        owner_id: &str,
        stale_after: Duration,
    ) -> StoreResult<bool>;
}
