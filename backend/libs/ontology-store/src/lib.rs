//! Ontology workflow store
//!
//! Tenant-isolated persistence for long-running ontology workflows, with a
//! store-side ownership lease so that exactly one server instance processes
//! a workflow at a time.
//!
//! - [`scope`]: tenant scopes and the providers that issue them
//! - [`context`]: the request context every repository call receives
//! - [`repository`]: workflow persistence for Postgres and in memory
//! - [`lease`]: claiming and renewing ownership
//! - [`reaper`]: clearing leases whose owner went away
//!
//! Isolation lives in the store. On Postgres a scope is a pooled connection
//! with `app.current_project_id` set (or `app.admin_scope` for administrative
//! scopes), and row-level security filters every statement by it. A
//! connection with neither setting sees no rows. Repositories never filter by
//! tenant themselves.

pub mod config;
pub mod context;
pub mod error;
pub mod lease;
pub mod metrics;
pub mod pool;
pub mod reaper;
pub mod repository;
pub mod scope;
pub mod workflow;

pub use config::{DatabaseConfig, StoreConfig};
pub use context::{Provenance, ProvenanceSource, RequestContext};
pub use error::{StoreError, StoreResult};
pub use lease::{
    HeartbeatKeeper, LeaseConfig, LeaseManager, LeaseStatus, LossReason, OwnerId, WorkflowLease,
};
pub use pool::{create_pool, migrate};
pub use reaper::{ReapReport, ReaperConfig, StaleLeaseReaper};
pub use repository::{
    MemoryScopeProvider, MemorySession, MemoryStore, MemoryWorkflowRepository,
    PgWorkflowRepository, WorkflowRepository,
};
pub use scope::{
    PgScopeProvider, ScopeProvider, TenantId, TenantScope, ADMIN_SETTING, TENANT_SETTING,
};
pub use workflow::{
    StaleLease, TaskStatus, Workflow, WorkflowChange, WorkflowPhase, WorkflowProgress,
    WorkflowState, WorkflowTask,
};
