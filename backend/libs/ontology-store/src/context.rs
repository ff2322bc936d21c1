//! Request context threaded through every repository call
//!
//! The context owns the request's [`TenantScope`], the provenance of the
//! change and an optional deadline. It is passed explicitly to each
//! operation; nothing is looked up from ambient state.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::scope::{TenantId, TenantScope};

/// System component responsible for a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvenanceSource {
    Inference,
    Manual,
    Mcp,
}

impl ProvenanceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvenanceSource::Inference => "inference",
            ProvenanceSource::Manual => "manual",
            ProvenanceSource::Mcp => "mcp",
        }
    }
}

/// Who is making a change. Consumed by audit and metadata repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: ProvenanceSource,
    pub user_id: Option<Uuid>,
}

impl Provenance {
    pub fn user(source: ProvenanceSource, user_id: Uuid) -> Self {
        Self {
            source,
            user_id: Some(user_id),
        }
    }

    pub fn system(source: ProvenanceSource) -> Self {
        Self {
            source,
            user_id: None,
        }
    }
}

/// Per-request state passed to every store operation
pub struct RequestContext<C> {
    scope: Option<TenantScope<C>>,
    provenance: Option<Provenance>,
    deadline: Option<Instant>,
}

impl<C> Default for RequestContext<C> {
    fn default() -> Self {
        Self {
            scope: None,
            provenance: None,
            deadline: None,
        }
    }
}

impl<C> RequestContext<C> {
    /// A context with nothing attached
    pub fn new() -> Self {
        Self::default()
    }

    /// A context that owns `scope`; dropping the context releases it
    pub fn scoped(scope: TenantScope<C>) -> Self {
        Self {
            scope: Some(scope),
            ..Self::default()
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// Bound every store round trip made through this context
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Attach a scope, releasing any scope that was attached before
    pub fn attach_scope(&mut self, scope: TenantScope<C>) {
        self.scope = Some(scope);
    }

    /// Detach the scope without releasing it
    pub fn take_scope(&mut self) -> Option<TenantScope<C>> {
        self.scope.take()
    }

    /// Release the attached scope now instead of at drop
    pub fn release_scope(&mut self) {
        if let Some(mut scope) = self.scope.take() {
            scope.release();
        }
    }

    /// The attached scope, if any. Absence is not an error here.
    pub fn scope(&self) -> Option<&TenantScope<C>> {
        self.scope.as_ref()
    }

    /// Tenant of the attached scope; `None` for administrative or missing scopes
    pub fn tenant(&self) -> Option<TenantId> {
        self.scope.as_ref().and_then(|s| s.tenant())
    }

    pub fn provenance(&self) -> Option<&Provenance> {
        self.provenance.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Connection of the attached scope, or `MissingScope`.
    ///
    /// Repositories call this before doing anything else.
    pub fn conn_mut(&mut self) -> StoreResult<&mut C> {
        match self.scope.as_mut() {
            Some(scope) => scope.conn_mut(),
            None => Err(StoreError::MissingScope),
        }
    }

    /// Fail fast if the deadline has already passed
    pub fn check_deadline(&self) -> StoreResult<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(StoreError::DeadlineExceeded(Duration::ZERO))
            }
            _ => Ok(()),
        }
    }

    /// Connection and deadline for one repository operation.
    ///
    /// Scope presence is checked before the deadline so a missing scope is
    /// always reported as `MissingScope`.
    pub(crate) fn session(&mut self) -> StoreResult<(&mut C, Option<Instant>)> {
        let deadline = self.deadline;
        let conn = self.conn_mut()?;
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(StoreError::DeadlineExceeded(Duration::ZERO));
            }
        }
        Ok((conn, deadline))
    }
}

impl<C> fmt::Debug for RequestContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("scope", &self.scope)
            .field("provenance", &self.provenance)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Run one store round trip, aborting it when `deadline` passes
pub(crate) async fn bounded<F, T>(deadline: Option<Instant>, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match deadline {
        None => fut.await,
        Some(deadline) => {
            let budget = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout_at(deadline, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::DeadlineExceeded(budget)),
            }
        }
    }
}
