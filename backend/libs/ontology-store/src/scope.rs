//! Tenant scopes
//!
//! A [`TenantScope`] is a store session bound to at most one tenant (project).
//! Tenant-bound scopes only ever see that tenant's rows; the storage layer
//! enforces this, not the repositories. Administrative scopes carry no tenant
//! but an explicit administrative marker, and exist for cross-tenant
//! maintenance such as the stale lease reaper.
//!
//! Scopes release on drop, so a scope moved into a [`RequestContext`] is
//! released on every exit path of the block that owns the context.
//!
//! [`RequestContext`]: crate::context::RequestContext

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::metrics::{record_scope_acquire, ScopeKind};

/// Postgres session setting holding the bound tenant
pub const TENANT_SETTING: &str = "app.current_project_id";

/// Postgres session setting marking an administrative scope (`on`).
///
/// Row-level security shows a connection no rows unless one of the two
/// settings is set, so a connection that never went through a provider sees
/// nothing.
pub const ADMIN_SETTING: &str = "app.admin_scope";

/// Identifier of a tenant (an ontology project)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TenantId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// A store session bound to zero or one tenant.
///
/// `C` is the backend connection type. The connection is handed back to its
/// backend when the scope is released, explicitly or by drop.
pub struct TenantScope<C> {
    tenant: Option<TenantId>,
    conn: Option<C>,
}

impl<C> TenantScope<C> {
    /// Wrap a connection that has already been bound to `tenant`
    pub fn new(tenant: Option<TenantId>, conn: C) -> Self {
        Self {
            tenant,
            conn: Some(conn),
        }
    }

    /// The bound tenant, `None` for administrative scopes
    pub fn tenant(&self) -> Option<TenantId> {
        self.tenant
    }

    pub fn is_administrative(&self) -> bool {
        self.tenant.is_none()
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// The live connection. A released scope behaves like a missing one.
    pub fn conn_mut(&mut self) -> StoreResult<&mut C> {
        self.conn.as_mut().ok_or(StoreError::MissingScope)
    }

    /// Return the connection to its backend. Safe to call more than once.
    pub fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn);
            debug!(tenant_id = ?self.tenant, "Tenant scope released");
        }
    }
}

impl<C> Drop for TenantScope<C> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<C> fmt::Debug for TenantScope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantScope")
            .field("tenant", &self.tenant)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Issues tenant scopes for one backend
#[async_trait]
pub trait ScopeProvider: Send + Sync {
    /// Backend connection carried by the scopes this provider issues
    type Conn: Send + 'static;

    /// Acquire a scope bound to `tenant`.
    ///
    /// Fails with `StorageUnavailable` when the store cannot be reached.
    async fn acquire(&self, tenant: TenantId) -> StoreResult<TenantScope<Self::Conn>>;

    /// Acquire a scope with no tenant binding.
    ///
    /// Only for cross-tenant maintenance. Never hand one of these to
    /// tenant-facing code.
    async fn acquire_administrative(&self) -> StoreResult<TenantScope<Self::Conn>>;
}

/// Scope provider backed by a Postgres pool.
///
/// Every acquire re-binds both `app.current_project_id` and
/// `app.admin_scope`, so a pooled connection never carries a previous
/// scope's binding into a new one.
#[derive(Clone)]
pub struct PgScopeProvider {
    pool: PgPool,
}

impl PgScopeProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn bind(
        &self,
        tenant: Option<TenantId>,
    ) -> StoreResult<TenantScope<PoolConnection<Postgres>>> {
        let kind = if tenant.is_some() {
            ScopeKind::Tenant
        } else {
            ScopeKind::Administrative
        };
        let start = Instant::now();

        let result = async {
            let mut conn = self.pool.acquire().await?;
            let value = tenant.map(|t| t.to_string()).unwrap_or_default();
            let admin = if tenant.is_none() { "on" } else { "" };
            sqlx::query("SELECT set_config($1, $2, false), set_config($3, $4, false)")
                .bind(TENANT_SETTING)
                .bind(&value)
                .bind(ADMIN_SETTING)
                .bind(admin)
                .execute(&mut *conn)
                .await?;
            Ok::<_, StoreError>(conn)
        }
        .await;

        record_scope_acquire(kind, start.elapsed(), result.is_ok());

        match result {
            Ok(conn) => {
                debug!(tenant_id = ?tenant, "Tenant scope acquired");
                Ok(TenantScope::new(tenant, conn))
            }
            Err(e) => {
                warn!(tenant_id = ?tenant, error = %e, "Failed to acquire tenant scope");
                Err(e)
            }
        }
    }
}

#[async_trait]
impl ScopeProvider for PgScopeProvider {
    type Conn = PoolConnection<Postgres>;

    async fn acquire(&self, tenant: TenantId) -> StoreResult<TenantScope<Self::Conn>> {
        self.bind(Some(tenant)).await
    }

    async fn acquire_administrative(&self) -> StoreResult<TenantScope<Self::Conn>> {
        self.bind(None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tracked(std::sync::Arc<std::sync::atomic::AtomicU32>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let drops = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut scope = TenantScope::new(
            Some(TenantId::new(Uuid::new_v4())),
            Tracked(drops.clone()),
        );

        scope.release();
        scope.release();
        drop(scope);

        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_released_scope_reports_missing() {
        let mut scope = TenantScope::new(None, 7u8);
        assert!(scope.is_administrative());
        assert!(scope.conn_mut().is_ok());

        scope.release();
        assert!(scope.is_released());
        assert!(matches!(scope.conn_mut(), Err(StoreError::MissingScope)));
    }

    #[test]
    fn test_tenant_id_parse() {
        let id = Uuid::new_v4();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(parsed.as_uuid(), id);
        assert!("not-a-uuid".parse::<TenantId>().is_err());
    }
}
