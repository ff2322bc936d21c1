//! Error types for the ontology store

use std::time::Duration;

use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by scope providers and repositories.
///
/// Callers are expected to branch on the variant, never on the message:
/// `is_transient` means "retry later", `is_lease_lost` means "stop working on
/// this workflow", `is_caller_bug` means "fix the call site".
#[derive(Error, Debug)]
pub enum StoreError {
    /// No tenant scope attached to the request context (or it was released)
    #[error("no tenant scope in context")]
    MissingScope,

    /// A row-identified mutation matched nothing
    #[error("workflow not found: {0}")]
    NotFound(Uuid),

    /// The caller no longer holds the ownership lease
    #[error("workflow {workflow_id} is not owned by {owner_id}")]
    NotOwned { workflow_id: Uuid, owner_id: String },

    /// Connection, pool or transport failure
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The request context deadline passed before the round trip finished
    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    /// A write crossed the tenant boundary of the current scope
    #[error("tenant isolation violation: {0}")]
    IsolationViolation(String),

    /// Rejected before reaching the store
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Any other server-side database error
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// JSON encoding of progress, task queue or config failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Embedded migrations failed to apply
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Failures worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable(_) | StoreError::DeadlineExceeded(_)
        )
    }

    /// The lease on the workflow is gone; processing must stop
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, StoreError::NotOwned { .. })
    }

    /// Errors that indicate a programming error at the call site
    pub fn is_caller_bug(&self) -> bool {
        matches!(
            self,
            StoreError::MissingScope | StoreError::IsolationViolation(_)
        )
    }

    pub(crate) fn not_owned(workflow_id: Uuid, owner_id: &str) -> Self {
        StoreError::NotOwned {
            workflow_id,
            owner_id: owner_id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut => {
                warn!(error = %err, "Connection pool timed out");
                return StoreError::StorageUnavailable("connection pool timed out".to_string());
            }
            sqlx::Error::PoolClosed => {
                return StoreError::StorageUnavailable("connection pool closed".to_string());
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) => {
                error!(error = %err, "Database transport failure");
                return StoreError::StorageUnavailable(err.to_string());
            }
            _ => {}
        }

        if let sqlx::Error::Database(db_err) = &err {
            match db_err.code().as_deref() {
                // insufficient_privilege: raised for RLS WITH CHECK failures
                Some("42501") => {
                    warn!(message = db_err.message(), "Row-level security rejected write");
                    return StoreError::IsolationViolation(db_err.message().to_string());
                }
                // admin_shutdown / cannot_connect_now
                Some("57P01") | Some("57P03") => {
                    return StoreError::StorageUnavailable(db_err.message().to_string());
                }
                _ => {}
            }
        }

        StoreError::Database(err)
    }
}
