//! Prometheus metrics for the ontology store
//!
//! Tracks scope acquisition, lease claims and heartbeats, lost leases and
//! reaped workflows. Collectors live in the default registry.

use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec,
};
use sqlx::PgPool;
use std::time::Duration;

lazy_static::lazy_static! {
    /// Time to acquire and bind a tenant scope
    static ref SCOPE_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "ontology_scope_acquire_duration_seconds",
        "Time to acquire and bind a tenant scope",
        &["kind", "result"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Ownership claims by outcome (acquired/conflict/error)
    static ref LEASE_CLAIMS: IntCounterVec = register_int_counter_vec!(
        "ontology_workflow_lease_claims_total",
        "Workflow ownership claims by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Heartbeats by outcome (renewed/not_owned/error)
    static ref LEASE_HEARTBEATS: IntCounterVec = register_int_counter_vec!(
        "ontology_workflow_lease_heartbeats_total",
        "Workflow heartbeats by outcome",
        &["outcome"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Leases lost by the local instance
    static ref LEASES_LOST: IntCounterVec = register_int_counter_vec!(
        "ontology_workflow_leases_lost_total",
        "Workflow leases lost by reason",
        &["reason"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Stale leases cleared by the reaper
    static ref LEASES_REAPED: IntCounterVec = register_int_counter_vec!(
        "ontology_workflow_leases_reaped_total",
        "Stale workflow leases cleared by the reaper",
        &["result"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Database connection pool size by state (idle/active/max)
    static ref DB_POOL_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        "ontology_db_pool_connections",
        "Database pool connection count by state",
        &["state"]
    ).expect("Prometheus metrics registration should succeed at startup");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Tenant,
    Administrative,
}

impl ScopeKind {
    fn as_str(&self) -> &'static str {
        match self {
            ScopeKind::Tenant => "tenant",
            ScopeKind::Administrative => "administrative",
        }
    }
}

fn result_label(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

pub(crate) fn record_scope_acquire(kind: ScopeKind, elapsed: Duration, ok: bool) {
    SCOPE_ACQUIRE_DURATION
        .with_label_values(&[kind.as_str(), result_label(ok)])
        .observe(elapsed.as_secs_f64());
}

pub(crate) fn record_claim(outcome: &str) {
    LEASE_CLAIMS.with_label_values(&[outcome]).inc();
}

pub(crate) fn record_heartbeat(outcome: &str) {
    LEASE_HEARTBEATS.with_label_values(&[outcome]).inc();
}

pub(crate) fn record_lease_lost(reason: &str) {
    LEASES_LOST.with_label_values(&[reason]).inc();
}

pub(crate) fn record_reaped(ok: bool) {
    LEASES_REAPED.with_label_values(&[result_label(ok)]).inc();
}

/// Update connection pool metrics (called periodically)
pub(crate) fn update_pool_metrics(pool: &PgPool) {
    let size = pool.size() as i64;
    let idle = pool.num_idle() as i64;

    DB_POOL_CONNECTIONS.with_label_values(&["idle"]).set(idle);
    DB_POOL_CONNECTIONS
        .with_label_values(&["active"])
        .set(size - idle);
    DB_POOL_CONNECTIONS
        .with_label_values(&["max"])
        .set(pool.options().get_max_connections() as i64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_increment() {
        let before = LEASE_CLAIMS.with_label_values(&["conflict"]).get();
        record_claim("conflict");
        assert_eq!(LEASE_CLAIMS.with_label_values(&["conflict"]).get(), before + 1);

        record_scope_acquire(ScopeKind::Administrative, Duration::from_millis(3), true);
        let observed = SCOPE_ACQUIRE_DURATION
            .with_label_values(&["administrative", "ok"])
            .get_sample_count();
        assert!(observed >= 1);
    }
}
