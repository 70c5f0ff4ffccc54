//! Prometheus metrics for identity-service.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram_vec, Counter, CounterVec,
    HistogramVec, TextEncoder,
};

/// API keys issued, by principal type.
pub static API_KEYS_ISSUED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "identity_api_keys_issued_total",
        "Total number of API keys issued",
        &["principal_type"]
    )
    .expect("Failed to register api_keys_issued")
});

pub static API_KEYS_REVOKED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "identity_api_keys_revoked_total",
        "Total number of API keys revoked"
    )
    .expect("Failed to register api_keys_revoked")
});

/// Fast-path revocation checks by where the answer came from.
pub static REVOCATION_CHECKS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "identity_revocation_checks_total",
        "Revocation checks by answering tier and outcome",
        &["source", "outcome"] // source: cache, store
    )
    .expect("Failed to register revocation_checks")
});

/// Cache operations that failed or timed out and were absorbed.
pub static CACHE_DEGRADED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "identity_cache_degraded_total",
        "Cache operations that failed and were skipped",
        &["operation"]
    )
    .expect("Failed to register cache_degraded")
});

pub static AUDIT_EMIT_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "identity_audit_emit_failures_total",
        "Audit events that could not be delivered",
        &["transport"]
    )
    .expect("Failed to register audit_emit_failures")
});

pub static BACKGROUND_JOBS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "identity_background_jobs_total",
        "Background jobs by kind and outcome",
        &["job", "outcome"] // outcome: ok, error, timeout, dropped
    )
    .expect("Failed to register background_jobs")
});

/// Every use of the development passthrough envelope. Must stay at zero in production.
pub static INSECURE_ENVELOPE_USES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "identity_insecure_envelope_uses_total",
        "Secrets sealed with the non-production passthrough envelope"
    )
    .expect("Failed to register insecure_envelope_uses")
});

pub static LOCKOUTS_TRIGGERED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "identity_lockouts_triggered_total",
        "Accounts locked after repeated failed authentication"
    )
    .expect("Failed to register lockouts_triggered")
});

/// Lockout checks skipped because no cache is available.
pub static LOCKOUT_DISABLED_CHECKS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "identity_lockout_disabled_checks_total",
        "Authentication attempts processed without lockout protection"
    )
    .expect("Failed to register lockout_disabled_checks")
});

/// Database query duration histogram.
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "identity_db_query_duration_seconds",
        "Database query duration in seconds",
        &["operation"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .expect("Failed to register db_query_duration")
});

/// Initialize all metrics (forces lazy initialization).
pub fn init_metrics() {
    Lazy::force(&API_KEYS_ISSUED);
    Lazy::force(&API_KEYS_REVOKED);
    Lazy::force(&REVOCATION_CHECKS);
    Lazy::force(&CACHE_DEGRADED);
    Lazy::force(&AUDIT_EMIT_FAILURES);
    Lazy::force(&BACKGROUND_JOBS);
    Lazy::force(&INSECURE_ENVELOPE_USES);
    Lazy::force(&LOCKOUTS_TRIGGERED);
    Lazy::force(&LOCKOUT_DISABLED_CHECKS);
    Lazy::force(&DB_QUERY_DURATION);
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder
        .encode_to_string(&metric_families)
        .unwrap_or_else(|e| format!("# Failed to encode metrics: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_registered_families() {
        init_metrics();
        INSECURE_ENVELOPE_USES.inc();
        let text = get_metrics();
        assert!(text.contains("identity_insecure_envelope_uses_total"));
    }
}
