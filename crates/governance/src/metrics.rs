//! Metrics implementation using Prometheus.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use gov_bridge_core::{Error, GovernanceDecision, Invocation, Result};

/// Initialize Prometheus recorder and return the handle.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::internal(format!("Failed to install Prometheus recorder: {}", e)))?;

    tracing::info!("Prometheus metrics recorder initialized");
    Ok(handle)
}

/// Count a governance decision by backend, verdict and reason.
///
/// `backend` is the counter key, not the client-supplied id.
pub fn track_decision(backend: &str, decision: &GovernanceDecision) {
    let verdict = if decision.is_allowed() { "allowed" } else { "denied" };
    let reason = decision
        .reason
        .map(|r| r.kind().as_str())
        .unwrap_or("none");

    metrics::counter!(
        "governance_decisions_total",
        "backend" => backend.to_string(),
        "decision" => verdict,
        "reason" => reason
    )
    .increment(1);
}

/// Count a finished invocation and record its latency.
pub fn track_invocation(backend: &str, invocation: &Invocation) {
    metrics::counter!(
        "tool_invocations_total",
        "backend" => backend.to_string(),
        "status" => invocation.status.as_str()
    )
    .increment(1);

    if let Some(ms) = invocation.duration_ms {
        metrics::histogram!(
            "tool_invocation_duration_seconds",
            "backend" => backend.to_string()
        )
        .record(ms / 1000.0);
    }
}

/// Audit records evicted from a full buffer.
pub fn track_audit_dropped(count: u64) {
    metrics::counter!("audit_records_dropped_total").increment(count);
}

/// Audit records whose batch exhausted its retries.
pub fn track_audit_lost(count: u64) {
    metrics::counter!("audit_records_lost_total").increment(count);
}
