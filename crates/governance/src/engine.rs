//! Governance decision pipeline.
//!
//! Checks run in a fixed order and the first failure decides the outcome:
//!
//! 1. target known (backend has a policy, tool is declared)
//! 2. time window
//! 3. rate limit
//! 4. blocked patterns
//! 5. high-security allow-list, sensitive operation names and argument size
//!
//! A call denied after it took a rate-limit slot gets the slot back, so only
//! admitted calls count against the limit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use gov_bridge_core::{Clock, DenialReason, GovernanceDecision, SystemClock};

use crate::patterns::canonical_arguments;
use crate::policy::{CompiledPolicy, PolicyStore};
use crate::rate_limit::RateLimiter;

/// Tool-name fragments that a high-security policy never admits, even when
/// the tool is on its allow-list. Matched case-insensitively.
pub const SENSITIVE_OPERATIONS: [&str; 6] = ["delete", "remove", "drop", "truncate", "exec", "eval"];

fn is_sensitive_operation(tool_name: &str) -> bool {
    let name = tool_name.to_ascii_lowercase();
    SENSITIVE_OPERATIONS.iter().any(|op| name.contains(op))
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub policy_version: u64,
    pub policies_loaded: usize,
    pub active_rate_limiters: usize,
    pub total_requests_this_minute: u64,
    pub timestamp: DateTime<Utc>,
}

/// Evaluates calls against the current policy snapshot.
pub struct GovernanceEngine {
    policies: Arc<PolicyStore>,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
}

impl GovernanceEngine {
    pub fn new(policies: Arc<PolicyStore>) -> Self {
        Self::with_clock(policies, Arc::new(SystemClock))
    }

    pub fn with_clock(policies: Arc<PolicyStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            limiter: RateLimiter::with_clock(clock.clone()),
            clock,
        }
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Decide whether `tool_name` on `backend_id` may run with `arguments`.
    ///
    /// Never fails: every outcome, including an unknown backend, is a decision.
    pub fn evaluate(&self, backend_id: &str, tool_name: &str, arguments: &Value) -> GovernanceDecision {
        let snapshot = self.policies.snapshot();
        let version = snapshot.version();
        let now = self.clock.now();

        let deny = |reason: DenialReason, compiled: Option<&CompiledPolicy>| {
            tracing::info!(
                backend = backend_id,
                tool = tool_name,
                reason = %reason,
                policy_version = version,
                "Call denied"
            );
            GovernanceDecision::denied(
                backend_id,
                tool_name,
                reason,
                compiled.map(|c| c.policy.clone()),
                version,
                now,
            )
        };

        // 1. target
        let Some(compiled) = snapshot.policy(backend_id).map(Arc::as_ref) else {
            return deny(DenialReason::UnknownTarget, None);
        };
        if !snapshot.knows_tool(backend_id, tool_name) {
            return deny(DenialReason::UnknownTarget, Some(compiled));
        }
        let policy = &compiled.policy;

        // 2. time window
        if !policy.is_time_unrestricted() {
            let hour = self.clock.local_hour();
            if !policy.allowed_hours.iter().any(|h| u32::from(*h) == hour) {
                return deny(DenialReason::TimeRestricted, Some(compiled));
            }
        }

        // 3. rate limit
        let Some(permit) = self.limiter.acquire(backend_id, policy.rate_limit_per_minute) else {
            return deny(DenialReason::RateLimited, Some(compiled));
        };

        // 4-5. content
        if let Some(reason) = Self::check_content(compiled, tool_name, arguments) {
            self.limiter.refund(permit);
            return deny(reason, Some(compiled));
        }

        tracing::debug!(
            backend = backend_id,
            tool = tool_name,
            policy_version = version,
            "Call allowed"
        );
        GovernanceDecision::allowed(backend_id, tool_name, Some(policy.clone()), version, now)
    }

    fn check_content(compiled: &CompiledPolicy, tool_name: &str, arguments: &Value) -> Option<DenialReason> {
        let policy = &compiled.policy;
        if compiled.patterns.is_empty() && !policy.high_security {
            return None;
        }

        let canonical = canonical_arguments(arguments);
        if let Some(index) = compiled.patterns.first_match(&canonical) {
            return Some(DenialReason::BlockedPattern(index));
        }

        if policy.high_security
            && (!policy.is_high_security_allowed(tool_name)
                || is_sensitive_operation(tool_name)
                || canonical.len() > policy.max_argument_bytes)
        {
            return Some(DenialReason::HighSecurity);
        }

        None
    }

    pub fn status(&self) -> EngineStatus {
        let snapshot = self.policies.snapshot();
        EngineStatus {
            policy_version: snapshot.version(),
            policies_loaded: snapshot.len(),
            active_rate_limiters: self.limiter.active_windows(),
            total_requests_this_minute: self.limiter.calls_this_minute(),
            timestamp: self.clock.now(),
        }
    }
}
