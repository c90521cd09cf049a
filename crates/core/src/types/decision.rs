use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::Policy;

// =============================================================================
// Governance Decision Types
// =============================================================================

/// Why a call was denied.
///
/// Serialized as its reason string (`blocked_pattern:<index>` for pattern hits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DenialReason {
    UnknownTarget,
    TimeRestricted,
    RateLimited,
    /// Index into the policy's `blocked_patterns`.
    BlockedPattern(usize),
    HighSecurity,
}

impl DenialReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownTarget => ErrorKind::UnknownTarget,
            Self::TimeRestricted => ErrorKind::TimeRestricted,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::BlockedPattern(_) => ErrorKind::BlockedPattern,
            Self::HighSecurity => ErrorKind::HighSecurity,
        }
    }
}

impl std::fmt::Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BlockedPattern(index) => write!(f, "blocked_pattern:{}", index),
            other => f.write_str(other.kind().as_str()),
        }
    }
}

impl From<DenialReason> for String {
    fn from(reason: DenialReason) -> Self {
        reason.to_string()
    }
}

impl TryFrom<String> for DenialReason {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        if let Some(index) = value.strip_prefix("blocked_pattern:") {
            return index
                .parse()
                .map(Self::BlockedPattern)
                .map_err(|_| format!("invalid pattern index in '{}'", value));
        }
        match value.as_str() {
            "unknown_target" => Ok(Self::UnknownTarget),
            "time_restricted" => Ok(Self::TimeRestricted),
            "rate_limited" => Ok(Self::RateLimited),
            "high_security" => Ok(Self::HighSecurity),
            other => Err(format!("unknown denial reason '{}'", other)),
        }
    }
}

/// Allow/deny verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allowed,
    Denied,
}

/// The verdict for one invocation. Written once, never mutated after
/// the middleware attaches the invocation identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceDecision {
    /// Invocation this decision belongs to.
    pub invocation_id: Option<String>,
    /// Session of the invocation.
    pub session_id: Option<String>,
    pub backend_id: String,
    pub tool_name: String,
    pub decision: Decision,
    /// Present iff denied.
    pub reason: Option<DenialReason>,
    /// Policy the call was evaluated under (absent for unknown backends).
    pub policy_snapshot: Option<Policy>,
    /// Version of the policy snapshot.
    pub policy_version: u64,
    pub timestamp: DateTime<Utc>,
}

impl GovernanceDecision {
    /// An allowing decision.
    pub fn allowed(
        backend_id: impl Into<String>,
        tool_name: impl Into<String>,
        policy: Option<Policy>,
        policy_version: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            invocation_id: None,
            session_id: None,
            backend_id: backend_id.into(),
            tool_name: tool_name.into(),
            decision: Decision::Allowed,
            reason: None,
            policy_snapshot: policy,
            policy_version,
            timestamp,
        }
    }

    /// A denying decision.
    pub fn denied(
        backend_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: DenialReason,
        policy: Option<Policy>,
        policy_version: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            decision: Decision::Denied,
            reason: Some(reason),
            ..Self::allowed(backend_id, tool_name, policy, policy_version, timestamp)
        }
    }

    /// Bind this decision to an invocation.
    pub fn attach(mut self, invocation_id: &str, session_id: &str) -> Self {
        self.invocation_id = Some(invocation_id.to_string());
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allowed
    }
}
