use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Error, Result};

// =============================================================================
// Policy Types
// =============================================================================

/// Default rate limit applied when a backend does not configure one.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 100;

/// Default cap on canonical argument size in high-security mode.
pub const DEFAULT_MAX_ARGUMENT_BYTES: usize = 10_000;

/// Baseline blocked patterns applied when a backend does not list its own.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    r"(password|secret|token|key)\s*[:=]\s*\w+",
    r"(rm|del|delete)\s+-rf",
    r"drop\s+table",
    r"eval\s*\(",
    r"exec\s*\(",
];

/// How much of each call is persisted to the audit log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingLevel {
    /// Identity, timing and status only.
    Basic,
    /// Also arguments and (truncated) results.
    #[default]
    Detailed,
}

/// Governance policy for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Backend this policy governs.
    pub backend_id: String,

    /// Calls allowed per wall-clock minute. Zero blocks the backend entirely.
    pub rate_limit_per_minute: u32,

    /// Local hours (0-23) during which calls are allowed. Empty means always.
    #[serde(default)]
    pub allowed_hours: BTreeSet<u8>,

    /// Regular expressions tested in order against the canonical arguments.
    #[serde(default)]
    pub blocked_patterns: Vec<String>,

    /// Default-deny mode.
    #[serde(default)]
    pub high_security: bool,

    /// Tools permitted while `high_security` is on.
    #[serde(default)]
    pub high_security_allow: Vec<String>,

    /// Upper bound on canonical argument size in high-security mode.
    #[serde(default = "default_max_argument_bytes")]
    pub max_argument_bytes: usize,

    /// Audit verbosity.
    #[serde(default)]
    pub tracking_level: TrackingLevel,
}

fn default_max_argument_bytes() -> usize {
    DEFAULT_MAX_ARGUMENT_BYTES
}

impl Policy {
    /// Create a permissive policy for a backend.
    pub fn new(backend_id: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            rate_limit_per_minute: DEFAULT_RATE_LIMIT_PER_MINUTE,
            allowed_hours: BTreeSet::new(),
            blocked_patterns: Vec::new(),
            high_security: false,
            high_security_allow: Vec::new(),
            max_argument_bytes: DEFAULT_MAX_ARGUMENT_BYTES,
            tracking_level: TrackingLevel::Detailed,
        }
    }

    /// Set the per-minute rate limit.
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    /// Restrict calls to the given local hours.
    pub fn with_allowed_hours(mut self, hours: impl IntoIterator<Item = u8>) -> Self {
        self.allowed_hours = hours.into_iter().collect();
        self
    }

    /// Append a blocked pattern.
    pub fn block_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.blocked_patterns.push(pattern.into());
        self
    }

    /// Enable high-security mode with an explicit allow-list.
    pub fn with_high_security(mut self, allow: Vec<String>) -> Self {
        self.high_security = true;
        self.high_security_allow = allow;
        self
    }

    /// Set the tracking level.
    pub fn with_tracking(mut self, level: TrackingLevel) -> Self {
        self.tracking_level = level;
        self
    }

    /// Whether calls are unrestricted in time.
    pub fn is_time_unrestricted(&self) -> bool {
        self.allowed_hours.is_empty()
    }

    /// Whether a tool is on the high-security allow-list.
    pub fn is_high_security_allowed(&self, tool: &str) -> bool {
        self.high_security_allow.iter().any(|t| t == tool)
    }

    /// Check structural invariants. Pattern syntax is checked at compile time
    /// by the policy store.
    pub fn validate(&self) -> Result<()> {
        if self.backend_id.trim().is_empty() {
            return Err(Error::invalid_policy("backend_id must not be empty"));
        }
        if let Some(hour) = self.allowed_hours.iter().find(|h| **h > 23) {
            return Err(Error::invalid_policy(format!(
                "backend '{}': allowed hour {} out of range 0-23",
                self.backend_id, hour
            )));
        }
        if self.high_security && self.max_argument_bytes == 0 {
            return Err(Error::invalid_policy(format!(
                "backend '{}': max_argument_bytes must be positive",
                self.backend_id
            )));
        }
        Ok(())
    }
}
