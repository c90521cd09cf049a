#![deny(unused)]
//! Governance for the bridge.
//!
//! This crate provides:
//! - Versioned policy snapshots with atomic swap
//! - Blocked-pattern matching over canonical arguments
//! - Per-backend fixed-window rate limiting
//! - The ordered decision pipeline
//! - Usage tracking with buffered audit persistence
//! - Logging, distributed tracing and Prometheus metrics setup

pub mod engine;
pub mod metrics;
pub mod patterns;
pub mod policy;
pub mod rate_limit;
pub mod telemetry;
pub mod usage;

pub use engine::{EngineStatus, GovernanceEngine, SENSITIVE_OPERATIONS};
pub use metrics::setup_metrics_recorder;
pub use patterns::{canonical_arguments, PatternSet};
pub use policy::{CompiledPolicy, PolicySnapshot, PolicyStore};
pub use rate_limit::{RateLimiter, RatePermit, RateWindow};
pub use telemetry::{configure_tracing, shutdown_tracing};
pub use usage::{
    ActiveInvocation, AuditStats, BackendUsage, SessionUsage, TrackerConfig, UsageSummary,
    UsageTracker, UsageTrackerBuilder, MAX_TRACKED_TOOLS, OTHER_TOOLS_KEY, UNKNOWN_KEY,
};
