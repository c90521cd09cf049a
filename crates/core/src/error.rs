//! Error types for the governance bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::DenialReason;

/// Result type alias using the bridge's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kind surfaced to clients of the call surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownTarget,
    TimeRestricted,
    RateLimited,
    BlockedPattern,
    HighSecurity,
    BackendUnavailable,
    Timeout,
    BackendError,
    Internal,
}

impl ErrorKind {
    /// Stable snake_case label (used in metrics and wire payloads).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownTarget => "unknown_target",
            Self::TimeRestricted => "time_restricted",
            Self::RateLimited => "rate_limited",
            Self::BlockedPattern => "blocked_pattern",
            Self::HighSecurity => "high_security",
            Self::BackendUnavailable => "backend_unavailable",
            Self::Timeout => "timeout",
            Self::BackendError => "backend_error",
            Self::Internal => "internal",
        }
    }

    /// Whether this kind is a policy denial rather than a fault.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::UnknownTarget
                | Self::TimeRestricted
                | Self::RateLimited
                | Self::BlockedPattern
                | Self::HighSecurity
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for the governance bridge.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Policy Denials (expected, not faults)
    // =========================================================================
    #[error("Governance denied: {0}")]
    Denied(DenialReason),

    // =========================================================================
    // Backend Faults
    // =========================================================================
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // =========================================================================
    // Configuration & Policy Errors
    // =========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    // =========================================================================
    // Internal Faults
    // =========================================================================
    #[error("Audit store error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a backend-unavailable error.
    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    /// Create a backend fault.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-policy error.
    pub fn invalid_policy(msg: impl Into<String>) -> Self {
        Self::InvalidPolicy(msg.into())
    }

    /// Create a storage error.
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Map this error onto the client-facing error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Denied(reason) => reason.kind(),
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Backend(_) | Self::Serialization(_) => ErrorKind::BackendError,
            Self::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        }
    }
}

/// Structured error returned by the client call surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CallError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CallError {}

impl From<&Error> for CallError {
    fn from(err: &Error) -> Self {
        let message = match err {
            Error::Denied(reason) => reason.to_string(),
            other => other.to_string(),
        };
        Self::new(err.kind(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::backend_unavailable("gone").kind(),
            ErrorKind::BackendUnavailable
        );
        assert_eq!(Error::timeout("slow").kind(), ErrorKind::Timeout);
        assert_eq!(Error::backend("bad json").kind(), ErrorKind::BackendError);
        assert_eq!(
            Error::Denied(DenialReason::BlockedPattern(2)).kind(),
            ErrorKind::BlockedPattern
        );
        assert_eq!(Error::storage("disk").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_call_error_carries_reason() {
        let err = Error::Denied(DenialReason::BlockedPattern(0));
        let call_err = CallError::from(&err);
        assert_eq!(call_err.kind, ErrorKind::BlockedPattern);
        assert_eq!(call_err.message, "blocked_pattern:0");
        assert!(ErrorKind::RateLimited.is_denial());
        assert!(!ErrorKind::Timeout.is_denial());
    }
}
