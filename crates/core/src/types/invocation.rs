use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CallError, ErrorKind};
use crate::types::DenialReason;

// =============================================================================
// Tool Output
// =============================================================================

/// Result of a tool call as returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Concatenated text content.
    pub text: String,

    /// Structured content, if the backend returned any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,

    /// Raw result payload as received from the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,

    /// The backend flagged this result as a tool-level error.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    /// Create a successful text output.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            text: content.into(),
            structured: None,
            raw: None,
            is_error: false,
        }
    }

    /// Create a tool-level error output.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(message)
        }
    }

    /// Attach structured data.
    pub fn with_structured(mut self, data: Value) -> Self {
        self.structured = Some(data);
        self
    }

    /// Attach the raw backend payload.
    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

// =============================================================================
// Invocation
// =============================================================================

/// Lifecycle state of an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Success,
    Error,
    Denied,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
            Self::Denied => "denied",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One client request to call a tool, tracked end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub invocation_id: String,
    pub session_id: String,
    pub backend_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<f64>,
    pub status: InvocationStatus,
    /// Present on success.
    pub result: Option<ToolOutput>,
    /// Present on error or denial.
    pub error: Option<CallError>,
}

impl Invocation {
    /// Start a new pending invocation.
    pub fn pending(
        session_id: impl Into<String>,
        backend_id: impl Into<String>,
        tool_name: impl Into<String>,
        arguments: Value,
    ) -> Self {
        Self {
            invocation_id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            backend_id: backend_id.into(),
            tool_name: tool_name.into(),
            arguments,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: InvocationStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// Transition to `success`.
    pub fn succeed(self, output: ToolOutput) -> Self {
        let mut next = self.finish(InvocationStatus::Success);
        next.result = Some(output);
        next
    }

    /// Transition to `error`.
    pub fn fail(self, error: CallError) -> Self {
        let mut next = self.finish(InvocationStatus::Error);
        next.error = Some(error);
        next
    }

    /// Transition to `denied`.
    pub fn deny(self, reason: DenialReason) -> Self {
        let mut next = self.finish(InvocationStatus::Denied);
        next.error = Some(CallError::new(reason.kind(), reason.to_string()));
        next
    }

    /// Error kind of a failed or denied invocation.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    fn finish(mut self, status: InvocationStatus) -> Self {
        let end = Utc::now();
        let elapsed = (end - self.start_time).num_microseconds().unwrap_or(0);
        self.end_time = Some(end);
        self.duration_ms = Some(elapsed as f64 / 1000.0);
        self.status = status;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lifecycle_transitions() {
        let inv = Invocation::pending("s1", "fs", "read", json!({"path": "/tmp"}));
        assert_eq!(inv.status, InvocationStatus::Pending);
        assert!(!inv.status.is_terminal());

        let done = inv.clone().succeed(ToolOutput::text("ok"));
        assert_eq!(done.status, InvocationStatus::Success);
        assert!(done.end_time.is_some());
        assert!(done.duration_ms.unwrap() >= 0.0);

        let denied = inv.deny(DenialReason::BlockedPattern(0));
        assert_eq!(denied.status, InvocationStatus::Denied);
        assert_eq!(denied.error_kind(), Some(ErrorKind::BlockedPattern));
        assert_eq!(denied.error.unwrap().message, "blocked_pattern:0");
    }
}
