use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{GovernanceDecision, Invocation};

// =============================================================================
// Audit Records
// =============================================================================

/// Kind of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditRecordKind {
    Decision,
    Invocation,
}

impl AuditRecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Invocation => "invocation",
        }
    }
}

/// An entry in the append-only audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Decision(GovernanceDecision),
    Invocation(Invocation),
}

impl AuditRecord {
    pub fn kind(&self) -> AuditRecordKind {
        match self {
            Self::Decision(_) => AuditRecordKind::Decision,
            Self::Invocation(_) => AuditRecordKind::Invocation,
        }
    }

    pub fn backend_id(&self) -> &str {
        match self {
            Self::Decision(d) => &d.backend_id,
            Self::Invocation(i) => &i.backend_id,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Decision(d) => d.session_id.as_deref(),
            Self::Invocation(i) => Some(&i.session_id),
        }
    }

    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Decision(d) => d.invocation_id.as_deref(),
            Self::Invocation(i) => Some(&i.invocation_id),
        }
    }

    /// Time the record refers to (decision time, or invocation end time).
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Decision(d) => d.timestamp,
            Self::Invocation(i) => i.end_time.unwrap_or(i.start_time),
        }
    }

    /// Whether this record satisfies every set field of the filter
    /// (`limit` is applied by the store).
    pub fn matches(&self, filter: &AuditFilter) -> bool {
        filter.backend_id.as_ref().map_or(true, |b| b == self.backend_id())
            && filter
                .session_id
                .as_ref()
                .map_or(true, |s| Some(s.as_str()) == self.session_id())
            && filter
                .invocation_id
                .as_ref()
                .map_or(true, |i| Some(i.as_str()) == self.invocation_id())
            && filter.kind.map_or(true, |k| k == self.kind())
            && filter.from.map_or(true, |from| self.timestamp() >= from)
            && filter.to.map_or(true, |to| self.timestamp() <= to)
    }
}

/// Filter for querying audit logs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    #[serde(default, alias = "backend")]
    pub backend_id: Option<String>,
    #[serde(default, alias = "session")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub kind: Option<AuditRecordKind>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn backend(id: impl Into<String>) -> Self {
        Self {
            backend_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn invocation(id: impl Into<String>) -> Self {
        Self {
            invocation_id: Some(id.into()),
            ..Default::default()
        }
    }
}
