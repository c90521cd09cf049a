#![deny(unused)]
//! Audit log store adapters for the governance bridge.
//!
//! Every adapter implements [`AuditStore`]: an append-only sink for
//! governance decisions and invocation outcomes with a filtered query side
//! used by the dashboard surface.

pub mod jsonl;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use gov_bridge_core::config::{AuditBackend, AuditConfig};
use gov_bridge_core::{AuditFilter, AuditRecord, AuditStore, Error, Result};

pub use jsonl::JsonlAuditStore;
pub use memory::InMemoryAuditStore;
pub use sqlite::SqliteAuditStore;

/// Open the audit store selected by configuration.
pub fn open_audit_store(config: &AuditConfig) -> Result<Arc<dyn AuditStore>> {
    let path = || {
        config.path.clone().ok_or_else(|| {
            Error::config(format!(
                "audit backend '{:?}' needs a path",
                config.backend
            ))
        })
    };

    let store: Arc<dyn AuditStore> = match config.backend {
        AuditBackend::Memory => Arc::new(InMemoryAuditStore::new()),
        AuditBackend::Jsonl => Arc::new(JsonlAuditStore::new(path()?)),
        AuditBackend::Sqlite => Arc::new(SqliteAuditStore::open(path()?)?),
    };
    tracing::info!(backend = ?config.backend, path = ?config.path, "Audit store opened");
    Ok(store)
}

/// Apply `filter` to records in append order.
///
/// With a limit, the newest matching records are kept; the result is
/// always oldest first.
pub(crate) fn select<I>(records: I, filter: &AuditFilter) -> Vec<AuditRecord>
where
    I: IntoIterator<Item = AuditRecord>,
{
    let mut matched: Vec<AuditRecord> = records
        .into_iter()
        .filter(|r| r.matches(filter))
        .collect();
    if let Some(limit) = filter.limit {
        let skip = matched.len().saturating_sub(limit);
        matched.drain(..skip);
    }
    matched
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use gov_bridge_core::{AuditRecord, DenialReason, GovernanceDecision, Invocation, ToolOutput};
    use serde_json::json;

    /// Decision and outcome records for one allowed call and one denied call.
    pub fn records() -> Vec<AuditRecord> {
        let ok = Invocation::pending("s1", "fs", "read", json!({"path": "/tmp"}));
        let ok_decision = GovernanceDecision::allowed("fs", "read", None, 1, Utc::now())
            .attach(&ok.invocation_id, "s1");
        let ok = ok.succeed(ToolOutput::text("contents"));

        let denied = Invocation::pending("s2", "db", "query", json!({"sql": "drop"}));
        let denied_decision = GovernanceDecision::denied(
            "db",
            "query",
            DenialReason::BlockedPattern(0),
            None,
            1,
            Utc::now(),
        )
        .attach(&denied.invocation_id, "s2");
        let denied = denied.deny(DenialReason::BlockedPattern(0));

        vec![
            AuditRecord::Decision(ok_decision),
            AuditRecord::Invocation(ok),
            AuditRecord::Decision(denied_decision),
            AuditRecord::Invocation(denied),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_by_default() {
        let store = open_audit_store(&AuditConfig::default()).unwrap();
        store.append(&fixtures::records()).await.unwrap();
        assert_eq!(store.query(AuditFilter::default()).await.unwrap().len(), 4);
    }

    #[test]
    fn test_file_backends_need_path() {
        let config = AuditConfig {
            backend: AuditBackend::Sqlite,
            path: None,
        };
        assert!(matches!(open_audit_store(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_limit_keeps_newest() {
        let filter = AuditFilter {
            limit: Some(2),
            ..Default::default()
        };
        let selected = select(fixtures::records(), &filter);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].backend_id(), "db");
        assert_eq!(selected[0].kind(), gov_bridge_core::AuditRecordKind::Decision);
    }
}
