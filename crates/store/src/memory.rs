//! In-memory audit store.

use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};

use gov_bridge_core::{AuditFilter, AuditRecord, AuditStore, Result};

/// Audit store kept in process memory. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(records);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>> {
        let records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Ok(crate::select(records, &filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use gov_bridge_core::AuditRecordKind;

    #[tokio::test]
    async fn test_append_preserves_order() {
        let store = InMemoryAuditStore::new();
        let records = fixtures::records();
        store.append(&records[..2]).await.unwrap();
        store.append(&records[2..]).await.unwrap();
        assert_eq!(store.len(), 4);

        let all = store.query(AuditFilter::default()).await.unwrap();
        let kinds: Vec<_> = all.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                AuditRecordKind::Decision,
                AuditRecordKind::Invocation,
                AuditRecordKind::Decision,
                AuditRecordKind::Invocation,
            ]
        );
    }

    #[tokio::test]
    async fn test_query_by_backend() {
        let store = InMemoryAuditStore::new();
        store.append(&fixtures::records()).await.unwrap();

        let db = store.query(AuditFilter::backend("db")).await.unwrap();
        assert_eq!(db.len(), 2);
        assert!(db.iter().all(|r| r.backend_id() == "db"));
    }
}
