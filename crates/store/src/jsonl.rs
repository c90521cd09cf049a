//! JSON-lines audit store: one serialized record per line, append only.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use gov_bridge_core::{AuditFilter, AuditRecord, AuditStore, Error, Result};

/// Audit store backed by a newline-delimited JSON file.
pub struct JsonlAuditStore {
    path: PathBuf,
    /// Serializes appends so batches never interleave.
    write_lock: Mutex<()>,
}

impl JsonlAuditStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::storage(format!("failed to create audit directory: {}", e))
            })?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::storage(format!("failed to open {}: {}", self.path.display(), e)))?;
        file.write_all(&buf)
            .await
            .map_err(|e| Error::storage(format!("failed to append audit records: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| Error::storage(format!("failed to flush audit file: {}", e)))?;
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::storage(format!(
                    "failed to read {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let records = content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<AuditRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = n + 1, error = %e, "Skipping unreadable audit line");
                    None
                }
            });
        Ok(crate::select(records, &filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use gov_bridge_core::AuditRecordKind;

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAuditStore::new(dir.path().join("audit.jsonl"));
        assert!(store.query(AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlAuditStore::new(dir.path().join("nested/audit.jsonl"));
        let records = fixtures::records();
        store.append(&records).await.unwrap();

        let content = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(content.lines().count(), 4);

        let filter = AuditFilter {
            session_id: Some("s2".into()),
            kind: Some(AuditRecordKind::Invocation),
            ..Default::default()
        };
        let found = store.query(filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].invocation_id(), records[3].invocation_id());
    }

    #[tokio::test]
    async fn test_reopen_and_skip_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        JsonlAuditStore::new(&path)
            .append(&fixtures::records())
            .await
            .unwrap();

        // a torn write from a crash leaves a partial line behind
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"kind\":\"decis\n");
        std::fs::write(&path, content).unwrap();

        let reopened = JsonlAuditStore::new(&path);
        assert_eq!(reopened.query(AuditFilter::default()).await.unwrap().len(), 4);
    }
}
