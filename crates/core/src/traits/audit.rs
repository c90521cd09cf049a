//! Audit log store traits.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AuditFilter, AuditRecord};

/// Append-only sink for governance decisions and invocations.
///
/// The query side is only consumed by the dashboard layer, never by the
/// call path.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append a batch of records, preserving their order.
    async fn append(&self, records: &[AuditRecord]) -> Result<()>;

    /// Query records with optional filters, oldest first.
    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>>;
}
