//! SQLite audit store.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;

use gov_bridge_core::{AuditFilter, AuditRecord, AuditStore, Error, Result};

/// SQLite-backed audit log.
///
/// Indexed columns mirror the filterable fields; the full record is kept
/// as a JSON payload.
pub struct SqliteAuditStore {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

/// Fixed-width UTC form so timestamps order correctly as text.
fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn db_error(context: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::storage(format!("{}: {}", context, e))
}

impl SqliteAuditStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_error("open failed"))?;
        Self::init(conn)
    }

    /// A private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_error("open failed"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS audit_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                session_id TEXT,
                invocation_id TEXT,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL -- JSON
            );
            CREATE INDEX IF NOT EXISTS idx_audit_backend ON audit_records (backend_id);
            CREATE INDEX IF NOT EXISTS idx_audit_session ON audit_records (session_id);
            CREATE INDEX IF NOT EXISTS idx_audit_invocation ON audit_records (invocation_id);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_records (timestamp);",
        )
        .map_err(db_error("schema error"))?;

        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }
}

struct Row {
    kind: &'static str,
    backend_id: String,
    session_id: Option<String>,
    invocation_id: Option<String>,
    timestamp: String,
    payload: String,
}

impl Row {
    fn from_record(record: &AuditRecord) -> Result<Self> {
        Ok(Self {
            kind: record.kind().as_str(),
            backend_id: record.backend_id().to_string(),
            session_id: record.session_id().map(String::from),
            invocation_id: record.invocation_id().map(String::from),
            timestamp: timestamp_key(record.timestamp()),
            payload: serde_json::to_string(record)?,
        })
    }
}

/// WHERE clause and its positional parameters for `filter`.
fn where_clause(filter: &AuditFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut values = Vec::new();

    let mut push = |column: &str, op: &str, value: String| {
        values.push(value);
        conditions.push(format!("{} {} ?{}", column, op, values.len()));
    };

    if let Some(backend) = &filter.backend_id {
        push("backend_id", "=", backend.clone());
    }
    if let Some(session) = &filter.session_id {
        push("session_id", "=", session.clone());
    }
    if let Some(invocation) = &filter.invocation_id {
        push("invocation_id", "=", invocation.clone());
    }
    if let Some(kind) = filter.kind {
        push("kind", "=", kind.as_str().to_string());
    }
    if let Some(from) = filter.from {
        push("timestamp", ">=", timestamp_key(from));
    }
    if let Some(to) = filter.to {
        push("timestamp", "<=", timestamp_key(to));
    }

    if conditions.is_empty() {
        (String::new(), values)
    } else {
        (format!(" WHERE {}", conditions.join(" AND ")), values)
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        let rows = records
            .iter()
            .map(Row::from_record)
            .collect::<Result<Vec<_>>>()?;
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction().map_err(db_error("transaction error"))?;
            {
                let mut stmt = tx
                    .prepare_cached(
                        "INSERT INTO audit_records (kind, backend_id, session_id, invocation_id, timestamp, payload)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    )
                    .map_err(db_error("prepare error"))?;
                for row in &rows {
                    stmt.execute(params![
                        row.kind,
                        row.backend_id,
                        row.session_id,
                        row.invocation_id,
                        row.timestamp,
                        row.payload
                    ])
                    .map_err(db_error("insert error"))?;
                }
            }
            tx.commit().map_err(db_error("commit error"))
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>> {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let (clause, values) = where_clause(&filter);
            // newest first so LIMIT keeps the latest rows; reversed below
            let mut sql = format!("SELECT payload FROM audit_records{} ORDER BY seq DESC", clause);
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {}", limit));
            }

            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(&sql).map_err(db_error("prepare error"))?;
            let payloads = stmt
                .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))
                .map_err(db_error("query error"))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(db_error("row error"))?;

            let mut records = payloads
                .iter()
                .map(|p| serde_json::from_str::<AuditRecord>(p))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            records.reverse();
            Ok(records)
        })
        .await
        .map_err(|e| Error::internal(e.to_string()))?
    }
}
