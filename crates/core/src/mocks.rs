//! Mock implementations of core traits for testing.
//!
//! Shared by unit and integration tests across the workspace.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::{
    traits::{AuditStore, BackendTransport, Clock},
    types::{AuditFilter, AuditRecord, ToolOutput, TransportKind},
    Error, Result,
};

// =============================================================================
// Mock Transport
// =============================================================================

/// How a [`MockTransport`] answers calls.
#[derive(Debug, Clone)]
pub enum MockBehavior {
    /// Reply with the tool name and serialized arguments.
    Echo,
    /// Always reply with this output.
    Reply(ToolOutput),
    /// Fail with a backend fault.
    BackendError(String),
    /// Sleep, then echo.
    Delay(Duration),
    /// Drop the connection mid-call.
    DropConnection,
}

/// Scripted in-process backend.
pub struct MockTransport {
    kind: TransportKind,
    tools: Vec<String>,
    behavior: Mutex<MockBehavior>,
    connected: AtomicBool,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl MockTransport {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            kind: TransportKind::Stream,
            tools: tools.iter().map(|t| t.to_string()).collect(),
            behavior: Mutex::new(MockBehavior::Echo),
            connected: AtomicBool::new(true),
            calls: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.set_behavior(behavior);
        self
    }

    pub fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Simulate the backend going away.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Calls received (including ones that failed or timed out).
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion on the backend side.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackendTransport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn call_tool(&self, tool: &str, arguments: Value) -> Result<ToolOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_connected() {
            return Err(Error::backend_unavailable("mock backend disconnected"));
        }

        let behavior = self.behavior.lock().unwrap().clone();
        let output = match behavior {
            MockBehavior::Echo => Ok(ToolOutput::text(format!("{}: {}", tool, arguments))),
            MockBehavior::Reply(output) => Ok(output),
            MockBehavior::BackendError(message) => Err(Error::backend(message)),
            MockBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(ToolOutput::text(format!("{}: {}", tool, arguments)))
            }
            MockBehavior::DropConnection => {
                self.disconnect();
                Err(Error::backend_unavailable("connection closed mid-call"))
            }
        };
        self.completed.fetch_add(1, Ordering::SeqCst);
        output
    }

    async fn list_tools(&self) -> Result<Vec<String>> {
        Ok(self.tools.clone())
    }

    async fn shutdown(&self) -> Result<()> {
        self.disconnect();
        Ok(())
    }
}

// =============================================================================
// Fixed Clock
// =============================================================================

/// Manually advanced clock.
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
    hour: Mutex<Option<u32>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
            hour: Mutex::new(None),
        }
    }

    /// A clock at the start of an arbitrary minute.
    pub fn at_minute_start() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap())
    }

    /// Pin the reported local hour independently of the instant.
    pub fn with_local_hour(self, hour: u32) -> Self {
        *self.hour.lock().unwrap() = Some(hour);
        self
    }

    pub fn set_local_hour(&self, hour: u32) {
        *self.hour.lock().unwrap() = Some(hour);
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += ChronoDuration::from_std(by).unwrap();
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn local_hour(&self) -> u32 {
        match *self.hour.lock().unwrap() {
            Some(hour) => hour,
            None => chrono::Timelike::hour(&self.now().with_timezone(&chrono::Local)),
        }
    }
}

// =============================================================================
// Mock Audit Stores
// =============================================================================

/// Audit store that fails the first `failures` appends, then records.
pub struct FlakyAuditStore {
    remaining_failures: AtomicUsize,
    attempts: AtomicUsize,
    records: Mutex<Vec<AuditRecord>>,
}

impl FlakyAuditStore {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            records: Mutex::new(Vec::new()),
        }
    }

    /// An audit store that never accepts a write.
    pub fn always_failing() -> Self {
        Self::new(usize::MAX)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuditStore for FlakyAuditStore {
    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::storage("audit store unavailable"));
        }
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn query(&self, filter: AuditFilter) -> Result<Vec<AuditRecord>> {
        let records = self.records.lock().unwrap();
        let mut result: Vec<AuditRecord> =
            records.iter().filter(|r| r.matches(&filter)).cloned().collect();
        if let Some(limit) = filter.limit {
            let skip = result.len().saturating_sub(limit);
            result.drain(..skip);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_disconnect() {
        let transport = MockTransport::new(&["read"]);
        assert!(transport.call_tool("read", Value::Null).await.is_ok());

        transport.disconnect();
        let err = transport.call_tool("read", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_flaky_store_recovers() {
        let store = FlakyAuditStore::new(1);
        assert!(store.append(&[]).await.is_err());
        assert!(store.append(&[]).await.is_ok());
        assert_eq!(store.attempts(), 2);
    }

    #[test]
    fn test_fixed_clock_advances_minute() {
        let clock = FixedClock::at_minute_start().with_local_hour(9);
        let minute = clock.minute();
        clock.advance(Duration::from_secs(59));
        assert_eq!(clock.minute(), minute);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.minute(), minute + 1);
        assert_eq!(clock.local_hour(), 9);
    }
}
