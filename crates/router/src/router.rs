//! Backend router: owns one transport per backend and dispatches tool calls.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use gov_bridge_core::{
    BackendHealth, BackendSpec, BackendStatus, BackendTransport, Error, Result, ToolOutput,
};

use crate::transport;

/// Upper bound on a `tools/list` round trip during discovery.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default upper bound on connecting and completing the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct BackendHandle {
    spec: Option<BackendSpec>,
    transport: Arc<dyn BackendTransport>,
    tools: RwLock<Vec<String>>,
    degraded: AtomicBool,
}

impl BackendHandle {
    fn health(&self) -> BackendHealth {
        if !self.transport.is_connected() {
            BackendHealth::Disconnected
        } else if self.degraded.load(Ordering::Relaxed) {
            BackendHealth::Degraded
        } else {
            BackendHealth::Connected
        }
    }

    fn tools(&self) -> Vec<String> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Routes calls to registered backends.
pub struct BackendRouter {
    backends: DashMap<String, Arc<BackendHandle>>,
    connect_timeout_ms: AtomicU64,
}

impl Default for BackendRouter {
    fn default() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl BackendRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(timeout: Duration) -> Self {
        Self {
            backends: DashMap::new(),
            connect_timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Connect to a backend described by `spec` and register it, replacing
    /// any previous registration under the same id.
    ///
    /// A backend that does not finish its handshake within the connect
    /// timeout is `backend_unavailable`; the half-open connection is dropped.
    pub async fn register(&self, spec: BackendSpec) -> Result<()> {
        tracing::info!(backend = %spec.id, transport = %spec.transport.kind(), "Registering backend");
        let timeout = self.connect_timeout();
        let transport = tokio::time::timeout(timeout, transport::connect(&spec))
            .await
            .map_err(|_| {
                Error::backend_unavailable(format!(
                    "backend '{}' did not complete its handshake within {:?}",
                    spec.id, timeout
                ))
            })??;
        self.insert(spec.id.clone(), Some(spec.clone()), transport, spec.tools)
            .await;
        Ok(())
    }

    /// Register an already-connected transport.
    pub async fn register_transport(
        &self,
        backend_id: impl Into<String>,
        transport: Arc<dyn BackendTransport>,
        tools: Vec<String>,
    ) {
        self.insert(backend_id.into(), None, transport, tools).await;
    }

    async fn insert(
        &self,
        backend_id: String,
        spec: Option<BackendSpec>,
        transport: Arc<dyn BackendTransport>,
        tools: Vec<String>,
    ) {
        let handle = Arc::new(BackendHandle {
            spec,
            transport,
            tools: RwLock::new(tools),
            degraded: AtomicBool::new(false),
        });
        let previous = self.backends.insert(backend_id.clone(), handle);
        if let Some(previous) = previous {
            if let Err(e) = previous.transport.shutdown().await {
                tracing::warn!(backend = %backend_id, error = %e, "Replaced transport did not shut down cleanly");
            }
        }
    }

    /// Unregister a backend and shut its transport down.
    pub async fn remove(&self, backend_id: &str) -> bool {
        let Some((_, handle)) = self.backends.remove(backend_id) else {
            return false;
        };
        if let Err(e) = handle.transport.shutdown().await {
            tracing::warn!(backend = backend_id, error = %e, "Transport did not shut down cleanly");
        }
        tracing::info!(backend = backend_id, "Backend removed");
        true
    }

    pub fn contains(&self, backend_id: &str) -> bool {
        self.backends.contains_key(backend_id)
    }

    /// The descriptor a backend was registered from, if any.
    pub fn spec(&self, backend_id: &str) -> Option<BackendSpec> {
        self.backends.get(backend_id).and_then(|h| h.spec.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn handle(&self, backend_id: &str) -> Option<Arc<BackendHandle>> {
        self.backends.get(backend_id).map(|h| h.value().clone())
    }

    /// Forward one tool call. No retry: an absent or disconnected backend
    /// fails immediately, and a call exceeding `timeout` is abandoned.
    pub async fn dispatch(
        &self,
        backend_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolOutput> {
        let handle = self.handle(backend_id).ok_or_else(|| {
            Error::backend_unavailable(format!("backend '{}' is not registered", backend_id))
        })?;
        if !handle.transport.is_connected() {
            return Err(Error::backend_unavailable(format!(
                "backend '{}' is disconnected",
                backend_id
            )));
        }

        let call = handle.transport.call_tool(tool_name, arguments);
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(backend = backend_id, tool = tool_name, ?timeout, "Backend call timed out");
                return Err(Error::timeout(format!(
                    "'{}' on '{}' did not finish within {:?}",
                    tool_name, backend_id, timeout
                )));
            }
        };

        match &result {
            Ok(_) => {
                if handle.degraded.swap(false, Ordering::Relaxed) {
                    tracing::info!(backend = backend_id, "Backend recovered");
                }
            }
            Err(e @ (Error::Backend(_) | Error::Serialization(_) | Error::BackendUnavailable(_))) => {
                if !handle.degraded.swap(true, Ordering::Relaxed) {
                    tracing::warn!(backend = backend_id, error = %e, "Backend degraded");
                }
            }
            Err(_) => {}
        }
        result
    }

    /// Ask a backend for its tool list and record it as the declared tools.
    pub async fn discover_tools(&self, backend_id: &str) -> Result<Vec<String>> {
        let handle = self.handle(backend_id).ok_or_else(|| {
            Error::backend_unavailable(format!("backend '{}' is not registered", backend_id))
        })?;

        let tools = tokio::time::timeout(DISCOVERY_TIMEOUT, handle.transport.list_tools())
            .await
            .map_err(|_| Error::timeout(format!("tool discovery on '{}' timed out", backend_id)))??;

        *handle.tools.write().unwrap_or_else(PoisonError::into_inner) = tools.clone();
        tracing::info!(backend = backend_id, tools = tools.len(), "Discovered tools");
        Ok(tools)
    }

    /// Declared tools of a backend.
    pub fn tools(&self, backend_id: &str) -> Option<Vec<String>> {
        self.handle(backend_id).map(|h| h.tools())
    }

    /// Health of every registered backend, sorted by id.
    pub fn backends(&self) -> Vec<BackendStatus> {
        let mut statuses: Vec<BackendStatus> = self
            .backends
            .iter()
            .map(|entry| BackendStatus {
                id: entry.key().clone(),
                kind: entry.transport.kind(),
                health: entry.health(),
                tools: entry.tools(),
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Shut every transport down and clear the registry.
    pub async fn shutdown(&self) {
        for id in self.ids() {
            self.remove(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gov_bridge_core::mocks::{MockBehavior, MockTransport};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_dispatch_unknown_backend() {
        let router = BackendRouter::new();
        let err = router.dispatch("ghost", "read", json!({}), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_dispatch_echo() {
        let router = BackendRouter::new();
        router
            .register_transport("fs", Arc::new(MockTransport::new(&["read"])), vec!["read".into()])
            .await;

        let output = router.dispatch("fs", "read", json!({"p": 1}), TIMEOUT).await.unwrap();
        assert!(output.text.starts_with("read:"));
        assert_eq!(router.backends()[0].health, BackendHealth::Connected);
    }

    #[tokio::test]
    async fn test_timeout() {
        let router = BackendRouter::new();
        let mock = Arc::new(MockTransport::new(&[]).with_behavior(MockBehavior::Delay(Duration::from_secs(5))));
        router.register_transport("slow", mock.clone(), vec![]).await;

        let err = router
            .dispatch("slow", "wait", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // the abandoned call never completed on the backend side
        assert_eq!(mock.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_fault_degrades_then_recovers() {
        let router = BackendRouter::new();
        let mock = Arc::new(MockTransport::new(&[]).with_behavior(MockBehavior::BackendError("bad frame".into())));
        router.register_transport("db", mock.clone(), vec![]).await;

        assert!(router.dispatch("db", "q", json!({}), TIMEOUT).await.is_err());
        assert_eq!(router.backends()[0].health, BackendHealth::Degraded);

        mock.set_behavior(MockBehavior::Echo);
        assert!(router.dispatch("db", "q", json!({}), TIMEOUT).await.is_ok());
        assert_eq!(router.backends()[0].health, BackendHealth::Connected);
    }

    #[tokio::test]
    async fn test_disconnected_backend_not_retried() {
        let router = BackendRouter::new();
        let mock = Arc::new(MockTransport::new(&[]).with_behavior(MockBehavior::DropConnection));
        router.register_transport("fs", mock.clone(), vec![]).await;

        let err = router.dispatch("fs", "read", json!({}), TIMEOUT).await.unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(mock.call_count(), 1);
        assert_eq!(router.backends()[0].health, BackendHealth::Disconnected);

        // later calls fail fast without reaching the transport
        assert!(router.dispatch("fs", "read", json!({}), TIMEOUT).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_discover_and_remove() {
        let router = BackendRouter::new();
        let mock = Arc::new(MockTransport::new(&["a", "b"]));
        router.register_transport("fs", mock.clone(), vec![]).await;

        assert_eq!(router.discover_tools("fs").await.unwrap(), vec!["a", "b"]);
        assert_eq!(router.tools("fs").unwrap().len(), 2);

        assert!(router.remove("fs").await);
        assert!(!router.contains("fs"));
        assert!(!mock.is_connected());
        assert!(!router.remove("fs").await);
    }
}
