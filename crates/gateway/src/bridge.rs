//! Bridge assembly: wires policies, router, engine, tracker and interceptor
//! from configuration, and applies configuration reloads at runtime.

use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use gov_bridge_core::config::AppConfig;
use gov_bridge_core::{AuditStore, BackendSpec, Error, Result};
use gov_bridge_governance::{
    GovernanceEngine, PolicySnapshot, PolicyStore, TrackerConfig, UsageTracker,
};
use gov_bridge_router::BackendRouter;

use crate::interceptor::Interceptor;

/// What a reload changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub policy_version: u64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reconnected: Vec<String>,
    /// Backends whose connection could not be established. Their policies
    /// are still installed; calls fail `backend_unavailable`.
    pub failed: Vec<String>,
}

/// The assembled governance bridge.
pub struct Bridge {
    policies: Arc<PolicyStore>,
    interceptor: Arc<Interceptor>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Assemble from already-built components.
    pub fn new(
        engine: Arc<GovernanceEngine>,
        router: Arc<BackendRouter>,
        tracker: Arc<UsageTracker>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            policies: engine.policies().clone(),
            interceptor: Arc::new(Interceptor::new(engine, router, tracker, call_timeout)),
            sweeper: Mutex::new(None),
        }
    }

    /// Build the bridge from configuration: connect every backend, discover
    /// undeclared tool lists, and start the idle-session sweeper.
    ///
    /// A backend that cannot be reached does not fail startup.
    pub async fn from_config(config: &AppConfig, store: Arc<dyn AuditStore>) -> Result<Self> {
        let policies = config.policies()?;
        let specs = config.backend_specs()?;
        // reject bad patterns before any connection is opened
        PolicySnapshot::build(policies.clone(), Vec::<(String, Vec<String>)>::new())?;

        let router = Arc::new(BackendRouter::with_connect_timeout(config.connect_timeout()));
        for (id, e) in register_all(&router, &specs).await {
            tracing::warn!(backend = %id, error = %e, "Backend unreachable at startup");
        }
        let tools = resolve_tools(&router, &specs).await;

        let policy_store = Arc::new(PolicyStore::from_policies(policies, tools)?);
        let tracker = Arc::new(
            UsageTracker::builder(store)
                .config(TrackerConfig::from(&config.governance))
                .policies(policy_store.clone())
                .build(),
        );
        let engine = Arc::new(GovernanceEngine::new(policy_store));

        let bridge = Self::new(engine, router, tracker, config.call_timeout());
        bridge.start_sweeper(Duration::from_secs(config.governance.sweep_interval_secs.max(1)));

        tracing::info!(
            backends = specs.len(),
            policy_version = bridge.policies.version(),
            "Governance bridge assembled"
        );
        Ok(bridge)
    }

    pub fn interceptor(&self) -> &Arc<Interceptor> {
        &self.interceptor
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn engine(&self) -> &Arc<GovernanceEngine> {
        self.interceptor.engine()
    }

    pub fn router(&self) -> &Arc<BackendRouter> {
        self.interceptor.router()
    }

    pub fn tracker(&self) -> &Arc<UsageTracker> {
        self.interceptor.tracker()
    }

    /// Periodically expire idle sessions. Replaces a running sweeper.
    pub fn start_sweeper(&self, period: Duration) {
        let handle = self.tracker().spawn_sweeper(period);
        let previous = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Apply a new configuration.
    ///
    /// Policies are validated before anything changes; an invalid
    /// configuration leaves the running snapshot and connections untouched.
    /// Backends are then reconciled (removed, added, reconnected when their
    /// transport changed) and the new snapshot is swapped in atomically.
    pub async fn reload(&self, config: &AppConfig) -> Result<ReloadReport> {
        let policies = config.policies()?;
        let specs = config.backend_specs()?;
        PolicySnapshot::build(policies.clone(), Vec::<(String, Vec<String>)>::new())?;

        let router = self.router();
        let mut report = ReloadReport::default();

        let wanted: BTreeSet<&str> = specs.iter().map(|s| s.id.as_str()).collect();
        for id in router.ids() {
            if !wanted.contains(id.as_str()) && router.remove(&id).await {
                report.removed.push(id);
            }
        }

        router.set_connect_timeout(config.connect_timeout());
        let changed: Vec<(BackendSpec, bool)> = specs
            .iter()
            .filter(|spec| router.spec(&spec.id).map(|s| s.transport) != Some(spec.transport.clone()))
            .map(|spec| (spec.clone(), !router.contains(&spec.id)))
            .collect();
        let to_register: Vec<BackendSpec> = changed.iter().map(|(spec, _)| spec.clone()).collect();
        let failures = register_all(router, &to_register).await;

        for (spec, is_new) in changed {
            match failures.iter().find(|(id, _)| *id == spec.id) {
                Some((_, e)) => {
                    tracing::warn!(backend = %spec.id, error = %e, "Backend unreachable after reload");
                    report.failed.push(spec.id);
                }
                None if is_new => report.added.push(spec.id),
                None => report.reconnected.push(spec.id),
            }
        }

        let tools = resolve_tools(router, &specs).await;
        report.policy_version = self.policies.replace(policies, tools)?;
        self.interceptor.set_call_timeout(config.call_timeout());

        tracing::info!(
            version = report.policy_version,
            added = report.added.len(),
            removed = report.removed.len(),
            reconnected = report.reconnected.len(),
            failed = report.failed.len(),
            "Configuration reloaded"
        );
        Ok(report)
    }

    /// Flush the audit buffer, stop background tasks, and close every backend.
    pub async fn shutdown(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        self.tracker().shutdown().await;
        self.router().shutdown().await;
        tracing::info!("Governance bridge stopped");
    }
}

/// Connect every backend concurrently. Returns the ones that failed.
async fn register_all(router: &BackendRouter, specs: &[BackendSpec]) -> Vec<(String, Error)> {
    let attempts = specs.iter().map(|spec| async move {
        router
            .register(spec.clone())
            .await
            .err()
            .map(|e| (spec.id.clone(), e))
    });
    join_all(attempts).await.into_iter().flatten().collect()
}

/// Declared tools per backend. Backends that declare none keep a previously
/// discovered list, or are asked for one now.
async fn resolve_tools(router: &BackendRouter, specs: &[BackendSpec]) -> Vec<(String, Vec<String>)> {
    let lookups = specs.iter().map(|spec| async move {
        if !spec.tools.is_empty() {
            return (spec.id.clone(), spec.tools.clone());
        }
        if let Some(known) = router.tools(&spec.id).filter(|t| !t.is_empty()) {
            return (spec.id.clone(), known);
        }
        if !router.contains(&spec.id) {
            return (spec.id.clone(), Vec::new());
        }
        match router.discover_tools(&spec.id).await {
            Ok(tools) => (spec.id.clone(), tools),
            Err(e) => {
                tracing::warn!(backend = %spec.id, error = %e, "Tool discovery failed; accepting any tool");
                (spec.id.clone(), Vec::new())
            }
        }
    });
    join_all(lookups).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use gov_bridge_core::config::BackendConfig;
    use gov_bridge_core::TransportSpec;
    use tokio::net::TcpListener;
    use gov_bridge_store::InMemoryAuditStore;

    fn unreachable_backend(tools: &[&str]) -> BackendConfig {
        BackendConfig {
            transport: TransportSpec::Stream {
                address: "127.0.0.1:9".into(),
            },
            tools: tools.iter().map(|t| t.to_string()).collect(),
            policy: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_does_not_fail_startup() {
        let mut config = AppConfig::default();
        config.backends.insert("fs".into(), unreachable_backend(&["read"]));

        let bridge = Bridge::from_config(&config, Arc::new(InMemoryAuditStore::new()))
            .await
            .unwrap();
        assert!(bridge.policies().snapshot().policy("fs").is_some());
        assert!(!bridge.router().contains("fs"));
        bridge.shutdown().await;
    }

    /// Accepts connections and never answers.
    async fn silent_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        address
    }

    #[tokio::test]
    async fn test_silent_backend_does_not_stall_startup_or_reload() {
        let address = silent_backend().await;
        let mut config = AppConfig::default();
        config.governance.connect_timeout_ms = 100;
        for id in ["silent-a", "silent-b"] {
            config.backends.insert(
                id.into(),
                BackendConfig {
                    transport: TransportSpec::Stream {
                        address: address.clone(),
                    },
                    tools: vec!["read".into()],
                    policy: Default::default(),
                },
            );
        }

        let started = tokio::time::timeout(
            Duration::from_secs(5),
            Bridge::from_config(&config, Arc::new(InMemoryAuditStore::new())),
        )
        .await
        .expect("startup stalled on a silent backend")
        .unwrap();
        assert!(!started.router().contains("silent-a"));
        assert!(started.policies().snapshot().policy("silent-b").is_some());

        let report = tokio::time::timeout(Duration::from_secs(5), started.reload(&config))
            .await
            .expect("reload stalled on a silent backend")
            .unwrap();
        assert_eq!(report.failed, vec!["silent-a", "silent-b"]);
        started.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_snapshot() {
        let mut config = AppConfig::default();
        config.backends.insert("fs".into(), unreachable_backend(&["read"]));
        let bridge = Bridge::from_config(&config, Arc::new(InMemoryAuditStore::new()))
            .await
            .unwrap();
        let version = bridge.policies().version();

        let mut broken = config.clone();
        if let Some(fs) = broken.backends.get_mut("fs") {
            fs.policy.blocked_patterns = Some(vec!["(unclosed".into()]);
        }
        let err = bridge.reload(&broken).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPolicy(_)));
        assert_eq!(bridge.policies().version(), version);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_reload_reports_failures_and_swaps() {
        let bridge = Bridge::from_config(&AppConfig::default(), Arc::new(InMemoryAuditStore::new()))
            .await
            .unwrap();
        let before = bridge.policies().version();

        let mut config = AppConfig::default();
        config.governance.call_timeout_ms = 250;
        config.backends.insert("db".into(), unreachable_backend(&[]));
        let report = bridge.reload(&config).await.unwrap();

        assert_eq!(report.failed, vec!["db"]);
        assert!(report.policy_version > before);
        assert!(bridge.policies().snapshot().policy("db").is_some());
        assert_eq!(bridge.interceptor().call_timeout(), Duration::from_millis(250));
        bridge.shutdown().await;
    }
}
