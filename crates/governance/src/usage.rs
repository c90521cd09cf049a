//! Usage tracking and asynchronous audit persistence.
//!
//! Recording is a fast local operation: counters are updated in sharded maps
//! and the audit record is pushed onto a bounded FIFO buffer. A single
//! background writer drains the buffer in batches, so records for one
//! invocation reach the store in the order they were recorded.
//!
//! When the buffer is full the oldest record is dropped; when a batch fails
//! every retry it is counted as lost. Both counters are visible in
//! [`UsageTracker::summary`] and as metrics.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use gov_bridge_core::config::GovernanceConfig;
use gov_bridge_core::{
    AuditRecord, AuditStore, DenialReason, ErrorKind, GovernanceDecision, Invocation, InvocationStatus,
    TrackingLevel,
};

use crate::metrics;
use crate::policy::PolicyStore;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Records held before the oldest are dropped.
    pub buffer_capacity: usize,
    /// Records handed to the store per append.
    pub batch_size: usize,
    pub retry_attempts: u32,
    /// Base delay between attempts; grows linearly with the attempt number.
    pub retry_backoff: Duration,
    /// Sessions idle this long are forgotten by the sweeper.
    pub session_idle: Duration,
    /// Result text kept in detailed audit records.
    pub max_result_chars: usize,
    /// Raw result payloads larger than this are not persisted.
    pub max_raw_bytes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            batch_size: 256,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(200),
            session_idle: Duration::from_secs(3600),
            max_result_chars: 1000,
            max_raw_bytes: 10_000,
        }
    }
}

impl From<&GovernanceConfig> for TrackerConfig {
    fn from(config: &GovernanceConfig) -> Self {
        Self {
            buffer_capacity: config.audit_buffer_capacity,
            retry_attempts: config.audit_retry_attempts,
            retry_backoff: Duration::from_millis(config.audit_retry_backoff_ms),
            session_idle: Duration::from_secs(config.session_idle_secs),
            ..Self::default()
        }
    }
}

// =============================================================================
// Aggregates
// =============================================================================

/// Counter key for calls naming a backend that has no policy.
pub const UNKNOWN_KEY: &str = "<unknown>";

/// Counter key for tools past [`MAX_TRACKED_TOOLS`] on one backend.
pub const OTHER_TOOLS_KEY: &str = "<other>";

/// Distinct tool names counted per backend.
pub const MAX_TRACKED_TOOLS: usize = 256;

/// Live counters for one backend.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendUsage {
    pub allowed: u64,
    pub denied: u64,
    pub success: u64,
    pub errors: u64,
    pub total_duration_ms: f64,
    pub avg_duration_ms: f64,
    /// Finished invocations per tool.
    pub tools: BTreeMap<String, u64>,
    pub denial_reasons: BTreeMap<String, u64>,
    pub error_kinds: BTreeMap<String, u64>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl BackendUsage {
    /// Calls evaluated (allowed + denied).
    pub fn calls(&self) -> u64 {
        self.allowed + self.denied
    }

    fn record_outcome(&mut self, invocation: &Invocation) {
        let tool = if invocation.error_kind() == Some(ErrorKind::UnknownTarget) {
            UNKNOWN_KEY
        } else if self.tools.len() >= MAX_TRACKED_TOOLS && !self.tools.contains_key(&invocation.tool_name) {
            OTHER_TOOLS_KEY
        } else {
            invocation.tool_name.as_str()
        };
        *self.tools.entry(tool.to_string()).or_default() += 1;
        match invocation.status {
            InvocationStatus::Success => self.success += 1,
            InvocationStatus::Error => {
                self.errors += 1;
                if let Some(kind) = invocation.error_kind() {
                    *self.error_kinds.entry(kind.as_str().to_string()).or_default() += 1;
                }
            }
            InvocationStatus::Denied | InvocationStatus::Pending => {}
        }
        if invocation.status != InvocationStatus::Denied {
            if let Some(ms) = invocation.duration_ms {
                self.total_duration_ms += ms;
                let executed = self.success + self.errors;
                self.avg_duration_ms = self.total_duration_ms / executed.max(1) as f64;
            }
        }
        self.last_activity = invocation.end_time.or(Some(invocation.start_time));
    }
}

/// Live counters for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUsage {
    pub session_id: String,
    pub allowed: u64,
    pub denied: u64,
    pub success: u64,
    pub errors: u64,
    pub backends: BTreeSet<String>,
    pub first_seen: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip)]
    touched: Instant,
}

impl SessionUsage {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            allowed: 0,
            denied: 0,
            success: 0,
            errors: 0,
            backends: BTreeSet::new(),
            first_seen: now,
            last_activity: now,
            touched: Instant::now(),
        }
    }

    fn touch(&mut self, backend_id: Option<&str>) {
        if let Some(backend_id) = backend_id.filter(|id| !self.backends.contains(*id)) {
            self.backends.insert(backend_id.to_string());
        }
        self.last_activity = Utc::now();
        self.touched = Instant::now();
    }
}

/// An invocation that has not finished yet.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveInvocation {
    pub invocation_id: String,
    pub session_id: String,
    pub backend_id: String,
    pub tool_name: String,
    pub start_time: DateTime<Utc>,
    pub elapsed_ms: i64,
}

/// Audit pipeline counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AuditStats {
    pub buffered: usize,
    pub persisted: u64,
    pub dropped: u64,
    pub lost: u64,
}

/// Dashboard view of the tracker.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub backends: BTreeMap<String, BackendUsage>,
    pub sessions: usize,
    pub active_invocations: usize,
    pub audit: AuditStats,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Tracker
// =============================================================================

struct TrackerInner {
    config: TrackerConfig,
    store: Arc<dyn AuditStore>,
    policies: Option<Arc<PolicyStore>>,

    backends: DashMap<String, BackendUsage>,
    sessions: DashMap<String, SessionUsage>,
    active: DashMap<String, Invocation>,

    buffer: Mutex<VecDeque<AuditRecord>>,
    /// Records taken by the writer and not yet resolved.
    in_flight: AtomicUsize,
    wake: Notify,
    closed: AtomicBool,

    persisted: AtomicU64,
    dropped: AtomicU64,
    lost: AtomicU64,
}

impl TrackerInner {
    fn new(store: Arc<dyn AuditStore>, config: TrackerConfig, policies: Option<Arc<PolicyStore>>) -> Self {
        Self {
            config,
            store,
            policies,
            backends: DashMap::new(),
            sessions: DashMap::new(),
            active: DashMap::new(),
            buffer: Mutex::new(VecDeque::new()),
            in_flight: AtomicUsize::new(0),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            persisted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            lost: AtomicU64::new(0),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, VecDeque<AuditRecord>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, record: AuditRecord) {
        let capacity = self.config.buffer_capacity.max(1);
        let evicted = {
            let mut buffer = self.buffer();
            let evicted = if buffer.len() >= capacity {
                buffer.pop_front()
            } else {
                None
            };
            buffer.push_back(record);
            evicted
        };

        if let Some(old) = evicted {
            let before = self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::track_audit_dropped(1);
            if before == 0 {
                tracing::warn!(capacity, "Audit buffer full, dropping oldest records");
            }
            tracing::debug!(backend = old.backend_id(), kind = old.kind().as_str(), "Audit record dropped");
        }
        self.wake.notify_one();
    }

    /// Move up to one batch out of the buffer, marking it in flight.
    fn take_batch(&self) -> Vec<AuditRecord> {
        let mut buffer = self.buffer();
        let n = buffer.len().min(self.config.batch_size.max(1));
        let batch: Vec<AuditRecord> = buffer.drain(..n).collect();
        self.in_flight.store(batch.len(), Ordering::SeqCst);
        batch
    }

    fn is_drained(&self) -> bool {
        let buffer = self.buffer();
        buffer.is_empty() && self.in_flight.load(Ordering::SeqCst) == 0
    }

    async fn persist(&self, batch: Vec<AuditRecord>) {
        let n = batch.len() as u64;
        let attempts = self.config.retry_attempts.max(1);

        for attempt in 1..=attempts {
            match self.store.append(&batch).await {
                Ok(()) => {
                    self.persisted.fetch_add(n, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt < attempts => {
                    tracing::warn!(attempt, records = n, error = %e, "Audit write failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
                Err(e) => {
                    tracing::error!(attempts, records = n, error = %e, "Audit batch lost");
                    self.lost.fetch_add(n, Ordering::Relaxed);
                    metrics::track_audit_lost(n);
                }
            }
        }
    }

    /// Key for an invocation's backend counters. A call rejected as an
    /// unknown target whose backend was never counted shares one bucket.
    fn invocation_key<'a>(&self, invocation: &'a Invocation) -> &'a str {
        if invocation.error_kind() == Some(ErrorKind::UnknownTarget)
            && !self.backends.contains_key(&invocation.backend_id)
        {
            UNKNOWN_KEY
        } else {
            &invocation.backend_id
        }
    }

    fn tracking_level(&self, backend_id: &str) -> TrackingLevel {
        self.policies
            .as_ref()
            .and_then(|p| p.snapshot().policy(backend_id).map(|c| c.policy.tracking_level))
            .unwrap_or_default()
    }

    /// The persisted form of an invocation at the backend's tracking level.
    fn audit_copy(&self, invocation: &Invocation) -> Invocation {
        let mut record = invocation.clone();
        match self.tracking_level(&invocation.backend_id) {
            TrackingLevel::Basic => {
                record.arguments = Value::Null;
                record.result = None;
            }
            TrackingLevel::Detailed => {
                if let Some(output) = record.result.as_mut() {
                    if output.text.chars().count() > self.config.max_result_chars {
                        let mut text: String =
                            output.text.chars().take(self.config.max_result_chars).collect();
                        text.push_str("...[truncated]");
                        output.text = text;
                    }
                    let raw_too_big = output.raw.as_ref().map_or(false, |raw| {
                        serde_json::to_vec(raw).map_or(true, |b| b.len() > self.config.max_raw_bytes)
                    });
                    if raw_too_big {
                        output.raw = None;
                    }
                }
            }
        }
        record
    }

    fn expire_idle_sessions(&self) -> usize {
        let idle = self.config.session_idle;
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.touched.elapsed() < idle);
        before.saturating_sub(self.sessions.len())
    }
}

async fn run_writer(inner: Arc<TrackerInner>) {
    loop {
        let batch = inner.take_batch();
        if batch.is_empty() {
            if inner.closed.load(Ordering::SeqCst) {
                break;
            }
            inner.wake.notified().await;
            continue;
        }
        inner.persist(batch).await;
        inner.in_flight.store(0, Ordering::SeqCst);
    }
    tracing::debug!("Audit writer stopped");
}

/// Builder for [`UsageTracker`].
pub struct UsageTrackerBuilder {
    store: Arc<dyn AuditStore>,
    config: TrackerConfig,
    policies: Option<Arc<PolicyStore>>,
}

impl UsageTrackerBuilder {
    pub fn config(mut self, config: TrackerConfig) -> Self {
        self.config = config;
        self
    }

    /// Policy source for per-backend tracking levels. Without one every
    /// backend is tracked in detail.
    pub fn policies(mut self, policies: Arc<PolicyStore>) -> Self {
        self.policies = Some(policies);
        self
    }

    /// Start the tracker. Must be called inside a tokio runtime.
    pub fn build(self) -> UsageTracker {
        let inner = Arc::new(TrackerInner::new(self.store, self.config, self.policies));
        let writer = tokio::spawn(run_writer(inner.clone()));
        UsageTracker {
            inner,
            writer: Mutex::new(Some(writer)),
        }
    }
}

/// Per-backend and per-session usage with buffered audit persistence.
pub struct UsageTracker {
    inner: Arc<TrackerInner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl UsageTracker {
    pub fn builder(store: Arc<dyn AuditStore>) -> UsageTrackerBuilder {
        UsageTrackerBuilder {
            store,
            config: TrackerConfig::default(),
            policies: None,
        }
    }

    /// Tracker with default settings. Must be called inside a tokio runtime.
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self::builder(store).build()
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.inner.store
    }

    /// Count a decision and queue it for the audit log.
    pub fn record_decision(&self, decision: GovernanceDecision) {
        let inner = &self.inner;
        // a backend without a policy never earns its own counters
        let unknown_backend = decision.policy_snapshot.is_none()
            && matches!(decision.reason, Some(DenialReason::UnknownTarget));
        let key = if unknown_backend {
            UNKNOWN_KEY.to_string()
        } else {
            decision.backend_id.clone()
        };
        {
            let mut usage = inner.backends.entry(key.clone()).or_default();
            if decision.is_allowed() {
                usage.allowed += 1;
            } else {
                usage.denied += 1;
                if let Some(reason) = decision.reason {
                    *usage.denial_reasons.entry(reason.kind().as_str().to_string()).or_default() += 1;
                }
            }
            usage.last_activity = Some(decision.timestamp);
        }

        if let Some(session_id) = decision.session_id.as_deref() {
            let mut session = inner
                .sessions
                .entry(session_id.to_string())
                .or_insert_with(|| SessionUsage::new(session_id));
            if decision.is_allowed() {
                session.allowed += 1;
            } else {
                session.denied += 1;
            }
            session.touch(Some(&key));
        }

        metrics::track_decision(&key, &decision);
        inner.enqueue(AuditRecord::Decision(decision));
    }

    /// Track an invocation. Pending invocations are held in the active view
    /// only; terminal ones update counters and are queued for the audit log.
    pub fn record_invocation(&self, invocation: Invocation) {
        let inner = &self.inner;

        if !invocation.status.is_terminal() {
            // the backend is counted once governance has judged the call
            inner
                .sessions
                .entry(invocation.session_id.clone())
                .or_insert_with(|| SessionUsage::new(&invocation.session_id))
                .touch(None);
            inner.active.insert(invocation.invocation_id.clone(), invocation);
            return;
        }
        inner.active.remove(&invocation.invocation_id);

        let key = inner.invocation_key(&invocation).to_string();
        inner
            .sessions
            .entry(invocation.session_id.clone())
            .or_insert_with(|| SessionUsage::new(&invocation.session_id))
            .touch(Some(&key));
        inner
            .backends
            .entry(key.clone())
            .or_default()
            .record_outcome(&invocation);

        if let Some(mut session) = inner.sessions.get_mut(&invocation.session_id) {
            match invocation.status {
                InvocationStatus::Success => session.success += 1,
                InvocationStatus::Error => session.errors += 1,
                _ => {}
            }
        }

        metrics::track_invocation(&key, &invocation);
        let record = inner.audit_copy(&invocation);
        inner.enqueue(AuditRecord::Invocation(record));
    }

    pub fn backend_usage(&self, backend_id: &str) -> Option<BackendUsage> {
        self.inner.backends.get(backend_id).map(|u| u.clone())
    }

    pub fn session_usage(&self, session_id: &str) -> Option<SessionUsage> {
        self.inner.sessions.get(session_id).map(|s| s.clone())
    }

    /// In-flight invocations, oldest first.
    pub fn active_invocations(&self) -> Vec<ActiveInvocation> {
        let now = Utc::now();
        let mut active: Vec<ActiveInvocation> = self
            .inner
            .active
            .iter()
            .map(|inv| ActiveInvocation {
                invocation_id: inv.invocation_id.clone(),
                session_id: inv.session_id.clone(),
                backend_id: inv.backend_id.clone(),
                tool_name: inv.tool_name.clone(),
                start_time: inv.start_time,
                elapsed_ms: (now - inv.start_time).num_milliseconds(),
            })
            .collect();
        active.sort_by_key(|a| a.start_time);
        active
    }

    pub fn audit_stats(&self) -> AuditStats {
        let inner = &self.inner;
        AuditStats {
            buffered: inner.buffer().len(),
            persisted: inner.persisted.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            lost: inner.lost.load(Ordering::Relaxed),
        }
    }

    pub fn summary(&self) -> UsageSummary {
        let backends = self
            .inner
            .backends
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        UsageSummary {
            backends,
            sessions: self.inner.sessions.len(),
            active_invocations: self.inner.active.len(),
            audit: self.audit_stats(),
            timestamp: Utc::now(),
        }
    }

    /// Forget sessions idle longer than the configured period.
    pub fn expire_idle_sessions(&self) -> usize {
        let removed = self.inner.expire_idle_sessions();
        if removed > 0 {
            tracing::debug!(removed, "Expired idle sessions");
        }
        removed
    }

    /// Run [`expire_idle_sessions`](Self::expire_idle_sessions) every `period`
    /// until the tracker is dropped.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                let removed = inner.expire_idle_sessions();
                if removed > 0 {
                    tracing::debug!(removed, "Expired idle sessions");
                }
            }
        })
    }

    /// Wait until every queued record has been written or given up on.
    pub async fn flush(&self) {
        self.inner.wake.notify_one();
        while !self.inner.is_drained() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Flush, then stop the background writer.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();

        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::error!(error = %e, "Audit writer task failed");
            }
        }
        let stats = self.audit_stats();
        tracing::info!(
            persisted = stats.persisted,
            dropped = stats.dropped,
            lost = stats.lost,
            "Usage tracker stopped"
        );
    }
}

impl Drop for UsageTracker {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
    }
}
