//! Interception middleware: the single entry point for governed tool calls.
//!
//! The interceptor is the only component that moves an [`Invocation`] through
//! its states. Every call yields exactly one decision, and every invocation
//! that was recorded as pending reaches a terminal state, even when the
//! caller goes away mid-call.

use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gov_bridge_core::{CallError, ErrorKind, Invocation, ToolOutput};
use gov_bridge_governance::{GovernanceEngine, UsageTracker};
use gov_bridge_router::BackendRouter;

/// Longest client-supplied session id that is kept as is.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// A completed call.
#[derive(Debug, Clone, Serialize)]
pub struct CallResult {
    pub session_id: String,
    pub invocation_id: String,
    pub output: ToolOutput,
}

/// A denied or failed call.
#[derive(Debug, Clone, Serialize)]
pub struct CallFailure {
    pub session_id: String,
    pub invocation_id: String,
    pub error: CallError,
}

impl CallFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (invocation {})", self.error, self.invocation_id)
    }
}

impl std::error::Error for CallFailure {}

/// Keep a usable client session id or mint a new one.
pub fn resolve_session_id(session_id: Option<&str>) -> String {
    match session_id.map(str::trim) {
        Some(id) if !id.is_empty() && id.len() <= MAX_SESSION_ID_LEN => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

/// A pending invocation that must be finished exactly once.
///
/// Dropping it unfinished (the caller's future was cancelled) records the
/// invocation as a `timeout` error so nothing is left pending.
struct InFlight<'a> {
    tracker: &'a UsageTracker,
    invocation: Invocation,
    finished: bool,
}

impl<'a> InFlight<'a> {
    fn start(tracker: &'a UsageTracker, invocation: Invocation) -> Self {
        tracker.record_invocation(invocation.clone());
        Self {
            tracker,
            invocation,
            finished: false,
        }
    }

    fn finish(mut self, transition: impl FnOnce(Invocation) -> Invocation) -> Invocation {
        self.finished = true;
        let finished = transition(self.invocation.clone());
        self.tracker.record_invocation(finished.clone());
        finished
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let invocation = &self.invocation;
        tracing::warn!(
            invocation_id = %invocation.invocation_id,
            backend = %invocation.backend_id,
            tool = %invocation.tool_name,
            "Call abandoned by caller"
        );
        self.tracker.record_invocation(
            invocation
                .clone()
                .fail(CallError::new(ErrorKind::Timeout, "call cancelled before completion")),
        );
    }
}

/// Governs, forwards, and records tool calls.
pub struct Interceptor {
    engine: Arc<GovernanceEngine>,
    router: Arc<BackendRouter>,
    tracker: Arc<UsageTracker>,
    call_timeout_ms: AtomicU64,
}

impl Interceptor {
    pub fn new(
        engine: Arc<GovernanceEngine>,
        router: Arc<BackendRouter>,
        tracker: Arc<UsageTracker>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            router,
            tracker,
            call_timeout_ms: AtomicU64::new(call_timeout.as_millis() as u64),
        }
    }

    pub fn engine(&self) -> &Arc<GovernanceEngine> {
        &self.engine
    }

    pub fn router(&self) -> &Arc<BackendRouter> {
        &self.router
    }

    pub fn tracker(&self) -> &Arc<UsageTracker> {
        &self.tracker
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_call_timeout(&self, timeout: Duration) {
        self.call_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    /// Run one tool call through governance and, if allowed, the backend.
    pub async fn handle(
        &self,
        session_id: Option<&str>,
        backend_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<CallResult, CallFailure> {
        let session_id = resolve_session_id(session_id);
        let pending = Invocation::pending(&session_id, backend_id, tool_name, arguments);
        let invocation_id = pending.invocation_id.clone();
        let arguments = pending.arguments.clone();
        // visible as active while governance runs
        let in_flight = InFlight::start(&self.tracker, pending);

        let decision = self
            .engine
            .evaluate(backend_id, tool_name, &arguments)
            .attach(&invocation_id, &session_id);
        let denial = decision.reason.filter(|_| !decision.is_allowed());
        // queued before the invocation's terminal record
        self.tracker.record_decision(decision);

        if let Some(reason) = denial {
            let denied = in_flight.finish(|inv| inv.deny(reason));
            return Err(self.failure(&denied));
        }

        let dispatched = self
            .router
            .dispatch(backend_id, tool_name, arguments, self.call_timeout())
            .await;

        let finished = match dispatched {
            Ok(output) if output.is_error => {
                let message = if output.text.is_empty() {
                    format!("tool '{}' reported an error", tool_name)
                } else {
                    output.text.clone()
                };
                in_flight.finish(|inv| inv.fail(CallError::new(ErrorKind::BackendError, message)))
            }
            Ok(output) => in_flight.finish(|inv| inv.succeed(output)),
            Err(e) => in_flight.finish(|inv| inv.fail(CallError::from(&e))),
        };

        tracing::debug!(
            invocation_id = %finished.invocation_id,
            backend = backend_id,
            tool = tool_name,
            status = finished.status.as_str(),
            duration_ms = finished.duration_ms.unwrap_or_default(),
            "Call finished"
        );

        match finished.result {
            Some(output) => Ok(CallResult {
                session_id,
                invocation_id,
                output,
            }),
            None => Err(self.failure(&finished)),
        }
    }

    fn failure(&self, invocation: &Invocation) -> CallFailure {
        CallFailure {
            session_id: invocation.session_id.clone(),
            invocation_id: invocation.invocation_id.clone(),
            error: invocation
                .error
                .clone()
                .unwrap_or_else(|| CallError::new(ErrorKind::Internal, "call ended without a result")),
        }
    }
}
