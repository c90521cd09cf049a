//! Per-backend fixed-window rate limiting.
//!
//! Each backend gets a counter for the current wall-clock minute. The counter
//! resets when the minute changes; there is no carry-over between windows.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

use gov_bridge_core::{Clock, SystemClock};

/// Calls admitted for one backend in one minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateWindow {
    /// Minute index since the Unix epoch.
    pub window_start: i64,
    pub count: u32,
}

impl RateWindow {
    fn open(minute: i64) -> Self {
        Self {
            window_start: minute,
            count: 0,
        }
    }
}

/// Proof that a slot was taken. Hand it back to [`RateLimiter::refund`] if
/// the call is denied by a later check.
#[derive(Debug)]
#[must_use = "an unused permit cannot be refunded"]
pub struct RatePermit {
    backend_id: String,
    window_start: i64,
}

/// Fixed one-minute window limiter keyed by backend id.
pub struct RateLimiter {
    windows: DashMap<String, RateWindow>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Take a slot if fewer than `limit` calls were admitted this minute.
    ///
    /// Check and increment happen under the backend's entry lock, so
    /// concurrent callers never overshoot the limit.
    pub fn acquire(&self, backend_id: &str, limit: u32) -> Option<RatePermit> {
        if limit == 0 {
            return None;
        }
        let minute = self.clock.minute();

        let mut window = match self.windows.get_mut(backend_id) {
            Some(window) => window,
            None => self
                .windows
                .entry(backend_id.to_string())
                .or_insert_with(|| RateWindow::open(minute)),
        };

        if window.window_start != minute {
            *window = RateWindow::open(minute);
        }
        if window.count >= limit {
            return None;
        }
        window.count += 1;

        Some(RatePermit {
            backend_id: backend_id.to_string(),
            window_start: minute,
        })
    }

    /// Boolean form of [`acquire`](Self::acquire). The slot is kept.
    pub fn try_acquire(&self, backend_id: &str, limit: u32) -> bool {
        self.acquire(backend_id, limit).is_some()
    }

    /// Return a slot. Ignored when its window has already rolled over.
    pub fn refund(&self, permit: RatePermit) {
        if let Some(mut window) = self.windows.get_mut(&permit.backend_id) {
            if window.window_start == permit.window_start {
                window.count = window.count.saturating_sub(1);
            }
        }
    }

    /// The backend's window as of now (a stale window reads as empty).
    pub fn window(&self, backend_id: &str) -> Option<RateWindow> {
        let minute = self.clock.minute();
        self.windows.get(backend_id).map(|w| {
            if w.window_start == minute {
                *w
            } else {
                RateWindow::open(minute)
            }
        })
    }

    /// Number of backends with a window.
    pub fn active_windows(&self) -> usize {
        self.windows.len()
    }

    /// Calls admitted across all backends in the current minute.
    pub fn calls_this_minute(&self) -> u64 {
        let minute = self.clock.minute();
        self.windows
            .iter()
            .filter(|w| w.window_start == minute)
            .map(|w| w.count as u64)
            .sum()
    }

    pub fn remove(&self, backend_id: &str) {
        self.windows.remove(backend_id);
    }

    pub fn clear(&self) {
        self.windows.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
