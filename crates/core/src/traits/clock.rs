//! Clock abstraction.

use chrono::{DateTime, Local, Timelike, Utc};

/// Wall-clock source.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Current hour (0-23) in the deployment's local time zone.
    fn local_hour(&self) -> u32 {
        self.now().with_timezone(&Local).hour()
    }

    /// Wall-clock minute index since the Unix epoch.
    fn minute(&self) -> i64 {
        self.now().timestamp().div_euclid(60)
    }
}

/// System clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
