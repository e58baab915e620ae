//! Wall-clock source for timelock deadlines

use chrono::{DateTime, Utc};

/// Source of the current time. Deadlines are compared against this rather
/// than `Utc::now()` directly so tests can move time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
