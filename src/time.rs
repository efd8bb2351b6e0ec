use chrono::{DateTime, FixedOffset, TimeDelta, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::time::Duration;

/// An instant on a [`Clock`]. Keeps nanosecond precision and the clock's own
/// UTC offset.
pub type Timestamp = DateTime<FixedOffset>;

/// One-shot notification returned by [`Clock::after`]. Dropping it cancels it.
pub type Alarm = BoxFuture<'static, ()>;

/// Source of time for everything that schedules on lease expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;

    /// Resolves once, no earlier than `now() + duration` as measured by this
    /// clock.
    fn after(&self, duration: Duration) -> Alarm;
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now().fixed_offset()
    }

    fn after(&self, duration: Duration) -> Alarm {
        tokio::time::sleep(duration).boxed()
    }
}

/// `at + duration`, saturating at the end of representable time.
pub fn add(at: Timestamp, duration: Duration) -> Timestamp {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or_else(|| DateTime::<Utc>::MAX_UTC.with_timezone(at.offset()))
}

/// Time left from `now` until `deadline`; zero once it has passed.
pub fn until(now: Timestamp, deadline: Timestamp) -> Duration {
    deadline
        .signed_duration_since(now)
        .to_std()
        .unwrap_or(Duration::ZERO)
}
