use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use bson::DateTime;

/// Source of "now" for anything that stamps or ages documents.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime {
        DateTime::now()
    }
}

/// A clock that only moves when told to. Used to age documents past a TTL
/// without waiting for it.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime) -> Self {
        Self {
            millis: AtomicI64::new(start.timestamp_millis()),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(duration_millis(by), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime) {
        self.millis.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime {
        DateTime::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// `at - d`, saturating at the BSON date range.
pub fn before(at: DateTime, d: Duration) -> DateTime {
    DateTime::from_millis(at.timestamp_millis().saturating_sub(duration_millis(d)))
}

/// `at + d`, saturating at the BSON date range.
pub fn after(at: DateTime, d: Duration) -> DateTime {
    DateTime::from_millis(at.timestamp_millis().saturating_add(duration_millis(d)))
}
