//! Time source and billing-period resolution.
//!
//! Usage limits reset at the start of every calendar month (UTC). The period is
//! derived from the clock on every query and never persisted.

use std::sync::RwLock;

use chrono::{DateTime, Datelike, Days, Months, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Source of the current instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to pin month boundaries in tests
/// and for replaying historical decisions.
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.write().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// The half-open window `[start, end)` over which usage is aggregated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl UsagePeriod {
    /// The calendar month containing `now`, truncated at `now`.
    pub fn current(now: DateTime<Utc>) -> Self {
        Self {
            start: month_start(now),
            end: now,
        }
    }

    pub fn resolve(clock: &dyn Clock) -> Self {
        Self::current(clock.now())
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// First instant of the next period.
    ///
    /// Ledger reads bound their scans by this rather than `end`, so an event
    /// stamped at exactly `now` is already counted by a read at the same
    /// instant.
    pub fn reset_at(&self) -> DateTime<Utc> {
        self.start
            .date_naive()
            .checked_add_months(Months::new(1))
            .map(|d| Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let date = now.date_naive();
    let first = date - Days::new(u64::from(date.day0()));
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}
