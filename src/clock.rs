#[cfg(test)]
use std::sync::{Mutex, PoisonError};

#[cfg(test)]
use chrono::Duration;
use chrono::{DateTime, Datelike as _, NaiveDate, Utc};

/// Source of wall-clock time for cooldowns, TTLs and month boundaries.
pub(crate) trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default)]
pub(crate) struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub(crate) fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// First instant (UTC) of the calendar month containing `timestamp`.
pub(crate) fn month_start(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(timestamp.year(), timestamp.month(), 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map_or(timestamp, |start| start.and_utc())
}

/// Period marker in `YYYY-M` form, month not zero padded.
pub(crate) fn period_marker(timestamp: DateTime<Utc>) -> String {
    format!("{}-{}", timestamp.year(), timestamp.month())
}
