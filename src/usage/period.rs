use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::{
    clock::{Clock, period_marker},
    store::{KeyValueStore, Keys},
};

/// Detects calendar-month rollover for one subject and drops the local
/// entries that only make sense within a month.
#[derive(Debug)]
pub(crate) struct MonthlyResetter {
    keys: Keys,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
}

impl MonthlyResetter {
    pub(crate) fn new(
        subject_id: &str,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            keys: Keys::new(subject_id),
            store,
            clock,
        }
    }

    /// Returns true when a new month was entered and the reset was applied.
    ///
    /// Idempotent within a month: once the marker matches, nothing is written.
    #[instrument(skip(self), fields(subject_id = self.keys.subject_id()))]
    pub(crate) fn check(&self) -> anyhow::Result<bool> {
        let current = period_marker(self.clock.now());
        let marker_key = self.keys.period_marker();
        let stored = self.store.get(&marker_key)?;

        if stored.as_deref() == Some(current.as_str()) {
            debug!(period = %current, "Usage period unchanged");
            return Ok(false);
        }

        // Marker last, so a failed clear is retried on the next check
        self.store.remove(&self.keys.usage_cache())?;

        if let Some(previous) = &stored {
            self.store.remove(&self.keys.downloads(previous))?;
        }

        self.store.set(&marker_key, &current)?;

        info!(
            previous = stored.as_deref().unwrap_or("none"),
            %current, "Entered new usage period, cleared monthly usage cache"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone as _, Utc};

    use super::*;
    use crate::{clock::ManualClock, store::MemoryStore};

    #[test]
    fn rollover_updates_marker_and_clears_usage_once() {
        let store = Arc::new(MemoryStore::default());
        let keys = Keys::new("user-1");
        store.set(&keys.period_marker(), "2024-3").unwrap();
        store.set(&keys.usage_cache(), "{}").unwrap();
        store.set(&keys.downloads("2024-3"), "4").unwrap();

        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap(),
        ));
        let resetter = MonthlyResetter::new("user-1", store.clone(), clock.clone());
        let writes_before = store.writes();

        assert!(resetter.check().unwrap());
        assert_eq!(
            store.get(&keys.period_marker()).unwrap().as_deref(),
            Some("2024-4")
        );
        assert_eq!(store.get(&keys.usage_cache()).unwrap(), None);
        assert_eq!(store.get(&keys.downloads("2024-3")).unwrap(), None);
        let writes_after_reset = store.writes();
        assert_eq!(writes_after_reset - writes_before, 3);

        store.set(&keys.usage_cache(), "{}").unwrap();
        clock.advance(chrono::Duration::days(20));

        assert!(!resetter.check().unwrap());
        assert_eq!(
            store.get(&keys.usage_cache()).unwrap().as_deref(),
            Some("{}")
        );
        assert_eq!(store.writes(), writes_after_reset + 1);
    }

    #[test]
    fn first_check_records_marker() {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 0).unwrap(),
        ));
        let resetter = MonthlyResetter::new("user-1", store.clone(), clock.clone());

        assert!(resetter.check().unwrap());
        assert_eq!(
            store
                .get(&Keys::new("user-1").period_marker())
                .unwrap()
                .as_deref(),
            Some("2024-12")
        );

        clock.advance(chrono::Duration::minutes(2));
        assert!(resetter.check().unwrap());
        assert_eq!(
            store
                .get(&Keys::new("user-1").period_marker())
                .unwrap()
                .as_deref(),
            Some("2025-1")
        );
    }
}
