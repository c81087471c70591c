use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    remote::{RemoteTier, SubscriptionStatus},
    store::{KeyValueStore, Keys},
};

/// Subscription level that selects the usage limit table.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub(crate) enum Tier {
    #[serde(rename = "free")]
    Free,
    #[serde(rename = "pro")]
    Paid,
}

impl Tier {
    pub(crate) fn is_paid(self) -> bool {
        matches!(self, Tier::Paid)
    }
}

impl From<RemoteTier> for Tier {
    fn from(tier: RemoteTier) -> Self {
        match tier {
            RemoteTier::Free => Tier::Free,
            RemoteTier::Pro => Tier::Paid,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Free => write!(f, "Free"),
            Tier::Paid => write!(f, "Pro"),
        }
    }
}

/// Best-known subscription state of a subject.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Entitlement {
    pub(crate) subject_id: String,
    pub(crate) tier: Tier,
    pub(crate) active: bool,
    pub(crate) renews_at: Option<DateTime<Utc>>,
    /// A paid tier has been confirmed by the backend and is locked in.
    pub(crate) verified: bool,
}

impl Entitlement {
    pub(crate) fn free(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_owned(),
            tier: Tier::Free,
            active: false,
            renews_at: None,
            verified: false,
        }
    }
}

impl std::fmt::Display for Entitlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Plan: {}", self.tier)?;
        if self.tier.is_paid() {
            write!(f, " ({})", if self.active { "active" } else { "inactive" })?;
        }
        if let Some(renews_at) = self.renews_at {
            write!(f, " | Renews {}", renews_at.format("%Y-%m-%d"))?;
        }
        if self.verified {
            write!(f, " | Verified")?;
        }
        Ok(())
    }
}

/// Persisted mirror of the last successful subscription check.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub(crate) struct CacheRecord {
    pub(crate) tier: Tier,
    pub(crate) subscribed: bool,
    pub(crate) subscription_end: Option<String>,
    pub(crate) cached_at: DateTime<Utc>,
}

impl CacheRecord {
    pub(crate) fn from_status(status: &SubscriptionStatus, cached_at: DateTime<Utc>) -> Self {
        Self {
            tier: status.subscription_tier.into(),
            subscribed: status.subscribed,
            subscription_end: status.subscription_end.clone(),
            cached_at,
        }
    }

    pub(crate) fn renews_at(&self) -> Option<DateTime<Utc>> {
        let end = self.subscription_end.as_deref()?;
        match DateTime::parse_from_rfc3339(end) {
            Ok(end) => Some(end.with_timezone(&Utc)),
            Err(err) => {
                warn!(subscription_end = end, ?err, "Ignoring unparsable renewal date");
                None
            }
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.cached_at <= max_age
    }

    fn entitlement(&self, subject_id: &str, verified: bool) -> Entitlement {
        Entitlement {
            subject_id: subject_id.to_owned(),
            tier: self.tier,
            active: self.subscribed,
            renews_at: self.renews_at(),
            verified,
        }
    }
}

/// Reads and writes the cache record and the paid lock for one subject.
#[derive(Debug)]
pub(crate) struct Persistence<'a> {
    pub(crate) store: &'a dyn KeyValueStore,
    pub(crate) keys: &'a Keys,
}

impl Persistence<'_> {
    /// Malformed or unreadable records are treated as absent.
    pub(crate) fn cache_record(&self) -> Option<CacheRecord> {
        let key = self.keys.entitlement_cache();

        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(%key, ?err, "Failed to read subscription cache");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%key, ?err, "Subscription cache is malformed, ignoring it");
                None
            }
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        [self.keys.paid_lock(), self.keys.legacy_verified()]
            .iter()
            .any(|key| match self.store.get(key) {
                Ok(value) => value.as_deref() == Some("true"),
                Err(err) => {
                    warn!(%key, ?err, "Failed to read paid lock");
                    false
                }
            })
    }

    pub(crate) fn write_cache_record(&self, record: &CacheRecord) -> anyhow::Result<()> {
        self.store
            .set(&self.keys.entitlement_cache(), &serde_json::to_string(record)?)
    }

    pub(crate) fn set_lock(&self) -> anyhow::Result<()> {
        self.store.set(&self.keys.paid_lock(), "true")
    }

    pub(crate) fn clear_lock(&self) -> anyhow::Result<()> {
        self.store.remove(&self.keys.paid_lock())?;
        self.store.remove(&self.keys.legacy_verified())
    }

    /// Initial state before any network round trip.
    ///
    /// A fresh record is used as is. A stale record only counts when it says
    /// paid. A set lock always yields the paid tier.
    pub(crate) fn seed(&self, now: DateTime<Utc>, max_age: Duration) -> (Entitlement, bool) {
        let subject_id = self.keys.subject_id();
        let locked = self.is_locked();
        let record = self.cache_record();

        let entitlement = match record {
            Some(record) if record.tier.is_paid() || record.is_fresh(now, max_age) => {
                let verified = locked && record.tier.is_paid();
                debug!(
                    tier = %record.tier,
                    fresh = record.is_fresh(now, max_age),
                    "Seeded from subscription cache"
                );
                record.entitlement(subject_id, verified)
            }
            _ => Entitlement::free(subject_id),
        };

        if locked && !entitlement.tier.is_paid() {
            debug!("Paid lock is set, seeding paid tier");
            return (
                Entitlement {
                    tier: Tier::Paid,
                    active: true,
                    verified: true,
                    ..entitlement
                },
                true,
            );
        }

        (entitlement, locked)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone as _;

    use super::*;
    use crate::store::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 10, 12, 0, 0).unwrap()
    }

    fn record(tier: Tier, age: Duration) -> CacheRecord {
        CacheRecord {
            tier,
            subscribed: tier.is_paid(),
            subscription_end: tier
                .is_paid()
                .then(|| "2024-05-10T12:00:00Z".to_owned()),
            cached_at: now() - age,
        }
    }

    #[test]
    fn cache_record_json_shape() {
        let json = serde_json::to_value(record(Tier::Paid, Duration::zero())).unwrap();
        assert_eq!(json["tier"], "pro");
        assert_eq!(json["subscribed"], true);
        assert_eq!(json["subscription_end"], "2024-05-10T12:00:00Z");
        assert!(json["cached_at"].is_string());
    }

    #[test]
    fn seeds_free_without_anything_persisted() {
        let store = MemoryStore::default();
        let keys = Keys::new("abc");
        let persistence = Persistence {
            store: &store,
            keys: &keys,
        };

        let (entitlement, locked) = persistence.seed(now(), Duration::minutes(10));
        assert_eq!(entitlement, Entitlement::free("abc"));
        assert!(!locked);
    }

    #[test]
    fn stale_free_record_is_ignored_but_stale_paid_wins() {
        let store = MemoryStore::default();
        let keys = Keys::new("abc");
        let persistence = Persistence {
            store: &store,
            keys: &keys,
        };

        let mut stale_free = record(Tier::Free, Duration::hours(3));
        stale_free.subscribed = true;
        persistence.write_cache_record(&stale_free).unwrap();
        let (entitlement, _) = persistence.seed(now(), Duration::minutes(10));
        assert_eq!(entitlement, Entitlement::free("abc"));

        persistence
            .write_cache_record(&record(Tier::Paid, Duration::days(3)))
            .unwrap();
        let (entitlement, locked) = persistence.seed(now(), Duration::minutes(10));
        assert_eq!(entitlement.tier, Tier::Paid);
        assert!(entitlement.renews_at.is_some());
        assert!(!entitlement.verified);
        assert!(!locked);
    }

    #[test]
    fn malformed_cache_keeps_lock() {
        let store = MemoryStore::default();
        let keys = Keys::new("abc");
        store.set(&keys.entitlement_cache(), "{\"tier\":").unwrap();
        store.set(&keys.paid_lock(), "true").unwrap();

        let persistence = Persistence {
            store: &store,
            keys: &keys,
        };
        assert!(persistence.cache_record().is_none());

        let (entitlement, locked) = persistence.seed(now(), Duration::minutes(10));
        assert!(locked);
        assert_eq!(entitlement.tier, Tier::Paid);
        assert!(entitlement.verified);
        assert_eq!(store.get(&keys.paid_lock()).unwrap().as_deref(), Some("true"));
    }

    #[test]
    fn legacy_verified_flag_counts_as_lock() {
        let store = MemoryStore::default();
        let keys = Keys::new("abc");
        store.set(&keys.legacy_verified(), "true").unwrap();

        let persistence = Persistence {
            store: &store,
            keys: &keys,
        };
        assert!(persistence.is_locked());

        persistence.clear_lock().unwrap();
        assert!(!persistence.is_locked());
    }
}
