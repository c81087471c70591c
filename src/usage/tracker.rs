use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{sync::watch, time::timeout};
use tracing::{debug, info, instrument, warn};

use super::limits::{UsageCounts, UsageKind, allows, limits_for_tier};
use crate::{
    clock::{Clock, month_start, period_marker},
    entitlement::{Entitlement, Tier},
    notifier::{Notice, Notifier},
    resource_store::{Collection, ResourceStore},
    store::{KeyValueStore, Keys},
};

/// Tunables for [`UsageTracker`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct UsageSettings {
    /// How long a computed snapshot is served without re-counting.
    pub(crate) ttl: chrono::Duration,
    pub(crate) query_timeout: Duration,
}

impl Default for UsageSettings {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::minutes(5),
            query_timeout: Duration::from_secs(8),
        }
    }
}

/// Consumption for the current calendar month and the limits it is held to.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct UsageSnapshot {
    pub(crate) subject_id: String,
    pub(crate) period_start: DateTime<Utc>,
    pub(crate) tier: Tier,
    pub(crate) counters: UsageCounts,
    pub(crate) limits: UsageCounts,
}

impl UsageSnapshot {
    fn new(
        subject_id: &str,
        period_start: DateTime<Utc>,
        tier: Tier,
        counters: UsageCounts,
    ) -> Self {
        Self {
            subject_id: subject_id.to_owned(),
            period_start,
            tier,
            counters,
            limits: limits_for_tier(tier),
        }
    }

    pub(crate) fn allows(&self, kind: UsageKind) -> bool {
        allows(self.tier, kind, self.counters.get(kind))
    }

    fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self.limits = limits_for_tier(tier);
        self
    }
}

impl std::fmt::Display for UsageSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |kind: UsageKind| {
            if self.tier.is_paid() && kind != UsageKind::Responses {
                format!("{}", self.counters.get(kind))
            } else {
                format!("{}/{}", self.counters.get(kind), self.limits.get(kind))
            }
        };

        write!(
            f,
            "Plan: {} | Surveys: {} | Responses: {} | Downloads: {} since {}",
            self.tier,
            show(UsageKind::Surveys),
            show(UsageKind::Responses),
            show(UsageKind::Downloads),
            self.period_start.format("%Y-%m-%d"),
        )
    }
}

/// Persisted form of a computed snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct UsageCacheRecord {
    snapshot: UsageSnapshot,
    cached_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct Computed {
    snapshot: UsageSnapshot,
    cached_at: DateTime<Utc>,
    /// Counting failed and the counters are zeroed; never served from cache.
    fallback: bool,
}

/// Derives monthly consumption from the resource store and gates actions on
/// the limits of the current plan.
///
/// Snapshots are cached in memory and in the local store for a short TTL.
/// Concurrent recomputes collapse into one round trip.
pub(crate) struct UsageTracker {
    keys: Keys,
    store: Arc<dyn KeyValueStore>,
    resources: Arc<dyn ResourceStore>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    entitlement: watch::Receiver<Entitlement>,
    settings: UsageSettings,
    latest: Mutex<Option<Computed>>,
    recompute_gate: tokio::sync::Mutex<()>,
    recomputes: AtomicU64,
}

impl std::fmt::Debug for UsageTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageTracker")
            .field("subject_id", &self.keys.subject_id())
            .field("settings", &self.settings)
            .field("recomputes", &self.recomputes)
            .finish_non_exhaustive()
    }
}

impl UsageTracker {
    pub(crate) fn new(
        subject_id: &str,
        store: Arc<dyn KeyValueStore>,
        resources: Arc<dyn ResourceStore>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        entitlement: watch::Receiver<Entitlement>,
        settings: UsageSettings,
    ) -> Self {
        Self {
            keys: Keys::new(subject_id),
            store,
            resources,
            clock,
            notifier,
            entitlement,
            settings,
            latest: Mutex::new(None),
            recompute_gate: tokio::sync::Mutex::new(()),
            recomputes: AtomicU64::new(0),
        }
    }

    fn latest(&self) -> MutexGuard<'_, Option<Computed>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tier(&self) -> Tier {
        self.entitlement.borrow().tier
    }

    /// Cached snapshot for the current month younger than the TTL, if any.
    fn fresh_snapshot(&self, now: DateTime<Utc>) -> Option<UsageSnapshot> {
        let is_fresh = |computed: &Computed| {
            !computed.fallback
                && computed.snapshot.period_start == month_start(now)
                && now - computed.cached_at < self.settings.ttl
        };

        let mut latest = self.latest();

        if let Some(computed) = latest.as_ref()
            && is_fresh(computed)
        {
            return Some(computed.snapshot.clone().with_tier(self.tier()));
        }

        let mut record = self.read_cache_record()?;
        record.snapshot.counters.downloads = self.downloads(&period_marker(now));

        let computed = Computed {
            snapshot: record.snapshot,
            cached_at: record.cached_at,
            fallback: false,
        };

        if computed.snapshot.subject_id != self.keys.subject_id() || !is_fresh(&computed) {
            return None;
        }

        debug!("Loaded usage snapshot from local store");
        let snapshot = computed.snapshot.clone().with_tier(self.tier());
        *latest = Some(computed);
        Some(snapshot)
    }

    fn read_cache_record(&self) -> Option<UsageCacheRecord> {
        let key = self.keys.usage_cache();

        let raw = match self.store.get(&key) {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(%key, ?err, "Failed to read usage cache");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(%key, ?err, "Usage cache is malformed, ignoring it");
                None
            }
        }
    }

    fn write_cache_record(&self, computed: &Computed) {
        let record = UsageCacheRecord {
            snapshot: computed.snapshot.clone(),
            cached_at: computed.cached_at,
        };

        let result = serde_json::to_string(&record)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(&self.keys.usage_cache(), &json));

        if let Err(err) = result {
            warn!(?err, "Failed to persist usage cache");
        }
    }

    fn downloads(&self, period: &str) -> u64 {
        let key = self.keys.downloads(period);
        match self.store.get(&key) {
            Ok(Some(value)) => value.parse().unwrap_or_else(|err| {
                warn!(%key, %value, ?err, "Ignoring malformed download counter");
                0
            }),
            Ok(None) => 0,
            Err(err) => {
                warn!(%key, ?err, "Failed to read download counter");
                0
            }
        }
    }

    /// Current snapshot, re-counted only when the cached one has expired.
    pub(crate) async fn usage(&self) -> UsageSnapshot {
        if let Some(snapshot) = self.fresh_snapshot(self.clock.now()) {
            return snapshot;
        }
        self.recompute(false).await
    }

    /// Counts this month's surveys and responses.
    ///
    /// Callers that arrive while a recompute is running wait for it and share
    /// its result. When counting fails or times out, zeroed counters with the
    /// plan's limits are returned; `force_refresh` marks an explicit request,
    /// which is the only case reported to the user.
    #[instrument(skip(self), fields(subject_id = self.keys.subject_id()))]
    pub(crate) async fn recompute(&self, force_refresh: bool) -> UsageSnapshot {
        let observed = self.recomputes.load(Ordering::Acquire);
        let _gate = self.recompute_gate.lock().await;

        if self.recomputes.load(Ordering::Acquire) != observed
            && let Some(computed) = self.latest().as_ref()
        {
            debug!("Joined a recompute that finished while waiting");
            return computed.snapshot.clone().with_tier(self.tier());
        }

        let now = self.clock.now();
        let period_start = month_start(now);
        let subject_id = self.keys.subject_id();

        let counted = timeout(self.settings.query_timeout, async {
            tokio::try_join!(
                self.resources
                    .count(Collection::Surveys, subject_id, period_start),
                self.resources
                    .count(Collection::Testimonials, subject_id, period_start),
            )
        })
        .await;

        let downloads = self.downloads(&period_marker(now));
        let tier = self.tier();

        let mut computed = match counted {
            Ok(Ok((surveys_created, responses_collected))) => {
                let counters = UsageCounts {
                    surveys_created,
                    responses_collected,
                    downloads,
                };
                info!(
                    surveys_created,
                    responses_collected, downloads, %tier, "Usage recomputed"
                );
                let computed = Computed {
                    snapshot: UsageSnapshot::new(subject_id, period_start, tier, counters),
                    cached_at: now,
                    fallback: false,
                };
                self.write_cache_record(&computed);
                computed
            }
            failed => {
                let reason = match failed {
                    Ok(Err(err)) => format!("{err:#}"),
                    _ => format!("counting timed out after {:?}", self.settings.query_timeout),
                };
                warn!(%reason, "Failed to count usage, falling back to zeroed counters");

                if force_refresh {
                    self.notifier.notify(Notice::UsageRefreshFailed(reason));
                }

                let counters = UsageCounts {
                    downloads,
                    ..UsageCounts::default()
                };
                Computed {
                    snapshot: UsageSnapshot::new(subject_id, period_start, tier, counters),
                    cached_at: now,
                    fallback: true,
                }
            }
        };

        let snapshot = {
            let mut latest = self.latest();
            // Downloads recorded since the counter was read land under this lock
            computed.snapshot.counters.downloads = self.downloads(&period_marker(now));
            let snapshot = computed.snapshot.clone();
            *latest = Some(computed);
            snapshot
        };
        self.recomputes.fetch_add(1, Ordering::Release);
        snapshot
    }

    /// Re-derives limits after a plan change without re-counting.
    pub(crate) fn sync_limits(&self) {
        let tier = self.tier();
        let mut latest = self.latest();

        let Some(computed) = latest.as_mut() else {
            return;
        };

        if computed.snapshot.tier == tier {
            return;
        }

        debug!(from = %computed.snapshot.tier, to = %tier, "Re-deriving usage limits");
        computed.snapshot = computed.snapshot.clone().with_tier(tier);

        if !computed.fallback {
            let computed = computed.clone();
            drop(latest);
            self.write_cache_record(&computed);
        }
    }

    pub(crate) async fn can_perform(&self, kind: UsageKind) -> bool {
        let tier = self.tier();
        if tier.is_paid() && kind != UsageKind::Responses {
            return true;
        }
        self.usage().await.allows(kind)
    }

    /// Gate for mutating actions: returns whether `kind` may proceed and tells
    /// the user when it may not.
    pub(crate) async fn enforce(&self, kind: UsageKind) -> bool {
        if self.can_perform(kind).await {
            return true;
        }

        let tier = self.tier();
        warn!(%kind, %tier, "Monthly usage limit reached");
        self.notifier.notify(Notice::LimitReached { kind, tier });
        false
    }

    /// Counts one download against the current month.
    pub(crate) fn record_download(&self) -> anyhow::Result<u64> {
        let period = period_marker(self.clock.now());

        // Held across the write so a concurrent recompute cannot publish a
        // counter read before it
        let mut latest = self.latest();
        let downloads = self.downloads(&period) + 1;

        self.store
            .set(&self.keys.downloads(&period), &downloads.to_string())?;

        if let Some(computed) = latest.as_mut() {
            computed.snapshot.counters.downloads = downloads;
        }
        drop(latest);

        debug!(downloads, "Recorded download");
        Ok(downloads)
    }

    /// Drops cached snapshots so the next read re-counts.
    pub(crate) fn invalidate(&self) {
        *self.latest() = None;
        if let Err(err) = self.store.remove(&self.keys.usage_cache()) {
            warn!(?err, "Failed to remove usage cache");
        }
    }
}
