use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{sync::watch, time::timeout};
use tracing::{debug, info, instrument, warn};

use super::state::{CacheRecord, Entitlement, Persistence, Tier};
use crate::{
    clock::Clock,
    notifier::{Notice, Notifier},
    remote::{EntitlementOracle, SubscriptionStatus},
    store::{KeyValueStore, Keys},
};

/// Tunables for [`EntitlementReconciler`].
#[derive(Clone, Copy, Debug)]
pub(crate) struct EntitlementSettings {
    /// Minimum spacing between non-forced remote checks.
    pub(crate) cooldown: chrono::Duration,
    /// Age after which a persisted free-tier record is no longer trusted.
    pub(crate) cache_max_age: chrono::Duration,
    pub(crate) request_timeout: Duration,
}

impl Default for EntitlementSettings {
    fn default() -> Self {
        Self {
            cooldown: chrono::Duration::seconds(60),
            cache_max_age: chrono::Duration::minutes(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Error)]
pub(crate) enum RefreshError {
    #[error("Subscription check timed out after {0:?}")]
    Timeout(Duration),

    #[error("Subscription check failed: {0:#}")]
    Remote(anyhow::Error),
}

#[derive(Debug)]
struct ReconcilerState {
    entitlement: Entitlement,
    locked: bool,
    last_checked: Option<DateTime<Utc>>,
}

/// Clears the in-flight marker however the check ends, including when the
/// refresh future is dropped mid-await.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keeps one subject's entitlement in sync with the billing backend.
///
/// Reads are served from memory and never wait on the network. Remote checks
/// are throttled by a cooldown and never overlap. Once a paid tier has been
/// confirmed the lock keeps it in place through failed or timed out checks;
/// only a successful check reporting another tier releases it.
pub(crate) struct EntitlementReconciler {
    keys: Keys,
    store: Arc<dyn KeyValueStore>,
    oracle: Arc<dyn EntitlementOracle>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    settings: EntitlementSettings,
    state: Mutex<ReconcilerState>,
    in_flight: AtomicBool,
    changes: watch::Sender<Entitlement>,
}

impl std::fmt::Debug for EntitlementReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntitlementReconciler")
            .field("subject_id", &self.keys.subject_id())
            .field("settings", &self.settings)
            .field("in_flight", &self.in_flight)
            .finish_non_exhaustive()
    }
}

impl EntitlementReconciler {
    /// Seeds state synchronously from the local store.
    pub(crate) fn new(
        subject_id: &str,
        store: Arc<dyn KeyValueStore>,
        oracle: Arc<dyn EntitlementOracle>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        settings: EntitlementSettings,
    ) -> Self {
        let keys = Keys::new(subject_id);

        let (entitlement, locked) = Persistence {
            store: store.as_ref(),
            keys: &keys,
        }
        .seed(clock.now(), settings.cache_max_age);

        debug!(subject_id, tier = %entitlement.tier, locked, "Seeded entitlement");

        let (changes, _) = watch::channel(entitlement.clone());

        Self {
            keys,
            store,
            oracle,
            clock,
            notifier,
            settings,
            state: Mutex::new(ReconcilerState {
                entitlement,
                locked,
                last_checked: None,
            }),
            in_flight: AtomicBool::new(false),
            changes,
        }
    }

    fn persistence(&self) -> Persistence<'_> {
        Persistence {
            store: self.store.as_ref(),
            keys: &self.keys,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn entitlement(&self) -> Entitlement {
        self.state().entitlement.clone()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state().locked
    }

    /// Yields every change to the entitlement.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Entitlement> {
        self.changes.subscribe()
    }

    /// Why a remote check should be skipped, if it should.
    fn skip_reason(&self, force: bool) -> Option<&'static str> {
        if force {
            return None;
        }

        let state = self.state();

        if state.locked && state.entitlement.tier.is_paid() {
            return Some("paid tier is locked");
        }

        match state.last_checked {
            Some(last_checked) if self.clock.now() - last_checked < self.settings.cooldown => {
                Some("cooldown has not elapsed")
            }
            _ => None,
        }
    }

    /// Re-checks the subscription with the backend unless throttled.
    ///
    /// Returns the current state without a network call when the paid lock
    /// holds, the cooldown has not elapsed, or another check is in flight
    /// (`force` bypasses the first two only).
    #[instrument(skip(self), fields(subject_id = self.keys.subject_id()))]
    pub(crate) async fn refresh(&self, force: bool) -> Result<Entitlement, RefreshError> {
        if let Some(reason) = self.skip_reason(force) {
            debug!(reason, "Skipping subscription check");
            return Ok(self.entitlement());
        }

        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            debug!("Subscription check already in flight");
            return Ok(self.entitlement());
        };

        // A check may have completed between the first look and acquiring
        if let Some(reason) = self.skip_reason(force) {
            debug!(reason, "Skipping subscription check");
            return Ok(self.entitlement());
        }

        let result = timeout(
            self.settings.request_timeout,
            self.oracle.check_subscription(),
        )
        .await;

        let now = self.clock.now();
        self.state().last_checked = Some(now);

        match result {
            Ok(Ok(status)) => Ok(self.apply(&status, now)),
            Ok(Err(err)) => self.recover(RefreshError::Remote(err)),
            Err(_) => self.recover(RefreshError::Timeout(self.settings.request_timeout)),
        }
    }

    /// Explicit user-requested check: always hits the backend and reports
    /// failures through the notifier.
    pub(crate) async fn check_now(&self) -> Entitlement {
        match self.refresh(true).await {
            Ok(entitlement) => entitlement,
            Err(err) => {
                self.notifier.notify(Notice::EntitlementCheckFailed(err.to_string()));
                self.entitlement()
            }
        }
    }

    fn recover(&self, err: RefreshError) -> Result<Entitlement, RefreshError> {
        let state = self.state();

        if state.locked && state.entitlement.tier.is_paid() {
            warn!(%err, "Subscription check failed, keeping locked paid tier");
            return Ok(state.entitlement.clone());
        }

        warn!(%err, "Subscription check failed");
        Err(err)
    }

    fn apply(&self, status: &SubscriptionStatus, now: DateTime<Utc>) -> Entitlement {
        let record = CacheRecord::from_status(status, now);
        let persistence = self.persistence();

        // A lock on disk must never sit next to a free cache record, so it is
        // released before the free record is written
        if !record.tier.is_paid()
            && let Err(err) = persistence.clear_lock()
            && persistence.is_locked()
        {
            warn!(?err, "Failed to clear paid lock, keeping paid tier");
            return self.keep_locked();
        }

        let cache_written = match persistence.write_cache_record(&record) {
            Ok(()) => true,
            Err(err) => {
                warn!(?err, "Failed to persist subscription cache");
                false
            }
        };

        // The lock must never claim paid while the cache disagrees
        let locked = record.tier.is_paid()
            && cache_written
            && match persistence.set_lock() {
                Ok(()) => true,
                Err(err) => {
                    warn!(?err, "Failed to persist paid lock");
                    false
                }
            };

        let entitlement = Entitlement {
            subject_id: self.keys.subject_id().to_owned(),
            tier: record.tier,
            active: record.subscribed,
            renews_at: record.renews_at(),
            verified: record.tier.is_paid(),
        };

        let previous_tier = {
            let mut state = self.state();
            let previous_tier = state.entitlement.tier;
            state.entitlement = entitlement.clone();
            state.locked = locked;
            previous_tier
        };

        info!(
            tier = %entitlement.tier,
            active = entitlement.active,
            locked,
            "Subscription checked"
        );

        if entitlement.tier == Tier::Paid && previous_tier != Tier::Paid {
            info!("Subscription upgraded to paid tier");
            self.notifier.notify(Notice::Upgraded);
        }

        self.publish(&entitlement);
        entitlement
    }

    /// Mirrors a lock that is still on disk: paid tier, locked.
    fn keep_locked(&self) -> Entitlement {
        let entitlement = {
            let mut state = self.state();
            state.locked = true;
            if !state.entitlement.tier.is_paid() {
                state.entitlement = Entitlement {
                    tier: Tier::Paid,
                    active: true,
                    verified: true,
                    ..state.entitlement.clone()
                };
            }
            state.entitlement.clone()
        };

        self.publish(&entitlement);
        entitlement
    }

    fn publish(&self, entitlement: &Entitlement) {
        self.changes.send_if_modified(|current| {
            if current == entitlement {
                false
            } else {
                *current = entitlement.clone();
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::atomic::AtomicUsize};

    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::TimeZone as _;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        clock::ManualClock,
        notifier::RecordingNotifier,
        remote::RemoteTier,
        store::MemoryStore,
    };

    enum Reply {
        Status(SubscriptionStatus),
        Fail,
        Hang,
        /// Waits until released, then answers.
        Gated(Arc<Notify>, SubscriptionStatus),
    }

    #[derive(Default)]
    struct ScriptedOracle {
        replies: Mutex<VecDeque<Reply>>,
        calls: AtomicUsize,
    }

    impl ScriptedOracle {
        fn push(&self, reply: Reply) {
            self.replies.lock().unwrap().push_back(reply);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EntitlementOracle for ScriptedOracle {
        async fn check_subscription(&self) -> anyhow::Result<SubscriptionStatus> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Status(status)) => Ok(status),
                Some(Reply::Fail) | None => Err(anyhow!("503 Service Unavailable")),
                Some(Reply::Hang) => std::future::pending().await,
                Some(Reply::Gated(gate, status)) => {
                    gate.notified().await;
                    Ok(status)
                }
            }
        }
    }

    fn free() -> SubscriptionStatus {
        SubscriptionStatus {
            subscribed: false,
            subscription_tier: RemoteTier::Free,
            subscription_end: None,
        }
    }

    fn pro() -> SubscriptionStatus {
        SubscriptionStatus {
            subscribed: true,
            subscription_tier: RemoteTier::Pro,
            subscription_end: Some("2024-05-01T00:00:00Z".to_owned()),
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        oracle: Arc<ScriptedOracle>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::default()),
                oracle: Arc::new(ScriptedOracle::default()),
                clock: Arc::new(ManualClock::new(
                    Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap(),
                )),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn reconciler(&self) -> EntitlementReconciler {
            EntitlementReconciler::new(
                "user-1",
                self.store.clone(),
                self.oracle.clone(),
                self.clock.clone(),
                self.notifier.clone(),
                EntitlementSettings::default(),
            )
        }

        fn lock_value(&self) -> Option<String> {
            self.store.get(&Keys::new("user-1").paid_lock()).unwrap()
        }
    }

    #[tokio::test]
    async fn first_free_check_leaves_lock_unset() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(free()));
        let reconciler = harness.reconciler();

        let entitlement = reconciler.refresh(false).await.unwrap();

        assert_eq!(entitlement.tier, Tier::Free);
        assert!(!entitlement.active);
        assert_eq!(reconciler.entitlement(), entitlement);
        assert!(!reconciler.is_locked());
        assert_eq!(harness.lock_value(), None);

        let cached = harness
            .store
            .get(&Keys::new("user-1").entitlement_cache())
            .unwrap()
            .unwrap();
        let cached: CacheRecord = serde_json::from_str(&cached).unwrap();
        assert_eq!(cached.tier, Tier::Free);
        assert_eq!(cached.cached_at, harness.clock.now());
    }

    #[tokio::test]
    async fn cooldown_allows_one_call_per_window() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(free()));
        harness.oracle.push(Reply::Status(free()));
        let reconciler = harness.reconciler();

        for _ in 0..5 {
            reconciler.refresh(false).await.unwrap();
            harness.clock.advance(chrono::Duration::seconds(5));
        }
        assert_eq!(harness.oracle.calls(), 1);

        harness.clock.advance(chrono::Duration::seconds(60));
        reconciler.refresh(false).await.unwrap();
        assert_eq!(harness.oracle.calls(), 2);
    }

    #[tokio::test]
    async fn failed_checks_also_start_the_cooldown() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();

        assert!(matches!(
            reconciler.refresh(false).await,
            Err(RefreshError::Remote(_))
        ));
        assert!(reconciler.refresh(false).await.is_ok());
        assert_eq!(harness.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn force_bypasses_cooldown() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(free()));
        harness.oracle.push(Reply::Status(free()));
        let reconciler = harness.reconciler();

        reconciler.refresh(false).await.unwrap();
        reconciler.refresh(true).await.unwrap();
        assert_eq!(harness.oracle.calls(), 2);
    }

    #[tokio::test]
    async fn paid_check_sets_lock_and_announces_once() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(pro()));
        harness.oracle.push(Reply::Status(pro()));
        let reconciler = harness.reconciler();
        let mut changes = reconciler.subscribe();

        let entitlement = reconciler.refresh(false).await.unwrap();
        assert_eq!(entitlement.tier, Tier::Paid);
        assert!(entitlement.verified);
        assert_eq!(
            entitlement.renews_at,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
        );
        assert!(reconciler.is_locked());
        assert_eq!(harness.lock_value().as_deref(), Some("true"));
        assert!(changes.has_changed().unwrap());
        assert_eq!(changes.borrow_and_update().tier, Tier::Paid);

        reconciler.refresh(true).await.unwrap();
        assert_eq!(harness.notifier.notices(), vec![Notice::Upgraded]);
        assert!(!changes.has_changed().unwrap());
    }

    #[tokio::test]
    async fn locked_paid_tier_skips_remote_unless_forced() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(pro()));
        let reconciler = harness.reconciler();
        reconciler.refresh(false).await.unwrap();

        harness.clock.advance(chrono::Duration::hours(2));
        let entitlement = reconciler.refresh(false).await.unwrap();
        assert_eq!(entitlement.tier, Tier::Paid);
        assert_eq!(harness.oracle.calls(), 1);
    }

    #[tokio::test]
    async fn failure_never_evicts_locked_paid_tier() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(pro()));
        harness.oracle.push(Reply::Fail);
        let reconciler = harness.reconciler();
        reconciler.refresh(false).await.unwrap();

        let entitlement = reconciler.refresh(true).await.unwrap();
        assert_eq!(entitlement.tier, Tier::Paid);
        assert_eq!(reconciler.entitlement().tier, Tier::Paid);
        assert!(reconciler.is_locked());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_lock_from_previous_session() {
        let harness = Harness::new();
        let keys = Keys::new("user-1");
        harness.store.set(&keys.paid_lock(), "true").unwrap();
        harness.oracle.push(Reply::Hang);

        let reconciler = harness.reconciler();
        assert_eq!(reconciler.entitlement().tier, Tier::Paid);

        let entitlement = reconciler.refresh(true).await.unwrap();
        assert_eq!(entitlement.tier, Tier::Paid);
        assert_eq!(reconciler.entitlement().tier, Tier::Paid);
        assert_eq!(harness.oracle.calls(), 1);
        assert!(!reconciler.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_lock_is_reported() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Hang);
        let reconciler = harness.reconciler();

        let err = reconciler.refresh(false).await.unwrap_err();
        assert!(matches!(err, RefreshError::Timeout(_)));
        assert_eq!(reconciler.entitlement().tier, Tier::Free);
        assert!(!reconciler.in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn explicit_free_response_releases_lock() {
        let harness = Harness::new();
        harness.oracle.push(Reply::Status(pro()));
        harness.oracle.push(Reply::Status(free()));
        let reconciler = harness.reconciler();

        reconciler.refresh(false).await.unwrap();
        let entitlement = reconciler.refresh(true).await.unwrap();

        assert_eq!(entitlement.tier, Tier::Free);
        assert!(!entitlement.verified);
        assert!(!reconciler.is_locked());
        assert_eq!(harness.lock_value(), None);

        let restarted = harness.reconciler();
        assert_eq!(restarted.entitlement().tier, Tier::Free);
        assert!(!restarted.is_locked());
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_call() {
        let harness = Harness::new();
        let gate = Arc::new(Notify::new());
        harness.oracle.push(Reply::Gated(gate.clone(), pro()));
        let reconciler = harness.reconciler();

        let first = reconciler.refresh(true);
        let second = async {
            tokio::task::yield_now().await;
            let during = reconciler.refresh(true).await.unwrap();
            gate.notify_one();
            during
        };

        let (first, during) = tokio::join!(first, second);

        assert_eq!(harness.oracle.calls(), 1);
        assert_eq!(during.tier, Tier::Free);
        assert_eq!(first.unwrap().tier, Tier::Paid);
    }

    #[tokio::test]
    async fn check_now_reports_failures() {
        let harness = Harness::new();
        let reconciler = harness.reconciler();

        let entitlement = reconciler.check_now().await;
        assert_eq!(entitlement.tier, Tier::Free);
        assert!(matches!(
            harness.notifier.notices().as_slice(),
            [Notice::EntitlementCheckFailed(_)]
        ));
    }

    #[tokio::test]
    async fn lock_is_not_set_when_cache_write_fails() {
        #[derive(Debug, Default)]
        struct ReadOnlyCache(MemoryStore);

        impl KeyValueStore for ReadOnlyCache {
            fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
                self.0.get(key)
            }

            fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
                if key.starts_with("subscription_cache_") {
                    return Err(anyhow!("quota exceeded"));
                }
                self.0.set(key, value)
            }

            fn remove(&self, key: &str) -> anyhow::Result<()> {
                self.0.remove(key)
            }
        }

        let harness = Harness::new();
        harness.oracle.push(Reply::Status(pro()));
        let store = Arc::new(ReadOnlyCache::default());
        let reconciler = EntitlementReconciler::new(
            "user-1",
            store.clone(),
            harness.oracle.clone(),
            harness.clock.clone(),
            harness.notifier.clone(),
            EntitlementSettings::default(),
        );

        let entitlement = reconciler.refresh(false).await.unwrap();
        assert_eq!(entitlement.tier, Tier::Paid);
        assert!(!reconciler.is_locked());
        assert_eq!(store.get(&Keys::new("user-1").paid_lock()).unwrap(), None);
    }

    #[tokio::test]
    async fn lock_that_cannot_be_released_keeps_paid_tier() {
        #[derive(Debug, Default)]
        struct StickyStore(MemoryStore);

        impl KeyValueStore for StickyStore {
            fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
                self.0.get(key)
            }

            fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
                self.0.set(key, value)
            }

            fn remove(&self, _key: &str) -> anyhow::Result<()> {
                Err(anyhow!("read-only file system"))
            }
        }

        let harness = Harness::new();
        harness.oracle.push(Reply::Status(pro()));
        harness.oracle.push(Reply::Status(free()));
        let store = Arc::new(StickyStore::default());
        let reconciler_for = |store: Arc<StickyStore>| {
            EntitlementReconciler::new(
                "user-1",
                store,
                harness.oracle.clone(),
                harness.clock.clone(),
                harness.notifier.clone(),
                EntitlementSettings::default(),
            )
        };

        let reconciler = reconciler_for(store.clone());
        reconciler.refresh(false).await.unwrap();
        assert!(reconciler.is_locked());

        let entitlement = reconciler.refresh(true).await.unwrap();
        assert_eq!(entitlement.tier, Tier::Paid);
        assert!(reconciler.is_locked());

        let keys = Keys::new("user-1");
        let raw = store.get(&keys.entitlement_cache()).unwrap().unwrap();
        let cached: CacheRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(cached.tier, Tier::Paid);

        let restarted = reconciler_for(store);
        assert_eq!(restarted.entitlement().tier, reconciler.entitlement().tier);
        assert_eq!(restarted.is_locked(), reconciler.is_locked());
    }
}
