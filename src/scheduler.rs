use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    select,
    sync::{oneshot, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    entitlement::{Entitlement, EntitlementReconciler},
    usage::{MonthlyResetter, UsageTracker},
};

/// Background task tied to the lifetime of its handle.
///
/// The task stops when [`ScheduledTask::cancel`] is called or the handle is
/// dropped. Work in progress at that moment is dropped at its next await.
#[derive(Debug)]
pub(crate) struct ScheduledTask {
    name: &'static str,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    fn spawn<Fut>(name: &'static str, work: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            select! {
                _ = &mut shutdown_rx => {},
                () = work => {},
            }
            debug!(task = name, "Scheduled task stopped");
        });

        Self {
            name,
            shutdown,
            handle,
        }
    }

    /// Runs `tick` immediately and then every `period`.
    pub(crate) fn every<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(name, async move {
            let mut interval = interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                tick().await;
            }
        })
    }

    pub(crate) async fn cancel(self) {
        let _ = self.shutdown.send(());

        if let Err(err) = self.handle.await
            && err.is_panic()
        {
            warn!(task = self.name, ?err, "Scheduled task panicked");
        }
    }
}

/// Re-checks the subscription in the background. Failures are only logged.
pub(crate) fn entitlement_poller(
    reconciler: Arc<EntitlementReconciler>,
    period: Duration,
) -> ScheduledTask {
    ScheduledTask::every("entitlement-poller", period, move || {
        let reconciler = reconciler.clone();
        async move {
            if let Err(err) = reconciler.refresh(false).await {
                warn!(%err, "Background subscription check failed");
            }
        }
    })
}

/// Checks for a new calendar month and drops cached usage when one begins.
pub(crate) fn period_resetter(
    resetter: Arc<MonthlyResetter>,
    tracker: Arc<UsageTracker>,
    period: Duration,
) -> ScheduledTask {
    ScheduledTask::every("period-resetter", period, move || {
        let resetter = resetter.clone();
        let tracker = tracker.clone();
        async move {
            match resetter.check() {
                Ok(true) => tracker.invalidate(),
                Ok(false) => {}
                Err(err) => warn!(?err, "Failed to check usage period"),
            }
        }
    })
}

/// Re-derives usage limits whenever the entitlement changes.
pub(crate) fn limit_sync(
    mut changes: watch::Receiver<Entitlement>,
    tracker: Arc<UsageTracker>,
) -> ScheduledTask {
    ScheduledTask::spawn("limit-sync", async move {
        while changes.changed().await.is_ok() {
            let tier = changes.borrow_and_update().tier;
            info!(%tier, "Plan changed, updating usage limits");
            tracker.sync_limits();
        }
    })
}
