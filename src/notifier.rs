use tracing::{error, info};

use crate::{
    entitlement::{Tier, UPGRADED_CTA},
    usage::{
        FREE_DOWNLOAD_LIMIT_CTA, FREE_RESPONSE_LIMIT_CTA, FREE_SURVEY_LIMIT_CTA,
        PRO_RESPONSE_LIMIT_CTA, UsageKind,
    },
};

/// Something the account holder should be told about.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Notice {
    /// A paid tier was confirmed for a subject that was not paid before.
    Upgraded,
    /// An action was refused because its monthly counter is at the limit.
    LimitReached { kind: UsageKind, tier: Tier },
    /// An explicitly requested subscription check failed.
    EntitlementCheckFailed(String),
    /// An explicitly requested usage refresh failed; zeroed counters are shown.
    UsageRefreshFailed(String),
}

impl Notice {
    fn banner(&self) -> Option<&'static str> {
        match self {
            Notice::Upgraded => Some(UPGRADED_CTA),
            Notice::LimitReached {
                kind: UsageKind::Responses,
                tier: Tier::Paid,
            } => Some(PRO_RESPONSE_LIMIT_CTA),
            Notice::LimitReached {
                kind: UsageKind::Responses,
                tier: Tier::Free,
            } => Some(FREE_RESPONSE_LIMIT_CTA),
            Notice::LimitReached {
                kind: UsageKind::Surveys,
                ..
            } => Some(FREE_SURVEY_LIMIT_CTA),
            Notice::LimitReached {
                kind: UsageKind::Downloads,
                ..
            } => Some(FREE_DOWNLOAD_LIMIT_CTA),
            Notice::EntitlementCheckFailed(_) | Notice::UsageRefreshFailed(_) => None,
        }
    }
}

/// User-facing notification sink.
pub(crate) trait Notifier: Send + Sync + std::fmt::Debug {
    fn notify(&self, notice: Notice);
}

/// Prints banners to stderr and logs everything else.
#[derive(Debug, Default)]
pub(crate) struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, notice: Notice) {
        if let Some(banner) = notice.banner() {
            eprintln!("{banner}");
            info!(?notice, "Displayed notice");
            return;
        }

        match notice {
            Notice::EntitlementCheckFailed(reason) => {
                error!("Failed to check subscription status: {reason}");
            }
            Notice::UsageRefreshFailed(reason) => {
                error!("Failed to refresh usage, showing zeroed counters: {reason}");
            }
            Notice::Upgraded | Notice::LimitReached { .. } => {}
        }
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    notices: std::sync::Mutex<Vec<Notice>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}
