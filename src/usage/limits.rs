use serde::{Deserialize, Serialize};

use crate::entitlement::Tier;

/// Action gated by a monthly counter.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, clap::ValueEnum)]
pub(crate) enum UsageKind {
    /// Creating a survey.
    Surveys,
    /// Collecting a testimonial.
    Responses,
    /// Downloading or exporting testimonials.
    Downloads,
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UsageKind::Surveys => write!(f, "surveys"),
            UsageKind::Responses => write!(f, "responses"),
            UsageKind::Downloads => write!(f, "downloads"),
        }
    }
}

/// Per-kind amounts, used both for counters and for limits.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub(crate) struct UsageCounts {
    pub(crate) surveys_created: u64,
    pub(crate) responses_collected: u64,
    pub(crate) downloads: u64,
}

impl UsageCounts {
    pub(crate) fn get(&self, kind: UsageKind) -> u64 {
        match kind {
            UsageKind::Surveys => self.surveys_created,
            UsageKind::Responses => self.responses_collected,
            UsageKind::Downloads => self.downloads,
        }
    }
}

/// Monthly limits for the specified tier.
///
/// Pro has no real cap on surveys or downloads; large finite values stand in
/// for unlimited so arithmetic on them stays bounded.
pub(crate) fn limits_for_tier(tier: Tier) -> UsageCounts {
    match tier {
        Tier::Free => UsageCounts {
            surveys_created: 3,
            responses_collected: 50,
            downloads: 5,
        },
        Tier::Paid => UsageCounts {
            surveys_created: 1_000_000,
            responses_collected: 1_000,
            downloads: 1_000_000,
        },
    }
}

/// Whether `tier` may perform `kind` with `used` already counted this month.
///
/// Pro only ever caps responses.
pub(crate) fn allows(tier: Tier, kind: UsageKind, used: u64) -> bool {
    if tier.is_paid() && kind != UsageKind::Responses {
        return true;
    }
    used < limits_for_tier(tier).get(kind)
}
