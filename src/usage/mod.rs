//! Monthly usage limits.
//!
//! Usage is counted per calendar month (UTC):
//! - Surveys created and testimonials collected are counted by the backend
//! - Downloads are counted locally
//!
//! **Free plan**: small caps on every kind of action.
//!
//! **Pro plan**: only collected testimonials are capped.
//!
//! Counting is cached for a few minutes; [`UsageTracker::enforce`] is the
//! gate every mutating action goes through. [`MonthlyResetter`] clears the
//! month-scoped local state once the calendar month rolls over.

pub(crate) mod limits;
pub(crate) mod messages;
pub(crate) mod period;
pub(crate) mod tracker;

pub(crate) use limits::UsageKind;
pub(crate) use messages::{
    FREE_DOWNLOAD_LIMIT_CTA, FREE_RESPONSE_LIMIT_CTA, FREE_SURVEY_LIMIT_CTA,
    PRO_RESPONSE_LIMIT_CTA,
};
pub(crate) use period::MonthlyResetter;
pub(crate) use tracker::{UsageSettings, UsageTracker};
