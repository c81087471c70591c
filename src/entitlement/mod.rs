//! Subscription entitlement for the signed-in account.
//!
//! The billing backend is the authority on whether an account is on the Free
//! or Pro plan, but it is slow and occasionally unavailable. This module keeps
//! a local answer that is always readable without waiting on the network:
//!
//! - On startup the last persisted answer is loaded before any request is made
//! - Remote checks are rate limited and never run concurrently
//! - A confirmed Pro plan is locked in locally and survives failed or timed
//!   out checks. Only a successful check reporting another plan releases it.
//!
//! Consumers that derive limits from the plan subscribe to changes with
//! [`EntitlementReconciler::subscribe`].

pub(crate) mod messages;
pub(crate) mod reconciler;
pub(crate) mod state;

pub(crate) use messages::UPGRADED_CTA;
pub(crate) use reconciler::{EntitlementReconciler, EntitlementSettings, RefreshError};
pub(crate) use state::{Entitlement, Tier};
