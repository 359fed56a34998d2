// SPDX-License-Identifier: MIT OR Apache-2.0
//! Downstream LLM provider failover.
//!
//! Assist endpoints (planner/refiner) call providers through this layer,
//! which classifies failures, applies per-(provider, model) cooldowns with
//! adaptive scoring, coalesces retry storms after a fresh rate limit, and
//! selects candidates deterministically from the request's trace seed.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod classify;
mod cooldown;
mod provider;
mod router;
mod storm;

pub use classify::{FailureClass, classify_response, parse_retry_after};
pub use cooldown::{CooldownEntry, CooldownMap};
pub use provider::{
    AssistEvent, AssistReply, AssistRequest, AssistTask, Candidate, ProviderApi, ProviderFailure,
};
pub use router::{FailoverConfig, FailoverError, FailoverNote, FailoverObserver, FailoverRouter};
pub use storm::{StormControl, StormOutcome};
