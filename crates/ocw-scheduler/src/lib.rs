// SPDX-License-Identifier: MIT OR Apache-2.0
//! Time-based synthetic admissions.
//!
//! Schedules persist in an atomically-replaced JSON file; a single tick
//! loop computes due firings per schedule, caps catch-up bursts, applies
//! jitter, and synthesizes each firing into an admission with a
//! deterministic idempotency key so a restart never double-fires.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod runs;
mod store;
mod ticker;

pub use runs::{RunRecord, RunStatus, RunStore, RunStoreConfig};
pub use store::{Schedule, ScheduleSpec, ScheduleStore, TriggerSpec};
pub use ticker::{ScheduleAdmitter, ScheduledFire, TickSummary, Ticker, TickerConfig};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Scheduler failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    /// Unknown schedule id.
    #[error("schedule not found: {schedule_id}")]
    NotFound {
        /// Requested id.
        schedule_id: String,
    },
    /// The schedule file is full.
    #[error("schedule cap reached ({cap})")]
    CapReached {
        /// Configured cap.
        cap: usize,
    },
    /// The trigger expression failed to parse.
    #[error("invalid trigger: {reason}")]
    InvalidTrigger {
        /// Parser detail.
        reason: String,
    },
    /// Persistence failed.
    #[error("schedule persistence failed: {0}")]
    Persist(String),
}

/// Deterministic idempotency key for one firing.
///
/// The same `(schedule, fire instant)` always produces the same key, which
/// is what makes restart recovery duplicate-free.
#[must_use]
pub fn fire_key(schedule_id: &str, fire_ts: chrono::DateTime<chrono::Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(schedule_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(fire_ts.timestamp().to_be_bytes());
    format!("sched-{:x}", hasher.finalize())
}

/// Opt-in behavior for schedules that were down across several intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissedPolicy {
    /// Catch up, bounded by `max_catchup_per_tick`.
    #[default]
    CatchUp,
    /// Skip straight to the newest due firing; older ones become skipped
    /// run records.
    SkipMissed,
}
