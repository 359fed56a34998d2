// SPDX-License-Identifier: MIT OR Apache-2.0
//! Render-engine integration.
//!
//! [`EngineClient`] is the thin transport onto the engine's queue
//! (`/prompt`, `/history/{id}`, `/view`, `/interrupt`); retries live with
//! the callers. [`CallbackWatcher`] polls history for jobs that declared a
//! callback and delivers results through the safe-IO policy with bounded
//! retries, parking exhausted deliveries in a bounded dead-letter log.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod deadletter;
mod watcher;

pub use client::{EngineClient, EngineError, HistoryOutcome, JobOutput};
pub use deadletter::{DeadLetter, DeadLetterLog};
pub use watcher::{CallbackWatcher, WatcherConfig};
