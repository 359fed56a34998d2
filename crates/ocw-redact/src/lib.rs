// SPDX-License-Identifier: MIT OR Apache-2.0
//! Redaction and trace substrate.
//!
//! Everything observable leaves the process through this crate: the
//! [`redact`] family masks credentials at every egress, [`TraceStore`] keeps
//! a bounded per-trace event timeline, and [`EventBus`] fans events out to
//! SSE subscribers with per-subscriber overflow accounting.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod mask;
mod store;

pub use bus::{BusEvent, EventBus, EventFilter, EventSubscription};
pub use mask::{redact, redact_value, truncate_payload};
pub use store::{TraceStore, TraceStoreConfig};
