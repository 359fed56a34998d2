// SPDX-License-Identifier: MIT OR Apache-2.0
//! Concurrency and budget gate.
//!
//! Admissions pass through two throttles on the way to the render engine:
//! named in-flight counters (total / webhook / bridge) handing out RAII
//! permits, and per-`(client ip, endpoint class)` token buckets. Refusals
//! carry a `Retry-After` estimate derived from the exceeded limit.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bucket;
mod cidr;
mod inflight;

pub use bucket::{BucketConfig, EndpointClass, RateLimiter};
pub use cidr::{Cidr, resolve_client_ip};
pub use inflight::{InflightGate, InflightLimits, InflightPermit};

use std::time::Duration;

/// Gate refusals, each carrying retry guidance.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// An in-flight cap refused the admission.
    #[error("in-flight budget exceeded for {scope}")]
    BudgetExceeded {
        /// Which counter refused (`total`, `webhook`, `bridge`).
        scope: &'static str,
        /// Estimated earliest release.
        retry_after: Duration,
    },
    /// A token bucket refused the request.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// Time until the bucket next refills a token.
        retry_after: Duration,
    },
    /// The rendered workflow exceeded the byte cap.
    #[error("rendered workflow is {size} bytes, cap is {cap}")]
    PayloadTooLarge {
        /// Measured size.
        size: usize,
        /// Configured cap.
        cap: usize,
    },
}

/// Enforce the rendered-workflow byte cap.
///
/// # Errors
///
/// Returns [`GateError::PayloadTooLarge`] when `size > cap`.
pub fn check_payload_size(size: usize, cap: usize) -> Result<(), GateError> {
    if size > cap {
        return Err(GateError::PayloadTooLarge { size, cap });
    }
    Ok(())
}
