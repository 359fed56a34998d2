// SPDX-License-Identifier: MIT OR Apache-2.0
//! Named in-flight permit counters.

use crate::GateError;
use ocw_core::Source;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Floor for `Retry-After` estimates.
const MIN_BACKOFF: Duration = Duration::from_secs(1);

/// Per-source in-flight caps.
#[derive(Debug, Clone)]
pub struct InflightLimits {
    /// Cap across all sources.
    pub total: usize,
    /// Cap for webhook-sourced admissions.
    pub webhook: usize,
    /// Cap for bridge-sourced admissions.
    pub bridge: usize,
}

impl Default for InflightLimits {
    fn default() -> Self {
        Self {
            total: 2,
            webhook: 1,
            bridge: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: usize,
    webhook: usize,
    bridge: usize,
    /// Acquire instants of live permits, oldest first.
    holders: Vec<Instant>,
    /// Exponentially-weighted mean hold duration.
    ewma_hold: Option<Duration>,
}

impl Counters {
    fn count_for(&self, source: Source) -> usize {
        match source {
            Source::Webhook => self.webhook,
            Source::Bridge => self.bridge,
            _ => 0,
        }
    }

    fn bump(&mut self, source: Source, delta: isize) {
        let apply = |v: &mut usize| {
            *v = v.saturating_add_signed(delta);
        };
        apply(&mut self.total);
        match source {
            Source::Webhook => apply(&mut self.webhook),
            Source::Bridge => apply(&mut self.bridge),
            _ => {}
        }
    }
}

/// Gate handing out RAII permits against the configured caps.
#[derive(Clone)]
pub struct InflightGate {
    inner: Arc<Mutex<Counters>>,
    limits: InflightLimits,
}

impl InflightGate {
    /// Create a gate with the given caps.
    #[must_use]
    pub fn new(limits: InflightLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Counters::default())),
            limits,
        }
    }

    /// Try to acquire a permit for an admission from `source`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::BudgetExceeded`] with an estimated earliest
    /// release when a cap is hit.
    pub fn acquire(&self, source: Source) -> Result<InflightPermit, GateError> {
        let mut counters = self.inner.lock().expect("inflight lock poisoned");

        let scope = if counters.total >= self.limits.total {
            Some("total")
        } else if source == Source::Webhook && counters.webhook >= self.limits.webhook {
            Some("webhook")
        } else if source == Source::Bridge && counters.bridge >= self.limits.bridge {
            Some("bridge")
        } else {
            None
        };

        if let Some(scope) = scope {
            let retry_after = self.estimate_release(&counters);
            debug!(scope, held = counters.total, "in-flight cap refused admission");
            return Err(GateError::BudgetExceeded { scope, retry_after });
        }

        counters.bump(source, 1);
        counters.holders.push(Instant::now());
        drop(counters);

        Ok(InflightPermit {
            gate: Arc::clone(&self.inner),
            source,
            acquired: Instant::now(),
            released: false,
        })
    }

    /// Current number of live permits (all sources).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().expect("inflight lock poisoned").total
    }

    /// Live permits for one source counter.
    #[must_use]
    pub fn in_flight_for(&self, source: Source) -> usize {
        self.inner
            .lock()
            .expect("inflight lock poisoned")
            .count_for(source)
    }

    /// Estimate when the oldest holder will release, bounded below.
    fn estimate_release(&self, counters: &Counters) -> Duration {
        let typical = counters.ewma_hold.unwrap_or(Duration::from_secs(10));
        let oldest_age = counters
            .holders
            .first()
            .map(|t| t.elapsed())
            .unwrap_or_default();
        typical.saturating_sub(oldest_age).max(MIN_BACKOFF)
    }
}

/// RAII permit; dropping releases the counters on every exit path.
pub struct InflightPermit {
    gate: Arc<Mutex<Counters>>,
    source: Source,
    acquired: Instant,
    released: bool,
}

impl InflightPermit {
    /// Explicit release; equivalent to dropping.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let held = self.acquired.elapsed();
        let mut counters = self.gate.lock().expect("inflight lock poisoned");
        counters.bump(self.source, -1);
        if let Some(pos) = counters
            .holders
            .iter()
            .position(|t| *t == self.acquired)
        {
            counters.holders.remove(pos);
        } else if !counters.holders.is_empty() {
            counters.holders.remove(0);
        }
        counters.ewma_hold = Some(match counters.ewma_hold {
            Some(prev) => (prev * 7 + held) / 8,
            None => held,
        });
    }
}

impl Drop for InflightPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}
