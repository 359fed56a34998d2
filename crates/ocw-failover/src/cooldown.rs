// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-(provider, model) cooldowns and adaptive scoring.

use crate::classify::FailureClass;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Score applied to candidates that have never been observed.
const INITIAL_SCORE: f64 = 0.5;
/// Score gain on success.
const SUCCESS_STEP: f64 = 0.1;
/// Score loss on rate limit / server error.
const FAILURE_STEP: f64 = 0.2;
/// Score loss on timeout.
const TIMEOUT_STEP: f64 = 0.15;

/// Live cooldown/score state for one (provider, model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    /// Instant the cooldown lifts; `None` when not cooling.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until_ts: Option<DateTime<Utc>>,
    /// Why the cooldown was applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureClass>,
    /// Adaptive score in `[0, 1]`; higher sorts earlier.
    pub score: f64,
    /// Consecutive failures since the last success.
    pub consecutive_failures: u32,
}

impl Default for CooldownEntry {
    fn default() -> Self {
        Self {
            until_ts: None,
            reason: None,
            score: INITIAL_SCORE,
            consecutive_failures: 0,
        }
    }
}

/// Serialized-per-key cooldown map.
pub struct CooldownMap {
    inner: Mutex<HashMap<(String, String), CooldownEntry>>,
}

impl CooldownMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record a success: score rises, failures reset, cooldown clears.
    pub fn record_success(&self, provider: &str, model: &str) {
        let mut inner = self.inner.lock().expect("cooldown lock poisoned");
        let entry = inner
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        entry.score = (entry.score + SUCCESS_STEP).min(1.0);
        entry.consecutive_failures = 0;
        entry.until_ts = None;
        entry.reason = None;
    }

    /// Record a classified failure, optionally with a provider reset hint.
    ///
    /// Cooldowns only ever advance: a shorter hint never pulls an existing
    /// `until_ts` backward.
    pub fn record_failure(
        &self,
        provider: &str,
        model: &str,
        class: FailureClass,
        reset_hint: Option<Duration>,
    ) {
        let cooldown = match class {
            FailureClass::InvalidRequest => None,
            FailureClass::RateLimit => Some(reset_hint.unwrap_or(class.base_cooldown())),
            FailureClass::ServerError => Some(jittered(class.base_cooldown())),
            other => Some(reset_hint.unwrap_or(other.base_cooldown())),
        };

        let mut inner = self.inner.lock().expect("cooldown lock poisoned");
        let entry = inner
            .entry((provider.to_string(), model.to_string()))
            .or_default();
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        let step = match class {
            FailureClass::Timeout => TIMEOUT_STEP,
            FailureClass::InvalidRequest => 0.0,
            _ => FAILURE_STEP,
        };
        entry.score = (entry.score - step).max(0.0);

        if let Some(cooldown) = cooldown {
            let until = Utc::now()
                + ChronoDuration::from_std(cooldown).unwrap_or_else(|_| ChronoDuration::seconds(60));
            // Monotonic: never decrease an existing cooldown.
            if entry.until_ts.is_none_or(|existing| until > existing) {
                entry.until_ts = Some(until);
                entry.reason = Some(class);
            }
            debug!(provider, model, ?class, until = %until, "cooldown applied");
        }
    }

    /// Whether the pair is cooling at `now`.
    #[must_use]
    pub fn in_cooldown(&self, provider: &str, model: &str, now: DateTime<Utc>) -> bool {
        let inner = self.inner.lock().expect("cooldown lock poisoned");
        inner
            .get(&(provider.to_string(), model.to_string()))
            .and_then(|e| e.until_ts)
            .is_some_and(|until| until > now)
    }

    /// Remaining cooldown at `now`, if any.
    #[must_use]
    pub fn remaining(&self, provider: &str, model: &str, now: DateTime<Utc>) -> Option<Duration> {
        let inner = self.inner.lock().expect("cooldown lock poisoned");
        let until = inner
            .get(&(provider.to_string(), model.to_string()))
            .and_then(|e| e.until_ts)?;
        (until - now).to_std().ok()
    }

    /// Current score (initial for unknown pairs).
    #[must_use]
    pub fn score(&self, provider: &str, model: &str) -> f64 {
        let inner = self.inner.lock().expect("cooldown lock poisoned");
        inner
            .get(&(provider.to_string(), model.to_string()))
            .map_or(INITIAL_SCORE, |e| e.score)
    }

    /// Snapshot of one entry.
    #[must_use]
    pub fn entry(&self, provider: &str, model: &str) -> Option<CooldownEntry> {
        let inner = self.inner.lock().expect("cooldown lock poisoned");
        inner.get(&(provider.to_string(), model.to_string())).cloned()
    }
}

impl Default for CooldownMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Add up to 25% clock-seeded jitter so herds do not re-arrive together.
fn jittered(base: Duration) -> Duration {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    let base_ms = base.as_millis() as u64;
    if base_ms == 0 {
        return base;
    }
    Duration::from_millis(base_ms + nanos % (base_ms / 4 + 1))
}
