// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded dead-letter log for failed callback deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A delivery that exhausted its retries, retained for operator inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Prompt the delivery belonged to.
    pub prompt_id: String,
    /// Trace the delivery belonged to.
    pub trace_id: String,
    /// Destination URL.
    pub url: String,
    /// Number of attempts made.
    pub attempts: u32,
    /// Last error observed.
    pub last_error: String,
    /// When the delivery was abandoned.
    pub abandoned_at: DateTime<Utc>,
}

/// Fixed-capacity ring of dead letters; oldest evicted first.
pub struct DeadLetterLog {
    inner: Mutex<VecDeque<DeadLetter>>,
    capacity: usize,
}

impl DeadLetterLog {
    /// Create a log holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Record an abandoned delivery.
    pub fn push(&self, letter: DeadLetter) {
        let mut inner = self.inner.lock().expect("deadletter lock poisoned");
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(letter);
    }

    /// Snapshot, newest last.
    #[must_use]
    pub fn entries(&self) -> Vec<DeadLetter> {
        let inner = self.inner.lock().expect("deadletter lock poisoned");
        inner.iter().cloned().collect()
    }

    /// Current number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("deadletter lock poisoned").len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeadLetterLog {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn letter(n: u32) -> DeadLetter {
        DeadLetter {
            prompt_id: format!("p-{n}"),
            trace_id: format!("t-{n}"),
            url: "https://hooks.example/in".into(),
            attempts: 5,
            last_error: "timeout".into(),
            abandoned_at: Utc::now(),
        }
    }

    #[test]
    fn capacity_evicts_oldest() {
        let log = DeadLetterLog::new(2);
        for n in 0..4 {
            log.push(letter(n));
        }
        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].prompt_id, "p-2");
        assert_eq!(entries[1].prompt_id, "p-3");
    }

    #[test]
    fn default_capacity_is_bounded() {
        let log = DeadLetterLog::default();
        for n in 0..300 {
            log.push(letter(n));
        }
        assert_eq!(log.len(), 256);
    }
}
