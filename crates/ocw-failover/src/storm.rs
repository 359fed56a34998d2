// SPDX-License-Identifier: MIT OR Apache-2.0
//! Storm control: coalesce concurrent retries against a freshly
//! rate-limited provider.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// What a caller should do about a possible storm.
pub enum StormOutcome {
    /// No storm in progress; the caller issues the request and must call
    /// [`StormControl::resolve`] afterward.
    Proceed,
    /// A request to this pair is already outstanding inside the window;
    /// await the notifier, then re-check the cooldown map.
    Wait(Arc<Notify>),
}

struct StormEntry {
    started: Instant,
    notify: Arc<Notify>,
}

/// Dedupe window over in-flight requests per (provider, model).
pub struct StormControl {
    inner: Mutex<HashMap<(String, String), StormEntry>>,
    window: Duration,
}

impl StormControl {
    /// Control with the given dedupe window.
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            window,
        }
    }

    /// Enter the window for a pair.
    #[must_use]
    pub fn enter(&self, provider: &str, model: &str) -> StormOutcome {
        let key = (provider.to_string(), model.to_string());
        let mut inner = self.inner.lock().expect("storm lock poisoned");
        if let Some(entry) = inner.get(&key) {
            if entry.started.elapsed() < self.window {
                return StormOutcome::Wait(Arc::clone(&entry.notify));
            }
            // Stale entry: the previous owner never resolved inside the
            // window. Take over.
        }
        inner.insert(
            key,
            StormEntry {
                started: Instant::now(),
                notify: Arc::new(Notify::new()),
            },
        );
        StormOutcome::Proceed
    }

    /// Resolve the outstanding request for a pair, releasing any waiters.
    pub fn resolve(&self, provider: &str, model: &str) {
        let key = (provider.to_string(), model.to_string());
        let entry = {
            let mut inner = self.inner.lock().expect("storm lock poisoned");
            inner.remove(&key)
        };
        if let Some(entry) = entry {
            entry.notify.notify_waiters();
        }
    }
}

impl Default for StormControl {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_caller_proceeds_second_waits() {
        let storm = StormControl::default();
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Proceed));
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Wait(_)));
        // A different pair is unaffected.
        assert!(matches!(storm.enter("b", "m"), StormOutcome::Proceed));
    }

    #[test]
    fn resolve_reopens_the_pair() {
        let storm = StormControl::default();
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Proceed));
        storm.resolve("a", "m");
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Proceed));
    }

    #[test]
    fn stale_window_is_taken_over() {
        let storm = StormControl::new(Duration::from_millis(10));
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Proceed));
        std::thread::sleep(Duration::from_millis(20));
        // The first owner never resolved; a new caller may proceed.
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Proceed));
    }

    #[tokio::test]
    async fn waiters_are_released_on_resolve() {
        let storm = Arc::new(StormControl::default());
        assert!(matches!(storm.enter("a", "m"), StormOutcome::Proceed));
        let StormOutcome::Wait(notify) = storm.enter("a", "m") else {
            panic!("expected Wait");
        };

        let waiter = tokio::spawn(async move {
            notify.notified().await;
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        storm.resolve("a", "m");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter released")
            .unwrap();
    }
}
