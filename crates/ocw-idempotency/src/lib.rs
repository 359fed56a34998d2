// SPDX-License-Identifier: MIT OR Apache-2.0
//! Caller-keyed admission dedupe.
//!
//! The store remembers idempotency keys for a TTL and caches the first
//! caller's admission outcome. A second caller with the same key either
//! gets the cached outcome, or — while the first is still in flight — waits
//! a bounded time for it before being told to back off.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// What `begin` told the caller.
#[derive(Debug)]
pub enum Begin {
    /// This key is new; the caller owns it and must `commit` or `abort`.
    Fresh,
    /// The key was seen before and its outcome is cached.
    Done(serde_json::Value),
    /// The key is currently being processed by another caller.
    InFlight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum EntryState {
    Pending,
    Done(serde_json::Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    first_seen: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    state: EntryState,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedEntries {
    entries: Vec<(String, Entry)>,
}

struct Inner {
    entries: HashMap<String, Entry>,
    order: VecDeque<String>,
}

/// Bounded (LRU + TTL) idempotency store.
///
/// Eviction means a replayed key is treated as a fresh request; the bound
/// is a memory guarantee, not a correctness one.
pub struct IdempotencyStore {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
    max_entries: usize,
    default_ttl: ChronoDuration,
}

impl IdempotencyStore {
    /// Create a store holding at most `max_entries` keys for `default_ttl`.
    #[must_use]
    pub fn new(max_entries: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            notify: Arc::new(Notify::new()),
            max_entries,
            default_ttl: ChronoDuration::from_std(default_ttl)
                .unwrap_or_else(|_| ChronoDuration::seconds(600)),
        }
    }

    /// Claim a key or learn what happened to it.
    pub fn begin(&self, key: &str) -> Begin {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        self.evict_locked(&mut inner, now);

        if let Some(entry) = inner.entries.get(key) {
            if entry.expires_at > now {
                return match &entry.state {
                    EntryState::Pending => Begin::InFlight,
                    EntryState::Done(value) => Begin::Done(value.clone()),
                };
            }
            // Expired entry: fall through and reclaim the key.
        }

        inner.entries.insert(
            key.to_string(),
            Entry {
                first_seen: now,
                expires_at: now + self.default_ttl,
                state: EntryState::Pending,
            },
        );
        inner.order.push_back(key.to_string());
        Begin::Fresh
    }

    /// Record the outcome for a key claimed with [`Self::begin`].
    pub fn commit(&self, key: &str, outcome: serde_json::Value) {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.state = EntryState::Done(outcome);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Release a claimed key without an outcome (the admission failed in a
    /// way that should not be replayed to other callers).
    pub fn abort(&self, key: &str) {
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait up to `timeout` for an in-flight key to resolve.
    ///
    /// Returns the cached outcome, or `None` if the wait timed out or the
    /// owner aborted.
    pub async fn wait_for(&self, key: &str, timeout: Duration) -> Option<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let inner = self.inner.lock().expect("idempotency lock poisoned");
                match inner.entries.get(key) {
                    Some(Entry {
                        state: EntryState::Done(value),
                        ..
                    }) => return Some(value.clone()),
                    Some(_) => {}
                    None => return None,
                }
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!(key, "idempotency wait timed out");
                return None;
            }
        }
    }

    /// Peek the cached outcome without claiming the key.
    #[must_use]
    pub fn peek(&self, key: &str) -> Option<serde_json::Value> {
        let inner = self.inner.lock().expect("idempotency lock poisoned");
        match inner.entries.get(key) {
            Some(Entry {
                state: EntryState::Done(value),
                expires_at,
                ..
            }) if *expires_at > Utc::now() => Some(value.clone()),
            _ => None,
        }
    }

    /// Consume a nonce: `true` the first time, `false` on replay.
    ///
    /// Nonces ride the same store as idempotency keys under a reserved
    /// prefix so replayed webhook signatures and replayed admissions share
    /// one bounded budget.
    pub fn consume_nonce(&self, nonce: &str) -> bool {
        let key = format!("nonce:{nonce}");
        match self.begin(&key) {
            Begin::Fresh => {
                self.commit(&key, serde_json::Value::Null);
                true
            }
            _ => false,
        }
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("idempotency lock poisoned");
        inner.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(&self, inner: &mut Inner, now: DateTime<Utc>) {
        // TTL sweep piggybacks on access; entries may linger briefly past
        // expiry but are never returned once stale.
        inner.entries.retain(|_, e| e.expires_at > now);
        while inner.entries.len() >= self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
        inner.order.retain(|k| inner.entries.contains_key(k));
    }

    // -- Persistence (webhook scope) ----------------------------------------

    /// Persist completed entries as JSON via atomic replace.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be written.
    pub fn persist(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = {
            let inner = self.inner.lock().expect("idempotency lock poisoned");
            PersistedEntries {
                entries: inner
                    .entries
                    .iter()
                    .filter(|(_, e)| matches!(e.state, EntryState::Done(_)))
                    .map(|(k, e)| (k.clone(), e.clone()))
                    .collect(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)
    }

    /// Load previously persisted entries, skipping expired ones.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load(&self, path: &Path) -> std::io::Result<usize> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let snapshot: PersistedEntries = serde_json::from_slice(&bytes)?;
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("idempotency lock poisoned");
        let mut loaded = 0;
        for (key, entry) in snapshot.entries {
            if entry.expires_at > now && !inner.entries.contains_key(&key) {
                inner.order.push_back(key.clone());
                inner.entries.insert(key, entry);
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdempotencyStore {
        IdempotencyStore::new(64, Duration::from_secs(60))
    }

    #[test]
    fn first_begin_is_fresh_second_is_in_flight() {
        let s = store();
        assert!(matches!(s.begin("k1"), Begin::Fresh));
        assert!(matches!(s.begin("k1"), Begin::InFlight));
    }

    #[test]
    fn committed_outcome_is_replayed() {
        let s = store();
        assert!(matches!(s.begin("k1"), Begin::Fresh));
        s.commit("k1", serde_json::json!({"prompt_id": "p-1"}));
        match s.begin("k1") {
            Begin::Done(value) => assert_eq!(value["prompt_id"], "p-1"),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn abort_releases_the_key() {
        let s = store();
        assert!(matches!(s.begin("k1"), Begin::Fresh));
        s.abort("k1");
        assert!(matches!(s.begin("k1"), Begin::Fresh));
    }

    #[test]
    fn lru_eviction_treats_replay_as_fresh() {
        let s = IdempotencyStore::new(2, Duration::from_secs(60));
        assert!(matches!(s.begin("a"), Begin::Fresh));
        s.commit("a", serde_json::Value::Null);
        assert!(matches!(s.begin("b"), Begin::Fresh));
        assert!(matches!(s.begin("c"), Begin::Fresh));
        // "a" was the oldest and got evicted.
        assert!(matches!(s.begin("a"), Begin::Fresh));
    }

    #[test]
    fn nonce_consumed_once() {
        let s = store();
        assert!(s.consume_nonce("n-1"));
        assert!(!s.consume_nonce("n-1"));
        assert!(s.consume_nonce("n-2"));
    }

    #[tokio::test]
    async fn waiter_observes_commit() {
        let s = Arc::new(store());
        assert!(matches!(s.begin("k1"), Begin::Fresh));

        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_for("k1", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        s.commit("k1", serde_json::json!({"ok": true}));
        let outcome = waiter.await.unwrap().unwrap();
        assert_eq!(outcome["ok"], true);
    }

    #[tokio::test]
    async fn waiter_times_out_on_stuck_owner() {
        let s = store();
        assert!(matches!(s.begin("k1"), Begin::Fresh));
        let outcome = s.wait_for("k1", Duration::from_millis(50)).await;
        assert!(outcome.is_none());
    }

    #[test]
    fn persistence_roundtrip_keeps_done_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("idempotency.json");

        let s = store();
        assert!(matches!(s.begin("done"), Begin::Fresh));
        s.commit("done", serde_json::json!({"prompt_id": "p-7"}));
        assert!(matches!(s.begin("pending"), Begin::Fresh));
        s.persist(&path).unwrap();

        let restored = store();
        assert_eq!(restored.load(&path).unwrap(), 1);
        match restored.begin("done") {
            Begin::Done(value) => assert_eq!(value["prompt_id"], "p-7"),
            other => panic!("expected Done, got {other:?}"),
        }
        // The pending claim was not persisted.
        assert!(matches!(restored.begin("pending"), Begin::Fresh));
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let s = store();
        assert_eq!(s.load(&dir.path().join("nope.json")).unwrap(), 0);
    }
}
