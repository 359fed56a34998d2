// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-firing run history.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Lifecycle of one firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Admitted, waiting on the render engine.
    Queued,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Intentionally not admitted (missed-interval policy, dedupe).
    Skipped,
}

/// One row of run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Stable identifier for this run.
    pub run_id: String,
    /// Owning schedule.
    pub schedule_id: String,
    /// The instant this firing was due.
    pub fire_ts: DateTime<Utc>,
    /// Deterministic idempotency key for this firing.
    pub idem_key: String,
    /// Current status.
    pub status: RunStatus,
    /// Render-engine prompt id once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Failure detail, if failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// Retention knobs for run history.
#[derive(Debug, Clone)]
pub struct RunStoreConfig {
    /// Maximum retained records (oldest evicted first).
    pub max_records: usize,
    /// Maximum record age in days.
    pub ttl_days: i64,
}

impl Default for RunStoreConfig {
    fn default() -> Self {
        Self {
            max_records: 10_000,
            ttl_days: 30,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedRuns {
    runs: Vec<RunRecord>,
}

/// LRU+TTL-bounded run history with optional file persistence.
pub struct RunStore {
    inner: Mutex<VecDeque<RunRecord>>,
    config: RunStoreConfig,
    path: Option<PathBuf>,
}

impl RunStore {
    /// In-memory store.
    #[must_use]
    pub fn in_memory(config: RunStoreConfig) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            config,
            path: None,
        }
    }

    /// Store persisted at `path`, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error string when the file exists but cannot be parsed.
    pub fn at_path(path: PathBuf, config: RunStoreConfig) -> Result<Self, String> {
        let runs = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<PersistedRuns>(&bytes)
                    .map_err(|e| e.to_string())?
                    .runs
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.to_string()),
        };
        Ok(Self {
            inner: Mutex::new(runs.into()),
            config,
            path: Some(path),
        })
    }

    /// Open a new record for a firing. Returns `None` when a record for
    /// `(schedule_id, fire_ts)` already exists — the one-row-per-firing
    /// invariant.
    pub fn open(
        &self,
        schedule_id: &str,
        fire_ts: DateTime<Utc>,
        idem_key: &str,
        status: RunStatus,
    ) -> Option<RunRecord> {
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        if inner
            .iter()
            .any(|r| r.schedule_id == schedule_id && r.fire_ts == fire_ts)
        {
            return None;
        }
        let record = RunRecord {
            run_id: format!("r-{}", Uuid::new_v4().simple()),
            schedule_id: schedule_id.to_string(),
            fire_ts,
            idem_key: idem_key.to_string(),
            status,
            prompt_id: None,
            error: None,
            created_at: Utc::now(),
        };
        inner.push_back(record.clone());
        self.enforce_retention(&mut inner);
        self.persist_locked(&inner);
        Some(record)
    }

    /// Update a record's status and optional fields.
    pub fn resolve(
        &self,
        run_id: &str,
        status: RunStatus,
        prompt_id: Option<String>,
        error: Option<String>,
    ) {
        let mut inner = self.inner.lock().expect("run store lock poisoned");
        if let Some(record) = inner.iter_mut().find(|r| r.run_id == run_id) {
            record.status = status;
            if prompt_id.is_some() {
                record.prompt_id = prompt_id;
            }
            if error.is_some() {
                record.error = error;
            }
        }
        self.persist_locked(&inner);
    }

    /// History for one schedule, newest first.
    #[must_use]
    pub fn for_schedule(&self, schedule_id: &str) -> Vec<RunRecord> {
        let inner = self.inner.lock().expect("run store lock poisoned");
        let mut out: Vec<RunRecord> = inner
            .iter()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.fire_ts.cmp(&a.fire_ts));
        out
    }

    /// Total retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("run store lock poisoned").len()
    }

    /// Whether history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enforce_retention(&self, inner: &mut VecDeque<RunRecord>) {
        let cutoff = Utc::now() - ChronoDuration::days(self.config.ttl_days);
        inner.retain(|r| r.created_at >= cutoff);
        while inner.len() > self.config.max_records {
            inner.pop_front();
        }
    }

    fn persist_locked(&self, inner: &VecDeque<RunRecord>) {
        let Some(path) = &self.path else {
            return;
        };
        let snapshot = PersistedRuns {
            runs: inner.iter().cloned().collect(),
        };
        // History persistence is best-effort; the idempotency keys are what
        // guarantee no duplicate firing after a crash.
        if let Ok(bytes) = serde_json::to_vec(&snapshot) {
            let tmp = path.with_extension("tmp");
            if std::fs::write(&tmp, bytes).is_ok() {
                let _ = std::fs::rename(&tmp, path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: usize) -> RunStore {
        RunStore::in_memory(RunStoreConfig {
            max_records: max,
            ttl_days: 30,
        })
    }

    #[test]
    fn one_record_per_schedule_and_fire_ts() {
        let s = store(100);
        let ts = Utc::now();
        assert!(s.open("s-1", ts, "k", RunStatus::Queued).is_some());
        assert!(s.open("s-1", ts, "k", RunStatus::Queued).is_none());
        // Different instant or schedule is fine.
        assert!(s
            .open("s-1", ts + ChronoDuration::seconds(1), "k2", RunStatus::Queued)
            .is_some());
        assert!(s.open("s-2", ts, "k3", RunStatus::Queued).is_some());
    }

    #[test]
    fn resolve_updates_fields() {
        let s = store(100);
        let record = s.open("s-1", Utc::now(), "k", RunStatus::Queued).unwrap();
        s.resolve(
            &record.run_id,
            RunStatus::Succeeded,
            Some("p-1".into()),
            None,
        );
        let history = s.for_schedule("s-1");
        assert_eq!(history[0].status, RunStatus::Succeeded);
        assert_eq!(history[0].prompt_id.as_deref(), Some("p-1"));
    }

    #[test]
    fn lru_cap_evicts_oldest() {
        let s = store(3);
        let base = Utc::now();
        for n in 0..5 {
            s.open(
                "s-1",
                base + ChronoDuration::seconds(n),
                &format!("k{n}"),
                RunStatus::Queued,
            );
        }
        assert_eq!(s.len(), 3);
        let history = s.for_schedule("s-1");
        // Newest three survive.
        assert_eq!(history[0].idem_key, "k4");
        assert_eq!(history[2].idem_key, "k2");
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.json");
        let s = RunStore::at_path(path.clone(), RunStoreConfig::default()).unwrap();
        s.open("s-1", Utc::now(), "k", RunStatus::Queued).unwrap();

        let reloaded = RunStore::at_path(path, RunStoreConfig::default()).unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.for_schedule("s-1").len(), 1);
    }
}
