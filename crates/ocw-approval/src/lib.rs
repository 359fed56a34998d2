// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval store: the human gate between admission and submission.
//!
//! Requests that policy routes through a human land here as pending
//! [`ApprovalRequest`]s. Transitions follow a fixed graph and are serialized
//! per id; a housekeeping sweep expires stale entries; the whole store
//! persists as an atomically-replaced JSON file.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ocw_core::JobSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Approval lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// Waiting for a decision.
    Pending,
    /// Approved; execution may proceed (possibly after a failed attempt).
    Approved,
    /// Rejected by an operator.
    Rejected,
    /// TTL elapsed before a decision.
    Expired,
    /// Executed against the render engine.
    Executed,
}

impl ApprovalStatus {
    /// Returns `true` if no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Expired | Self::Executed)
    }

    /// Valid successor states.
    #[must_use]
    pub fn valid_transitions(&self) -> &'static [ApprovalStatus] {
        match self {
            // An execute failure keeps the request approved for a retry,
            // which is why Approved lists itself.
            Self::Pending => &[Self::Approved, Self::Rejected, Self::Expired],
            Self::Approved => &[Self::Executed, Self::Approved],
            Self::Rejected | Self::Expired | Self::Executed => &[],
        }
    }

    /// Whether `self → next` is on the graph.
    #[must_use]
    pub fn can_transition_to(&self, next: ApprovalStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One gated submission awaiting (or past) a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Stable identifier.
    pub approval_id: String,
    /// The pre-render job this approval gates.
    pub job: JobSpec,
    /// Current state.
    pub status: ApprovalStatus,
    /// Who asked (source label or caller identity).
    pub requested_by: String,
    /// When the request was created.
    pub requested_at: DateTime<Utc>,
    /// When the request expires if undecided.
    pub expires_at: DateTime<Utc>,
    /// Who decided, once decided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// When the decision landed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Rejection reason, if rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
    /// Render-engine prompt id after execution, for audit linkage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_id: Option<String>,
    /// Last execution error while the request stayed approved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// List filter for the read surface.
#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    /// Only this status.
    pub status: Option<ApprovalStatus>,
    /// Only requests created at or after this instant.
    pub since: Option<DateTime<Utc>>,
}

/// Approval store failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApprovalError {
    /// No request with that id.
    #[error("approval not found: {approval_id}")]
    NotFound {
        /// Requested id.
        approval_id: String,
    },
    /// The transition is not on the state graph.
    #[error("approval {approval_id}: cannot move {from:?} -> {to:?}")]
    StateConflict {
        /// Affected id.
        approval_id: String,
        /// Current state.
        from: ApprovalStatus,
        /// Attempted state.
        to: ApprovalStatus,
    },
    /// Persistence failed.
    #[error("approval persistence failed: {0}")]
    Persist(String),
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Terminal records are kept this long after their decision for audit.
const TERMINAL_RETENTION_HOURS: i64 = 72;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedApprovals {
    approvals: Vec<ApprovalRequest>,
}

/// In-memory approval store with optional file persistence.
///
/// All mutation happens under one mutex, which also serializes transitions
/// per id. File writes are whole-file atomic replace.
pub struct ApprovalStore {
    inner: Mutex<HashMap<String, ApprovalRequest>>,
    path: Option<PathBuf>,
}

impl ApprovalStore {
    /// A store without persistence (tests, ephemeral deployments).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            path: None,
        }
    }

    /// A store persisted at `path`, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::Persist`] when the file exists but cannot be
    /// read or parsed.
    pub fn at_path(path: PathBuf) -> Result<Self, ApprovalError> {
        let mut map = HashMap::new();
        match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: PersistedApprovals = serde_json::from_slice(&bytes)
                    .map_err(|e| ApprovalError::Persist(e.to_string()))?;
                for approval in snapshot.approvals {
                    map.insert(approval.approval_id.clone(), approval);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ApprovalError::Persist(e.to_string())),
        }
        Ok(Self {
            inner: Mutex::new(map),
            path: Some(path),
        })
    }

    /// Create a pending approval for a job.
    pub fn create(
        &self,
        job: JobSpec,
        requested_by: impl Into<String>,
        ttl: std::time::Duration,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let now = Utc::now();
        let ttl = ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::hours(24));
        let approval = ApprovalRequest {
            approval_id: format!("a-{}", Uuid::new_v4().simple()),
            job,
            status: ApprovalStatus::Pending,
            requested_by: requested_by.into(),
            requested_at: now,
            expires_at: now + ttl,
            decided_by: None,
            decided_at: None,
            reject_reason: None,
            prompt_id: None,
            last_error: None,
        };
        let mut inner = self.inner.lock().expect("approval lock poisoned");
        inner.insert(approval.approval_id.clone(), approval.clone());
        self.persist_locked(&inner)?;
        info!(approval_id = %approval.approval_id, "approval created");
        Ok(approval)
    }

    /// Fetch by id.
    pub fn get(&self, approval_id: &str) -> Result<ApprovalRequest, ApprovalError> {
        let inner = self.inner.lock().expect("approval lock poisoned");
        inner
            .get(approval_id)
            .cloned()
            .ok_or_else(|| ApprovalError::NotFound {
                approval_id: approval_id.to_string(),
            })
    }

    /// List with filters, newest first.
    #[must_use]
    pub fn list(&self, filter: &ApprovalFilter) -> Vec<ApprovalRequest> {
        let inner = self.inner.lock().expect("approval lock poisoned");
        let mut out: Vec<ApprovalRequest> = inner
            .values()
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .filter(|a| filter.since.is_none_or(|t| a.requested_at >= t))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.requested_at.cmp(&a.requested_at));
        out
    }

    /// Approve a pending request.
    pub fn approve(
        &self,
        approval_id: &str,
        decided_by: impl Into<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(approval_id, ApprovalStatus::Approved, |approval| {
            approval.decided_by = Some(decided_by.into());
            approval.decided_at = Some(Utc::now());
        })
    }

    /// Reject a pending request with a reason.
    pub fn reject(
        &self,
        approval_id: &str,
        decided_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(approval_id, ApprovalStatus::Rejected, |approval| {
            approval.decided_by = Some(decided_by.into());
            approval.decided_at = Some(Utc::now());
            approval.reject_reason = Some(reason.into());
        })
    }

    /// Record successful execution of an approved request.
    pub fn mark_executed(
        &self,
        approval_id: &str,
        prompt_id: impl Into<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(approval_id, ApprovalStatus::Executed, |approval| {
            approval.prompt_id = Some(prompt_id.into());
            approval.last_error = None;
        })
    }

    /// Record a failed execution attempt; the request stays approved.
    pub fn record_execute_failure(
        &self,
        approval_id: &str,
        error: impl Into<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        self.transition(approval_id, ApprovalStatus::Approved, |approval| {
            approval.last_error = Some(error.into());
        })
    }

    /// Expire pending requests whose TTL elapsed and prune old terminal
    /// records. Returns the number of newly-expired requests.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize, ApprovalError> {
        let mut inner = self.inner.lock().expect("approval lock poisoned");
        let mut expired = 0;
        for approval in inner.values_mut() {
            if approval.status == ApprovalStatus::Pending && approval.expires_at <= now {
                approval.status = ApprovalStatus::Expired;
                approval.decided_at = Some(now);
                expired += 1;
            }
        }
        let retention = ChronoDuration::hours(TERMINAL_RETENTION_HOURS);
        inner.retain(|_, a| {
            !a.status.is_terminal()
                || a.decided_at.map(|t| now - t <= retention).unwrap_or(true)
        });
        self.persist_locked(&inner)?;
        Ok(expired)
    }

    fn transition(
        &self,
        approval_id: &str,
        to: ApprovalStatus,
        apply: impl FnOnce(&mut ApprovalRequest),
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut inner = self.inner.lock().expect("approval lock poisoned");
        let approval = inner
            .get_mut(approval_id)
            .ok_or_else(|| ApprovalError::NotFound {
                approval_id: approval_id.to_string(),
            })?;
        if !approval.status.can_transition_to(to) {
            return Err(ApprovalError::StateConflict {
                approval_id: approval_id.to_string(),
                from: approval.status,
                to,
            });
        }
        approval.status = to;
        apply(approval);
        let snapshot = approval.clone();
        self.persist_locked(&inner)?;
        info!(approval_id, status = ?snapshot.status, "approval transition");
        Ok(snapshot)
    }

    fn persist_locked(
        &self,
        inner: &HashMap<String, ApprovalRequest>,
    ) -> Result<(), ApprovalError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = PersistedApprovals {
            approvals: inner.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ApprovalError::Persist(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| ApprovalError::Persist(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| ApprovalError::Persist(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocw_core::{Source, TraceId};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn job() -> JobSpec {
        JobSpec::new(
            "sdxl_basic",
            BTreeMap::new(),
            Source::Webhook,
            TraceId("t-1".into()),
        )
    }

    fn day() -> Duration {
        Duration::from_secs(86_400)
    }

    // --- state graph ---

    #[test]
    fn graph_shape_is_fixed() {
        use ApprovalStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Expired));
        assert!(Approved.can_transition_to(Executed));
        assert!(Approved.can_transition_to(Approved));
        assert!(!Pending.can_transition_to(Executed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Executed.can_transition_to(Pending));
        for terminal in [Rejected, Expired, Executed] {
            assert!(terminal.is_terminal());
            assert!(terminal.valid_transitions().is_empty());
        }
    }

    // --- store ---

    #[test]
    fn create_then_approve_then_execute() {
        let store = ApprovalStore::in_memory();
        let approval = store.create(job(), "webhook", day()).unwrap();
        assert_eq!(approval.status, ApprovalStatus::Pending);

        let approved = store.approve(&approval.approval_id, "admin").unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);
        assert_eq!(approved.decided_by.as_deref(), Some("admin"));

        let executed = store.mark_executed(&approval.approval_id, "p-42").unwrap();
        assert_eq!(executed.status, ApprovalStatus::Executed);
        assert_eq!(executed.prompt_id.as_deref(), Some("p-42"));
    }

    #[test]
    fn double_approve_is_state_conflict() {
        let store = ApprovalStore::in_memory();
        let approval = store.create(job(), "webhook", day()).unwrap();
        store.approve(&approval.approval_id, "admin").unwrap();
        let err = store.approve(&approval.approval_id, "admin").unwrap_err();
        assert!(matches!(err, ApprovalError::StateConflict { .. }));
    }

    #[test]
    fn execute_failure_keeps_request_approved() {
        let store = ApprovalStore::in_memory();
        let approval = store.create(job(), "webhook", day()).unwrap();
        store.approve(&approval.approval_id, "admin").unwrap();
        let failed = store
            .record_execute_failure(&approval.approval_id, "engine offline")
            .unwrap();
        assert_eq!(failed.status, ApprovalStatus::Approved);
        assert_eq!(failed.last_error.as_deref(), Some("engine offline"));
        // A later retry still works.
        let executed = store.mark_executed(&approval.approval_id, "p-2").unwrap();
        assert_eq!(executed.status, ApprovalStatus::Executed);
        assert!(executed.last_error.is_none());
    }

    #[test]
    fn reject_records_reason() {
        let store = ApprovalStore::in_memory();
        let approval = store.create(job(), "webhook", day()).unwrap();
        let rejected = store
            .reject(&approval.approval_id, "admin", "not today")
            .unwrap();
        assert_eq!(rejected.status, ApprovalStatus::Rejected);
        assert_eq!(rejected.reject_reason.as_deref(), Some("not today"));
        // Rejecting again conflicts.
        assert!(matches!(
            store.reject(&approval.approval_id, "admin", "again"),
            Err(ApprovalError::StateConflict { .. })
        ));
    }

    #[test]
    fn sweep_expires_overdue_pending_only() {
        let store = ApprovalStore::in_memory();
        let stale = store.create(job(), "webhook", Duration::from_secs(0)).unwrap();
        let fresh = store.create(job(), "webhook", day()).unwrap();

        let expired = store.sweep(Utc::now() + ChronoDuration::seconds(1)).unwrap();
        assert_eq!(expired, 1);
        assert_eq!(store.get(&stale.approval_id).unwrap().status, ApprovalStatus::Expired);
        assert_eq!(store.get(&fresh.approval_id).unwrap().status, ApprovalStatus::Pending);
    }

    #[test]
    fn list_filters_by_status() {
        let store = ApprovalStore::in_memory();
        let a = store.create(job(), "webhook", day()).unwrap();
        let _b = store.create(job(), "webhook", day()).unwrap();
        store.approve(&a.approval_id, "admin").unwrap();

        let pending = store.list(&ApprovalFilter {
            status: Some(ApprovalStatus::Pending),
            since: None,
        });
        assert_eq!(pending.len(), 1);
        let all = store.list(&ApprovalFilter::default());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = ApprovalStore::in_memory();
        assert!(matches!(
            store.get("a-missing"),
            Err(ApprovalError::NotFound { .. })
        ));
        assert!(matches!(
            store.approve("a-missing", "admin"),
            Err(ApprovalError::NotFound { .. })
        ));
    }

    #[test]
    fn persistence_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("approvals.json");

        let store = ApprovalStore::at_path(path.clone()).unwrap();
        let approval = store.create(job(), "webhook", day()).unwrap();
        store.approve(&approval.approval_id, "admin").unwrap();

        let reloaded = ApprovalStore::at_path(path).unwrap();
        let restored = reloaded.get(&approval.approval_id).unwrap();
        assert_eq!(restored.status, ApprovalStatus::Approved);
        assert_eq!(restored.decided_by.as_deref(), Some("admin"));
    }
}
