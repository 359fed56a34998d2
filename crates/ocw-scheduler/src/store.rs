// SPDX-License-Identifier: MIT OR Apache-2.0
//! Persisted schedule definitions.

use crate::{MissedPolicy, ScheduleError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use croner::Cron;
use ocw_core::InputValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Hard cap on persisted schedules.
const SCHEDULE_CAP: usize = 200;

/// When a schedule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "trigger")]
pub enum TriggerSpec {
    /// Standard five-field cron expression, evaluated in UTC.
    Cron {
        /// The expression.
        expr: String,
    },
    /// Fixed interval in seconds.
    Interval {
        /// Seconds between firings.
        secs: u64,
    },
}

impl TriggerSpec {
    /// Validate the trigger shape.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidTrigger`] on a bad expression or a
    /// zero interval.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Self::Cron { expr } => {
                Cron::new(expr)
                    .parse()
                    .map_err(|e| ScheduleError::InvalidTrigger {
                        reason: e.to_string(),
                    })?;
                Ok(())
            }
            Self::Interval { secs } if *secs == 0 => Err(ScheduleError::InvalidTrigger {
                reason: "interval must be positive".into(),
            }),
            Self::Interval { .. } => Ok(()),
        }
    }

    /// Next firing strictly after `after`.
    #[must_use]
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron { expr } => {
                let cron = Cron::new(expr).parse().ok()?;
                cron.find_next_occurrence(&after, false).ok()
            }
            Self::Interval { secs } => {
                Some(after + ChronoDuration::seconds(i64::try_from(*secs).ok()?))
            }
        }
    }
}

/// One persisted schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Stable identifier.
    pub schedule_id: String,
    /// Human-facing name.
    pub name: String,
    /// Firing rule.
    pub trigger: TriggerSpec,
    /// Template to admit on each firing.
    pub template_id: String,
    /// Bound inputs for the template.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Whether the schedule participates in ticks.
    pub enabled: bool,
    /// Serial schedules admit at most one firing per tick.
    #[serde(default)]
    pub serial: bool,
    /// What to do with firings missed across downtime.
    #[serde(default)]
    pub missed_policy: MissedPolicy,
    /// High-water mark of fired instants.
    pub last_tick_ts: DateTime<Utc>,
    /// Next firing, for display; recomputed on write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Fields a caller may set when creating or updating a schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSpec {
    /// Human-facing name.
    pub name: String,
    /// Firing rule.
    pub trigger: TriggerSpec,
    /// Template to admit.
    pub template_id: String,
    /// Bound inputs.
    #[serde(default)]
    pub inputs: BTreeMap<String, InputValue>,
    /// Start enabled (default true).
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Serial execution.
    #[serde(default)]
    pub serial: bool,
    /// Missed-interval policy.
    #[serde(default)]
    pub missed_policy: MissedPolicy,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSchedules {
    schedules: Vec<Schedule>,
}

/// Atomic-file-backed schedule collection.
pub struct ScheduleStore {
    inner: Mutex<Vec<Schedule>>,
    path: Option<PathBuf>,
}

impl ScheduleStore {
    /// In-memory store (tests).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            path: None,
        }
    }

    /// Store persisted at `path`, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::Persist`] on unreadable or unparseable data.
    pub fn at_path(path: PathBuf) -> Result<Self, ScheduleError> {
        let schedules = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<PersistedSchedules>(&bytes)
                    .map_err(|e| ScheduleError::Persist(e.to_string()))?
                    .schedules
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(ScheduleError::Persist(e.to_string())),
        };
        Ok(Self {
            inner: Mutex::new(schedules),
            path: Some(path),
        })
    }

    /// Create a schedule from a validated spec.
    pub fn create(&self, spec: ScheduleSpec) -> Result<Schedule, ScheduleError> {
        spec.trigger.validate()?;
        let now = Utc::now();
        let schedule = Schedule {
            schedule_id: format!("s-{}", Uuid::new_v4().simple()),
            name: spec.name,
            next_fire_at: spec.trigger.next_after(now),
            trigger: spec.trigger,
            template_id: spec.template_id,
            inputs: spec.inputs,
            enabled: spec.enabled,
            serial: spec.serial,
            missed_policy: spec.missed_policy,
            last_tick_ts: now,
        };
        let mut inner = self.inner.lock().expect("schedule lock poisoned");
        if inner.len() >= SCHEDULE_CAP {
            return Err(ScheduleError::CapReached { cap: SCHEDULE_CAP });
        }
        inner.push(schedule.clone());
        self.persist_locked(&inner)?;
        Ok(schedule)
    }

    /// Replace the mutable fields of an existing schedule.
    pub fn update(&self, schedule_id: &str, spec: ScheduleSpec) -> Result<Schedule, ScheduleError> {
        spec.trigger.validate()?;
        let mut inner = self.inner.lock().expect("schedule lock poisoned");
        let schedule = inner
            .iter_mut()
            .find(|s| s.schedule_id == schedule_id)
            .ok_or_else(|| ScheduleError::NotFound {
                schedule_id: schedule_id.to_string(),
            })?;
        schedule.name = spec.name;
        schedule.next_fire_at = spec.trigger.next_after(Utc::now());
        schedule.trigger = spec.trigger;
        schedule.template_id = spec.template_id;
        schedule.inputs = spec.inputs;
        schedule.enabled = spec.enabled;
        schedule.serial = spec.serial;
        schedule.missed_policy = spec.missed_policy;
        let snapshot = schedule.clone();
        self.persist_locked(&inner)?;
        Ok(snapshot)
    }

    /// Delete a schedule.
    pub fn delete(&self, schedule_id: &str) -> Result<(), ScheduleError> {
        let mut inner = self.inner.lock().expect("schedule lock poisoned");
        let before = inner.len();
        inner.retain(|s| s.schedule_id != schedule_id);
        if inner.len() == before {
            return Err(ScheduleError::NotFound {
                schedule_id: schedule_id.to_string(),
            });
        }
        self.persist_locked(&inner)
    }

    /// Fetch one schedule.
    pub fn get(&self, schedule_id: &str) -> Result<Schedule, ScheduleError> {
        let inner = self.inner.lock().expect("schedule lock poisoned");
        inner
            .iter()
            .find(|s| s.schedule_id == schedule_id)
            .cloned()
            .ok_or_else(|| ScheduleError::NotFound {
                schedule_id: schedule_id.to_string(),
            })
    }

    /// Lock-free snapshot of every schedule.
    #[must_use]
    pub fn list(&self) -> Vec<Schedule> {
        self.inner.lock().expect("schedule lock poisoned").clone()
    }

    /// Advance a schedule's high-water mark after firing.
    pub fn advance(
        &self,
        schedule_id: &str,
        fired_up_to: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut inner = self.inner.lock().expect("schedule lock poisoned");
        let schedule = inner
            .iter_mut()
            .find(|s| s.schedule_id == schedule_id)
            .ok_or_else(|| ScheduleError::NotFound {
                schedule_id: schedule_id.to_string(),
            })?;
        if fired_up_to > schedule.last_tick_ts {
            schedule.last_tick_ts = fired_up_to;
        }
        schedule.next_fire_at = schedule.trigger.next_after(schedule.last_tick_ts);
        self.persist_locked(&inner)
    }

    fn persist_locked(&self, inner: &[Schedule]) -> Result<(), ScheduleError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = PersistedSchedules {
            schedules: inner.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| ScheduleError::Persist(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| ScheduleError::Persist(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| ScheduleError::Persist(e.to_string()))
    }
}
