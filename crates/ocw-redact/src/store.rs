// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded per-trace event timelines.

use crate::mask::{redact_value, truncate_payload};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use ocw_core::{EventKind, TraceEvent, TraceId};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Capacity and retention knobs for the [`TraceStore`].
#[derive(Debug, Clone)]
pub struct TraceStoreConfig {
    /// Maximum events retained per trace (oldest evicted first).
    pub per_trace_cap: usize,
    /// Maximum number of live traces (least-recently-touched evicted first).
    pub max_traces: usize,
    /// Global trace TTL in seconds.
    pub ttl_secs: i64,
    /// Payload byte cap applied before append.
    pub payload_max_bytes: usize,
    /// Payload depth cap applied before append.
    pub payload_max_depth: usize,
}

impl Default for TraceStoreConfig {
    fn default() -> Self {
        Self {
            per_trace_cap: 256,
            max_traces: 2048,
            ttl_secs: 3600,
            payload_max_bytes: 4096,
            payload_max_depth: 6,
        }
    }
}

struct Timeline {
    events: VecDeque<TraceEvent>,
    touched: DateTime<Utc>,
}

struct Inner {
    timelines: HashMap<String, Timeline>,
    /// prompt_id → trace_id, for the trace-by-prompt lookup.
    prompts: HashMap<String, String>,
}

/// Map of `trace_id → bounded event timeline`.
///
/// Appended payloads are redacted and size/depth-capped before they are
/// stored, so anything read back is safe to egress.
pub struct TraceStore {
    config: TraceStoreConfig,
    inner: Mutex<Inner>,
}

impl TraceStore {
    /// Create a store with the given retention configuration.
    #[must_use]
    pub fn new(config: TraceStoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                timelines: HashMap::new(),
                prompts: HashMap::new(),
            }),
        }
    }

    /// Append one event to a trace, redacting and bounding the payload.
    pub fn append(&self, trace_id: &TraceId, kind: EventKind, payload: serde_json::Value) {
        let mut payload =
            truncate_payload(&payload, self.config.payload_max_bytes, self.config.payload_max_depth);
        redact_value(&mut payload);

        let now = Utc::now();
        let mut inner = self.inner.lock().expect("trace store lock poisoned");
        self.evict_locked(&mut inner, now);

        let timeline = inner
            .timelines
            .entry(trace_id.as_str().to_string())
            .or_insert_with(|| Timeline {
                events: VecDeque::new(),
                touched: now,
            });
        timeline.touched = now;
        if timeline.events.len() >= self.config.per_trace_cap {
            timeline.events.pop_front();
        }
        timeline.events.push_back(TraceEvent {
            ts: now,
            kind,
            payload,
        });
    }

    /// Associate a render-engine prompt id with a trace.
    pub fn record_prompt(&self, prompt_id: &str, trace_id: &TraceId) {
        let mut inner = self.inner.lock().expect("trace store lock poisoned");
        inner
            .prompts
            .insert(prompt_id.to_string(), trace_id.as_str().to_string());
    }

    /// Resolve the trace that submitted `prompt_id`.
    #[must_use]
    pub fn trace_for_prompt(&self, prompt_id: &str) -> Option<TraceId> {
        let inner = self.inner.lock().expect("trace store lock poisoned");
        inner.prompts.get(prompt_id).cloned().map(TraceId)
    }

    /// Snapshot the timeline for a trace, in append order.
    #[must_use]
    pub fn timeline(&self, trace_id: &TraceId) -> Vec<TraceEvent> {
        let inner = self.inner.lock().expect("trace store lock poisoned");
        inner
            .timelines
            .get(trace_id.as_str())
            .map(|t| t.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of live traces.
    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("trace store lock poisoned");
        inner.timelines.len()
    }

    /// Whether the store holds no traces.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_locked(&self, inner: &mut Inner, now: DateTime<Utc>) {
        let ttl = ChronoDuration::seconds(self.config.ttl_secs);
        inner.timelines.retain(|_, t| now - t.touched <= ttl);

        // Oldest-first eviction when over the trace cap.
        while inner.timelines.len() >= self.config.max_traces {
            let oldest = inner
                .timelines
                .iter()
                .min_by_key(|(_, t)| t.touched)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    inner.timelines.remove(&id);
                }
                None => break,
            }
        }
        let live: std::collections::HashSet<&String> = inner.timelines.keys().collect();
        if live.len() < inner.prompts.len() {
            let keep: Vec<(String, String)> = inner
                .prompts
                .iter()
                .filter(|(_, trace)| live.contains(trace))
                .map(|(p, t)| (p.clone(), t.clone()))
                .collect();
            if keep.len() != inner.prompts.len() {
                inner.prompts = keep.into_iter().collect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(per_trace: usize, max_traces: usize) -> TraceStore {
        TraceStore::new(TraceStoreConfig {
            per_trace_cap: per_trace,
            max_traces,
            ..TraceStoreConfig::default()
        })
    }

    #[test]
    fn append_preserves_order() {
        let s = store(16, 16);
        let id = TraceId("t-1".into());
        s.append(&id, EventKind::Admit, serde_json::json!({"n": 1}));
        s.append(&id, EventKind::AuthOk, serde_json::json!({"n": 2}));
        s.append(&id, EventKind::Submit, serde_json::json!({"n": 3}));
        let events = s.timeline(&id);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::Admit);
        assert_eq!(events[2].kind, EventKind::Submit);
    }

    #[test]
    fn per_trace_cap_drops_oldest() {
        let s = store(3, 16);
        let id = TraceId("t-1".into());
        for n in 0..5 {
            s.append(&id, EventKind::Admit, serde_json::json!({"n": n}));
        }
        let events = s.timeline(&id);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload["n"], 2);
        assert_eq!(events[2].payload["n"], 4);
    }

    #[test]
    fn trace_cap_evicts_oldest_trace() {
        let s = store(4, 2);
        for n in 0..3 {
            let id = TraceId(format!("t-{n}"));
            s.append(&id, EventKind::Admit, serde_json::json!({}));
        }
        assert!(s.len() <= 2);
        assert!(s.timeline(&TraceId("t-0".into())).is_empty());
        assert!(!s.timeline(&TraceId("t-2".into())).is_empty());
    }

    #[test]
    fn payloads_are_redacted_on_append() {
        let s = store(8, 8);
        let id = TraceId("t-1".into());
        s.append(
            &id,
            EventKind::Error,
            serde_json::json!({"api_key": "super-sensitive-value", "msg": "boom"}),
        );
        let events = s.timeline(&id);
        assert_eq!(events[0].payload["api_key"], "[redacted:medium]");
        assert_eq!(events[0].payload["msg"], "boom");
    }

    #[test]
    fn prompt_index_resolves_and_follows_eviction() {
        let s = store(4, 2);
        let id = TraceId("t-1".into());
        s.append(&id, EventKind::Submit, serde_json::json!({}));
        s.record_prompt("p-9", &id);
        assert_eq!(s.trace_for_prompt("p-9"), Some(TraceId("t-1".into())));
        assert_eq!(s.trace_for_prompt("p-unknown"), None);
    }
}
