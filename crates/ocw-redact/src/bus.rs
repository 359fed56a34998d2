// SPDX-License-Identifier: MIT OR Apache-2.0
//! Broadcast fan-out for trace events.
//!
//! SSE handlers subscribe here. Each subscriber owns a bounded queue; when
//! it lags, the oldest events are dropped and a synthetic `dropped` marker
//! event is yielded so clients can tell the stream is incomplete.

use crate::mask::redact_value;
use chrono::{DateTime, Utc};
use ocw_core::{EventKind, TraceId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

/// An event as seen on the bus and over SSE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    /// Trace the event belongs to.
    pub trace_id: TraceId,
    /// Event kind.
    pub kind: EventKind,
    /// Redacted payload.
    pub payload: serde_json::Value,
    /// When the source operation completed.
    pub ts: DateTime<Utc>,
    /// Monotonic sequence number, usable as an SSE resume cursor.
    pub seq: u64,
}

/// Subscription filter: both fields are conjunctive when present.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events for this trace.
    pub trace_id: Option<TraceId>,
    /// Only events of this kind.
    pub kind: Option<EventKind>,
}

impl EventFilter {
    fn matches(&self, event: &BusEvent) -> bool {
        if let Some(trace) = &self.trace_id
            && trace != &event.trace_id
        {
            return false;
        }
        if let Some(kind) = self.kind
            && kind != event.kind
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    seq: AtomicU64,
}

/// Broadcast-based event bus with per-subscriber overflow markers.
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
    stats: Arc<StatsInner>,
}

impl EventBus {
    /// Create a bus with the default per-subscriber capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given per-subscriber capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Publish an event. The payload is redacted before it leaves.
    pub fn publish(&self, trace_id: &TraceId, kind: EventKind, mut payload: serde_json::Value) {
        redact_value(&mut payload);
        let seq = self.stats.seq.fetch_add(1, Ordering::Relaxed);
        self.stats.total_published.fetch_add(1, Ordering::Relaxed);
        // send fails only when no subscriber is listening; that is fine.
        let _ = self.tx.send(BusEvent {
            trace_id: trace_id.clone(),
            kind,
            payload,
            ts: Utc::now(),
            seq,
        });
    }

    /// Subscribe with a filter. Events published before this call are not
    /// replayed.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            filter,
        }
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total events published since startup.
    #[must_use]
    pub fn total_published(&self) -> u64 {
        self.stats.total_published.load(Ordering::Relaxed)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A filtered receive handle onto the bus.
pub struct EventSubscription {
    rx: broadcast::Receiver<BusEvent>,
    filter: EventFilter,
}

impl EventSubscription {
    /// Receive the next matching event.
    ///
    /// On subscriber overflow a synthetic [`EventKind::Dropped`] marker is
    /// returned first, carrying the number of lost events; surviving events
    /// keep their original order. Returns `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(BusEvent {
                        trace_id: TraceId("bus".into()),
                        kind: EventKind::Dropped,
                        payload: serde_json::json!({ "dropped": n }),
                        ts: Utc::now(),
                        seq: 0,
                    });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive without waiting.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    if self.filter.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(BusEvent {
                        trace_id: TraceId("bus".into()),
                        kind: EventKind::Dropped,
                        payload: serde_json::json!({ "dropped": n }),
                        ts: Utc::now(),
                        seq: 0,
                    });
                }
                Err(_) => return None,
            }
        }
    }
}
