// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bounded retained event ring backing logs-tail and `/events`.
//!
//! A drain task copies everything published on the bus into this ring, so
//! polling clients get bounded history while SSE clients get the live
//! stream. Events arrive already redacted.

use ocw_core::TraceId;
use ocw_redact::{BusEvent, EventBus, EventFilter};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Retained-event ring with sequence-cursor paging.
pub struct LogRing {
    inner: Mutex<VecDeque<BusEvent>>,
    capacity: usize,
}

/// Page diagnostics for the deterministic pagination contract.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PageDiagnostics {
    /// The limit actually applied after clamping.
    pub limit: usize,
    /// Whether the requested cursor was reset (stale or in the future).
    pub cursor_reset: bool,
    /// Entries scanned to build the page.
    pub scanned: usize,
    /// Whether more entries remain past this page.
    pub truncated: bool,
}

/// One page of events plus its diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EventPage {
    /// The events, oldest first.
    pub events: Vec<BusEvent>,
    /// Cursor to pass back for the next page.
    pub next_cursor: Option<u64>,
    /// Pagination diagnostics.
    pub pagination: PageDiagnostics,
}

impl LogRing {
    /// Ring holding at most `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    /// Spawn the drain task copying bus events into the ring.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let ring = Arc::clone(self);
        let mut sub = bus.subscribe(EventFilter::default());
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                ring.push(event);
            }
        })
    }

    /// Append one event, evicting the oldest at capacity.
    pub fn push(&self, event: BusEvent) {
        let mut inner = self.inner.lock().expect("logring lock poisoned");
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(event);
    }

    /// The newest `limit` events, optionally filtered by trace.
    #[must_use]
    pub fn tail(&self, trace_id: Option<&TraceId>, limit: usize) -> Vec<BusEvent> {
        let limit = clamp_limit(limit);
        let inner = self.inner.lock().expect("logring lock poisoned");
        inner
            .iter()
            .rev()
            .filter(|e| trace_id.is_none_or(|t| &e.trace_id == t))
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// A deterministic page starting after `cursor`.
    ///
    /// Stale cursors (older than the ring) reset to the oldest retained
    /// event; future cursors reset to the newest. Both resets are reported
    /// in the diagnostics rather than failing the request.
    #[must_use]
    pub fn page(&self, cursor: Option<u64>, limit: usize) -> EventPage {
        let limit = clamp_limit(limit);
        let inner = self.inner.lock().expect("logring lock poisoned");
        let oldest = inner.front().map(|e| e.seq);
        let newest = inner.back().map(|e| e.seq);

        let (start_after, cursor_reset) = match (cursor, oldest, newest) {
            (None, _, _) => (None, false),
            (Some(c), Some(oldest_seq), Some(newest_seq)) => {
                if c + 1 < oldest_seq {
                    // Stale: the requested position was evicted.
                    (None, true)
                } else if c > newest_seq {
                    (Some(newest_seq), true)
                } else {
                    (Some(c), false)
                }
            }
            (Some(_), _, _) => (None, true),
        };

        let mut scanned = 0usize;
        let mut events = Vec::new();
        for event in inner.iter() {
            scanned += 1;
            if let Some(after) = start_after
                && event.seq <= after
            {
                continue;
            }
            if events.len() == limit {
                break;
            }
            events.push(event.clone());
        }
        let truncated = events.len() == limit
            && events
                .last()
                .map(|e| Some(e.seq) != newest)
                .unwrap_or(false);
        let next_cursor = events.last().map(|e| e.seq);

        EventPage {
            events,
            next_cursor,
            pagination: PageDiagnostics {
                limit,
                cursor_reset,
                scanned,
                truncated,
            },
        }
    }

    /// Retained event count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("logring lock poisoned").len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Normalize a requested limit to `1..=500` (default 100 on zero).
fn clamp_limit(limit: usize) -> usize {
    if limit == 0 { 100 } else { limit.min(500) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ocw_core::EventKind;

    fn event(seq: u64, trace: &str) -> BusEvent {
        BusEvent {
            trace_id: TraceId(trace.to_string()),
            kind: EventKind::Admit,
            payload: serde_json::json!({}),
            ts: Utc::now(),
            seq,
        }
    }

    fn ring_with(n: u64) -> LogRing {
        let ring = LogRing::new(1000);
        for seq in 0..n {
            ring.push(event(seq, "t-1"));
        }
        ring
    }

    #[test]
    fn capacity_bound_evicts_oldest() {
        let ring = LogRing::new(3);
        for seq in 0..5 {
            ring.push(event(seq, "t-1"));
        }
        assert_eq!(ring.len(), 3);
        let page = ring.page(None, 10);
        assert_eq!(page.events[0].seq, 2);
    }

    #[test]
    fn tail_filters_by_trace() {
        let ring = LogRing::new(100);
        ring.push(event(0, "t-a"));
        ring.push(event(1, "t-b"));
        ring.push(event(2, "t-a"));
        let tail = ring.tail(Some(&TraceId("t-a".into())), 10);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 0);
        assert_eq!(tail[1].seq, 2);
    }

    #[test]
    fn page_walks_with_cursor() {
        let ring = ring_with(10);
        let first = ring.page(None, 4);
        assert_eq!(first.events.len(), 4);
        assert_eq!(first.next_cursor, Some(3));
        assert!(first.pagination.truncated);

        let second = ring.page(first.next_cursor, 4);
        assert_eq!(second.events[0].seq, 4);
        let third = ring.page(second.next_cursor, 4);
        assert_eq!(third.events.len(), 2);
        assert!(!third.pagination.truncated);
    }

    #[test]
    fn stale_cursor_resets_to_oldest() {
        let ring = LogRing::new(4);
        for seq in 10..20 {
            ring.push(event(seq, "t-1"));
        }
        // Entries 10..16 were evicted; cursor 11 is stale.
        let page = ring.page(Some(11), 10);
        assert!(page.pagination.cursor_reset);
        assert_eq!(page.events[0].seq, 16);
    }

    #[test]
    fn future_cursor_resets_to_newest() {
        let ring = ring_with(5);
        let page = ring.page(Some(999), 10);
        assert!(page.pagination.cursor_reset);
        assert!(page.events.is_empty());
    }

    #[test]
    fn limit_clamped_to_contract() {
        let ring = ring_with(600);
        assert_eq!(ring.page(None, 0).pagination.limit, 100);
        assert_eq!(ring.page(None, 9999).pagination.limit, 500);
    }
}
