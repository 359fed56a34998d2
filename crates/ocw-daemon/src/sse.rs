// SPDX-License-Identifier: MIT OR Apache-2.0
//! SSE event stream with resume-by-cursor.

use crate::api::guard_read;
use crate::{ApiError, AppState};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use ocw_core::{EventKind, TraceId};
use ocw_redact::EventFilter;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

type Peer = crate::middleware::PeerAddr;

#[derive(Debug, Deserialize)]
pub(crate) struct StreamQuery {
    trace_id: Option<String>,
    kind: Option<String>,
    /// Opaque resume cursor (the last seen sequence number).
    cursor: Option<u64>,
}

/// `GET /events/stream`: replay from the cursor out of the retained ring,
/// then follow the live bus. `Last-Event-ID` doubles as the cursor.
pub(crate) async fn events_stream(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    guard_read(&state, peer, &headers)?;

    let cursor = query.cursor.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    });
    let trace_filter = query.trace_id.map(TraceId);
    let kind_filter = query.kind.as_deref().and_then(EventKind::parse);

    // Subscribe before replaying so no gap opens between ring and live.
    let mut sub = state.bus.subscribe(EventFilter {
        trace_id: trace_filter.clone(),
        kind: kind_filter,
    });
    let backlog = match cursor {
        Some(cursor) => state
            .logring
            .page(Some(cursor), 500)
            .events
            .into_iter()
            .filter(|e| trace_filter.as_ref().is_none_or(|t| &e.trace_id == t))
            .filter(|e| kind_filter.is_none_or(|k| e.kind == k))
            .collect(),
        None => Vec::new(),
    };

    let stream = async_stream(backlog, move |live_tx| async move {
        loop {
            match sub.recv().await {
                Some(event) => {
                    if live_tx.send(event).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    ))
}

/// Bridge the backlog plus a live producer into one SSE stream.
fn async_stream<F, Fut>(
    backlog: Vec<ocw_redact::BusEvent>,
    live: F,
) -> impl Stream<Item = Result<SseEvent, Infallible>>
where
    F: FnOnce(tokio::sync::mpsc::Sender<ocw_redact::BusEvent>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let _producer = tokio::spawn(async move {
        live(tx).await;
    });

    let backlog = futures::stream::iter(backlog);
    let live_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
    futures::StreamExt::map(
        futures::StreamExt::chain(backlog, live_stream),
        |event| Ok(to_sse(event)),
    )
}

/// Render one bus event as an SSE frame. The sequence number becomes the
/// SSE event id so `Last-Event-ID` works as a resume cursor.
fn to_sse(event: ocw_redact::BusEvent) -> SseEvent {
    let name = match event.kind {
        EventKind::StreamDelta => "delta",
        EventKind::StreamFinal => "final",
        EventKind::Error => "error",
        _ => "ready",
    };
    let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .event(name)
        .id(event.seq.to_string())
        .data(data)
}
