// SPDX-License-Identifier: MIT OR Apache-2.0
//! Assist endpoints: planner and refiner, plain and streaming.
//!
//! These call the failover layer directly; no template or in-flight gate
//! applies, only the per-client assist bucket.

use crate::middleware::{client_ip, request_auth, trace_from_headers};
use crate::{ApiError, AppState, api_err};
use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use ocw_auth::verify_observability;
use ocw_core::{Envelope, ErrorKind, EventKind};
use ocw_failover::{AssistEvent, AssistRequest, AssistTask, FailoverError};
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

type Peer = crate::middleware::PeerAddr;

#[derive(Debug, Deserialize)]
pub(crate) struct AssistBody {
    prompt: String,
    #[serde(default)]
    context: Option<String>,
}

fn guard_assist(state: &AppState, peer: Peer, headers: &HeaderMap) -> Result<(), ApiError> {
    let ip = client_ip(state, peer, headers);
    state
        .limiter
        .check(ip, ocw_gate::EndpointClass::Assist)
        .map_err(|e| ApiError(crate::pipeline::gate_error(e)))?;
    let auth = request_auth(ip, headers);
    verify_observability(&state.settings.auth, &auth).map_err(|e| api_err(e.kind, e.detail))?;
    Ok(())
}

fn failover_err(err: FailoverError) -> ApiError {
    match err {
        FailoverError::Unavailable { retry_after } => {
            let mut out =
                ocw_core::OcwError::new(ErrorKind::ProviderUnavailable, "no provider available");
            if let Some(delay) = retry_after {
                out = out.with_retry_after(delay);
            }
            ApiError(out)
        }
        FailoverError::InvalidRequest { status, detail } => api_err(
            ErrorKind::ValidationError,
            format!("provider rejected request (status {status}): {detail}"),
        ),
        FailoverError::NoCandidates => api_err(ErrorKind::Disabled, "assist is not configured"),
    }
}

async fn run_assist(
    state: Arc<AppState>,
    peer: Peer,
    headers: HeaderMap,
    task: AssistTask,
    body: AssistBody,
) -> Result<Json<Envelope>, ApiError> {
    guard_assist(&state, peer, &headers)?;
    let trace_id = trace_from_headers(&headers);
    let request = AssistRequest {
        task,
        prompt: body.prompt,
        context: body.context,
    };

    let reply = state
        .failover
        .invoke(&request, &trace_id)
        .await
        .map_err(failover_err)?;

    state.traces.append(
        &trace_id,
        EventKind::StreamFinal,
        serde_json::json!({"provider": reply.provider_id, "model": reply.model}),
    );
    Ok(Json(
        Envelope::ok(serde_json::json!({
            "text": reply.text,
            "provider_id": reply.provider_id,
            "model": reply.model,
        }))
        .with_trace(trace_id),
    ))
}

fn run_assist_stream(
    state: Arc<AppState>,
    peer: Peer,
    headers: HeaderMap,
    task: AssistTask,
    body: AssistBody,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    guard_assist(&state, peer, &headers)?;
    let trace_id = trace_from_headers(&headers);
    let request = AssistRequest {
        task,
        prompt: body.prompt,
        context: body.context,
    };

    let mut rx = state.failover.invoke_stream(request, trace_id.clone());
    let bus = Arc::clone(&state.bus);
    let traces = Arc::clone(&state.traces);

    let stream = async_stream::stream(move |tx| async move {
        while let Some(mut event) = rx.recv().await {
            match &mut event {
                AssistEvent::Delta { .. } => {
                    bus.publish(&trace_id, EventKind::StreamDelta, serde_json::json!({}));
                }
                AssistEvent::Final { reply } => {
                    traces.append(
                        &trace_id,
                        EventKind::StreamFinal,
                        serde_json::json!({"provider": reply.provider_id}),
                    );
                }
                // Error details can echo provider response text; redact
                // before the frame leaves the process.
                AssistEvent::Error { detail, .. } => {
                    *detail = ocw_redact::redact(detail, false);
                }
                _ => {}
            }
            if tx.send(event).await.is_err() {
                return;
            }
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    ))
}

mod async_stream {
    //! Channel-backed SSE stream builder for assist events.

    use super::*;

    pub(super) fn stream<F, Fut>(
        producer: F,
    ) -> impl Stream<Item = Result<SseEvent, Infallible>>
    where
        F: FnOnce(tokio::sync::mpsc::Sender<AssistEvent>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let _producer = tokio::spawn(async move {
            producer(tx).await;
        });
        let rx = tokio_stream::wrappers::ReceiverStream::new(rx);
        futures::StreamExt::map(rx, |event| {
            let name = match &event {
                AssistEvent::Stage { .. } => "stage",
                AssistEvent::Delta { .. } => "delta",
                AssistEvent::Final { .. } => "final",
                AssistEvent::Error { .. } => "error",
                AssistEvent::Keepalive => "keepalive",
            };
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
            Ok(SseEvent::default().event(name).data(data))
        })
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

pub(crate) async fn post_planner(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<AssistBody>,
) -> Result<Json<Envelope>, ApiError> {
    run_assist(state, peer, headers, AssistTask::Planner, body).await
}

pub(crate) async fn post_refiner(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<AssistBody>,
) -> Result<Json<Envelope>, ApiError> {
    run_assist(state, peer, headers, AssistTask::Refiner, body).await
}

pub(crate) async fn post_planner_stream(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<AssistBody>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    run_assist_stream(state, peer, headers, AssistTask::Planner, body)
}

pub(crate) async fn post_refiner_stream(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<AssistBody>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    run_assist_stream(state, peer, headers, AssistTask::Refiner, body)
}
