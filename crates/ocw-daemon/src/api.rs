// SPDX-License-Identifier: MIT OR Apache-2.0
//! Read surface, config writes, and the interrupt path.

use crate::middleware::{client_ip, request_auth, trace_from_headers};
use crate::{ApiError, AppState, api_err};
use axum::Json;
use axum::extract::{Path as AxPath, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use chrono::Utc;
use ocw_auth::{verify_admin, verify_observability};
use ocw_core::{Envelope, ErrorKind, TraceId};
use ocw_gate::EndpointClass;
use serde::Deserialize;
use std::sync::Arc;

/// Contract version reported by health and handshakes.
pub const API_VERSION: &str = "1";

type Peer = crate::middleware::PeerAddr;

// ---------------------------------------------------------------------------
// Shared guards
// ---------------------------------------------------------------------------

/// Observability-class guard + read bucket.
pub(crate) fn guard_read(
    state: &AppState,
    peer: Peer,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let ip = client_ip(state, peer, headers);
    state
        .limiter
        .check(ip, EndpointClass::Read)
        .map_err(|e| ApiError(crate::pipeline::gate_error(e)))?;
    let auth = request_auth(ip, headers);
    verify_observability(&state.settings.auth, &auth)
        .map_err(|e| api_err(e.kind, e.detail))?;
    Ok(())
}

/// Admin-class guard + write bucket.
pub(crate) fn guard_admin(
    state: &AppState,
    peer: Peer,
    headers: &HeaderMap,
) -> Result<(), ApiError> {
    let ip = client_ip(state, peer, headers);
    state
        .limiter
        .check(ip, EndpointClass::Write)
        .map_err(|e| ApiError(crate::pipeline::gate_error(e)))?;
    let auth = request_auth(ip, headers);
    verify_admin(&state.settings.auth, &auth).map_err(|e| api_err(e.kind, e.detail))?;
    Ok(())
}

fn ok(data: serde_json::Value) -> Json<Envelope> {
    Json(Envelope::ok(data))
}

// ---------------------------------------------------------------------------
// Health + capabilities
// ---------------------------------------------------------------------------

pub(crate) async fn get_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ok(serde_json::json!({
        "status": "ok",
        "version": API_VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "time": Utc::now().to_rfc3339(),
    }))
}

pub(crate) async fn get_capabilities(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let candidates: Vec<serde_json::Value> = state
        .failover
        .candidates()
        .iter()
        .map(|c| {
            serde_json::json!({
                "provider_id": c.provider_id,
                "model": c.model,
                "score": state.failover.cooldowns().score(&c.provider_id, &c.model),
                "cooling": state
                    .failover
                    .cooldowns()
                    .in_cooldown(&c.provider_id, &c.model, Utc::now()),
            })
        })
        .collect();

    Ok(ok(serde_json::json!({
        "version": API_VERSION,
        "deployment_profile": state.posture.profile,
        "runtime_profile": state.posture.runtime_profile,
        "features": {
            "bridge": state.settings.safety.bridge_enabled,
            "require_approval": state.settings.require_approval,
            "scheduler": true,
            "assist": !state.failover.candidates().is_empty(),
            "presets_public_read": state.settings.presets_public_read,
        },
        "templates": state.templates.ids(),
        "llm_candidates": candidates,
    })))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn guardrail_diagnostics(state: &AppState) -> serde_json::Value {
    serde_json::json!({
        "deployment_profile": state.posture.profile,
        "runtime_profile": state.posture.runtime_profile,
        "trust_xff": state.settings.trust_xff,
        "trusted_proxy_count": state.settings.trusted_proxies.len(),
        "allow_any_public_llm_host": state.settings.safety.allow_any_public_llm_host,
        "allow_insecure_base_url": state.settings.safety.allow_insecure_base_url,
        "bridge_enabled": state.settings.safety.bridge_enabled,
    })
}

pub(crate) async fn get_config(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    Ok(ok(state.config_store.read(guardrail_diagnostics(&state))))
}

pub(crate) async fn put_config(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    state.config_store.write(body).map_err(|e| match e {
        ocw_config::ConfigError::GuardrailWrite { fields } => api_err(
            ErrorKind::ValidationError,
            format!("runtime guardrail fields cannot be persisted: {fields:?}"),
        ),
        other => api_err(ErrorKind::Internal, other.to_string()),
    })?;
    Ok(ok(state.config_store.read(guardrail_diagnostics(&state))))
}

// ---------------------------------------------------------------------------
// Logs tail / trace / events / dead letters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct TailQuery {
    trace_id: Option<String>,
    #[serde(default)]
    limit: usize,
}

pub(crate) async fn get_logs_tail(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Query(query): Query<TailQuery>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let trace = query.trace_id.map(TraceId);
    let events = state.logring.tail(trace.as_ref(), query.limit);
    Ok(ok(serde_json::json!({ "events": events })))
}

pub(crate) async fn get_trace(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(prompt_id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let trace_id = state
        .traces
        .trace_for_prompt(&prompt_id)
        .ok_or_else(|| api_err(ErrorKind::NotFound, format!("no trace for {prompt_id}")))?;
    let events = state.traces.timeline(&trace_id);
    Ok(ok(serde_json::json!({
        "trace_id": trace_id,
        "prompt_id": prompt_id,
        "events": events,
    })))
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventsQuery {
    cursor: Option<u64>,
    #[serde(default)]
    limit: usize,
}

pub(crate) async fn get_events(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let page = state.logring.page(query.cursor, query.limit);
    Ok(ok(serde_json::to_value(page).unwrap_or_default()))
}

pub(crate) async fn get_deadletter(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    Ok(ok(serde_json::json!({
        "dead_letters": state.deadletter.entries(),
    })))
}

// ---------------------------------------------------------------------------
// Interrupt
// ---------------------------------------------------------------------------

pub(crate) async fn post_interrupt(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(prompt_id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    let trace_id = trace_from_headers(&headers);
    state
        .engine
        .interrupt()
        .await
        .map_err(|e| api_err(ErrorKind::SubmitFailed, e.to_string()))?;
    tracing::info!(prompt_id = %prompt_id, trace_id = %trace_id, "interrupt routed to engine");
    Ok(ok(serde_json::json!({ "interrupted": prompt_id })))
}
