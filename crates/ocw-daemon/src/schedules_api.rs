// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schedule CRUD, run history, and manual trigger firing.

use crate::api::{guard_admin, guard_read};
use crate::middleware::{idempotency_key, trace_from_headers};
use crate::pipeline::AdmissionRequest;
use crate::{ApiError, AppState, api_err};
use axum::Json;
use axum::extract::{Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ocw_core::{Envelope, ErrorKind, Source};
use ocw_scheduler::ScheduleError;
use serde::Deserialize;
use std::sync::Arc;

type Peer = crate::middleware::PeerAddr;

fn schedule_err(err: ScheduleError) -> ApiError {
    match err {
        ScheduleError::NotFound { schedule_id } => api_err(
            ErrorKind::NotFound,
            format!("schedule not found: {schedule_id}"),
        ),
        ScheduleError::CapReached { cap } => {
            api_err(ErrorKind::Conflict, format!("schedule cap reached ({cap})"))
        }
        ScheduleError::InvalidTrigger { reason } => api_err(
            ErrorKind::ValidationError,
            format!("field 'trigger': {reason}"),
        ),
        ScheduleError::Persist(detail) => api_err(ErrorKind::Internal, detail),
    }
}

pub(crate) async fn list_schedules(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    Ok(Json(Envelope::ok(serde_json::json!({
        "schedules": state.schedules.list(),
    }))))
}

pub(crate) async fn get_schedule(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let schedule = state.schedules.get(&id).map_err(schedule_err)?;
    Ok(Json(Envelope::ok(
        serde_json::to_value(schedule).unwrap_or_default(),
    )))
}

pub(crate) async fn get_schedule_runs(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    // 404 for unknown schedules rather than an empty history.
    state.schedules.get(&id).map_err(schedule_err)?;
    Ok(Json(Envelope::ok(serde_json::json!({
        "runs": state.runs.for_schedule(&id),
    }))))
}

pub(crate) async fn create_schedule(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(spec): Json<ocw_scheduler::ScheduleSpec>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    // The template must exist before a schedule can bind it.
    state
        .templates
        .get(&spec.template_id)
        .map_err(|_| api_err(ErrorKind::TemplateDenied, format!("template not allowed: {}", spec.template_id)))?;
    let schedule = state.schedules.create(spec).map_err(schedule_err)?;
    Ok((
        StatusCode::CREATED,
        Json(Envelope::ok(
            serde_json::to_value(schedule).unwrap_or_default(),
        )),
    ))
}

pub(crate) async fn update_schedule(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
    Json(spec): Json<ocw_scheduler::ScheduleSpec>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    state
        .templates
        .get(&spec.template_id)
        .map_err(|_| api_err(ErrorKind::TemplateDenied, format!("template not allowed: {}", spec.template_id)))?;
    let schedule = state.schedules.update(&id, spec).map_err(schedule_err)?;
    Ok(Json(Envelope::ok(
        serde_json::to_value(schedule).unwrap_or_default(),
    )))
}

pub(crate) async fn delete_schedule(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    state.schedules.delete(&id).map_err(schedule_err)?;
    Ok(Json(Envelope::ok_empty()))
}

/// Body for a manual trigger firing.
#[derive(Debug, Deserialize)]
pub(crate) struct FireBody {
    template_id: String,
    #[serde(default)]
    inputs: serde_json::Value,
}

pub(crate) async fn fire_trigger(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<FireBody>,
) -> Result<Response, ApiError> {
    guard_admin(&state, peer, &headers)?;

    let inputs = if body.inputs.is_null() {
        serde_json::json!({})
    } else {
        body.inputs
    };
    let normalized = crate::normalize::normalize_body(&serde_json::json!({
        "template_id": body.template_id,
        "inputs": inputs,
    }))
    .map_err(ApiError)?;

    let request = AdmissionRequest {
        source: Source::Trigger,
        template_id: normalized.template_id,
        inputs: normalized.inputs,
        callback: None,
        idempotency_key: idempotency_key(&headers),
        trace_id: trace_from_headers(&headers),
        requested_by: "trigger".into(),
        dry_run: false,
    };
    let response = state.pipeline().admit(request).await.map_err(ApiError)?;
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(response.envelope)).into_response())
}
