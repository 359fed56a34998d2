// SPDX-License-Identifier: MIT OR Apache-2.0
//! Approval surface: list, inspect, decide, execute.

use crate::api::{guard_admin, guard_read};
use crate::{ApiError, AppState, api_err};
use axum::Json;
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ocw_approval::{ApprovalFilter, ApprovalStatus};
use ocw_core::{Envelope, ErrorKind};
use serde::Deserialize;
use std::sync::Arc;

type Peer = crate::middleware::PeerAddr;

fn approval_err(err: ocw_approval::ApprovalError) -> ApiError {
    ApiError(crate::pipeline::approval_error(err))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    status: Option<String>,
}

pub(crate) async fn list_approvals(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(parse_status(raw)?),
    };
    let approvals = state.approvals.list(&ApprovalFilter {
        status,
        since: None,
    });
    Ok(Json(Envelope::ok(serde_json::json!({
        "approvals": approvals,
    }))))
}

pub(crate) async fn get_approval(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_read(&state, peer, &headers)?;
    let approval = state.approvals.get(&id).map_err(approval_err)?;
    Ok(Json(Envelope::ok(
        serde_json::to_value(approval).unwrap_or_default(),
    )))
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ApproveBody {
    #[serde(default)]
    auto_execute: bool,
    #[serde(default)]
    decided_by: Option<String>,
}

pub(crate) async fn approve(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
    raw: axum::body::Bytes,
) -> Result<Response, ApiError> {
    guard_admin(&state, peer, &headers)?;
    // An empty body means "approve, no execution".
    let body: ApproveBody = if raw.is_empty() {
        ApproveBody::default()
    } else {
        serde_json::from_slice(&raw)
            .map_err(|e| api_err(ErrorKind::ValidationError, format!("body: {e}")))?
    };
    let decided_by = body.decided_by.unwrap_or_else(|| "admin".to_string());

    let approval = state.approvals.approve(&id, decided_by).map_err(approval_err)?;

    if body.auto_execute {
        let response = state.pipeline().execute_approved(&id).await.map_err(ApiError)?;
        let status = StatusCode::from_u16(response.status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Ok((status, Json(response.envelope)).into_response());
    }

    Ok(Json(Envelope::ok(
        serde_json::to_value(approval).unwrap_or_default(),
    ))
    .into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct RejectBody {
    reason: String,
    #[serde(default)]
    decided_by: Option<String>,
}

pub(crate) async fn reject(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(id): AxPath<String>,
    Json(body): Json<RejectBody>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    let decided_by = body.decided_by.unwrap_or_else(|| "admin".to_string());
    let approval = state
        .approvals
        .reject(&id, decided_by, body.reason)
        .map_err(approval_err)?;
    Ok(Json(Envelope::ok(
        serde_json::to_value(approval).unwrap_or_default(),
    )))
}

fn parse_status(raw: &str) -> Result<ApprovalStatus, ApiError> {
    match raw {
        "pending" => Ok(ApprovalStatus::Pending),
        "approved" => Ok(ApprovalStatus::Approved),
        "rejected" => Ok(ApprovalStatus::Rejected),
        "expired" => Ok(ApprovalStatus::Expired),
        "executed" => Ok(ApprovalStatus::Executed),
        other => Err(api_err(
            ErrorKind::ValidationError,
            format!("field 'status': unknown value {other}"),
        )),
    }
}
