// SPDX-License-Identifier: MIT OR Apache-2.0
//! Webhook ingestion: authenticated submissions and dry-run validation.

use crate::middleware::{client_ip, idempotency_key, request_auth, trace_from_headers};
use crate::pipeline::AdmissionRequest;
use crate::{ApiError, AppState, api_err};
use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ocw_core::{ErrorKind, Source};
use ocw_gate::EndpointClass;
use std::sync::Arc;

type Peer = crate::middleware::PeerAddr;

fn respond(response: crate::pipeline::AdmissionResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(response.envelope)).into_response()
}

/// Authenticate the webhook caller and parse the body. The raw bytes are
/// needed for HMAC verification, so this handler takes `Bytes` rather than
/// a typed JSON extractor.
fn authenticate(
    state: &AppState,
    peer: Peer,
    headers: &HeaderMap,
    path: &str,
    body: &Bytes,
) -> Result<serde_json::Value, ApiError> {
    let ip = client_ip(state, peer, headers);
    state
        .limiter
        .check(ip, EndpointClass::Webhook)
        .map_err(|e| ApiError(crate::pipeline::gate_error(e)))?;

    let auth = request_auth(ip, headers);
    ocw_auth::verify_webhook(
        &state.settings.auth,
        &auth,
        "POST",
        path,
        body,
        &state.idempotency,
    )
    .map_err(|e| api_err(e.kind, e.detail))?;

    serde_json::from_slice(body)
        .map_err(|e| api_err(ErrorKind::ValidationError, format!("body: {e}")))
}

pub(crate) async fn post_webhook(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let trace_id = trace_from_headers(&headers);
    let pipeline = state.pipeline();

    let raw = match authenticate(&state, peer, &headers, uri.path(), &body) {
        Ok(raw) => raw,
        Err(err) => {
            if matches!(
                err.0.kind(),
                ErrorKind::AuthMissing | ErrorKind::AuthInvalid
            ) {
                pipeline.record_auth_failure(&trace_id, err.0.detail());
            }
            return Err(err);
        }
    };

    let normalized = crate::normalize::normalize_body(&raw).map_err(ApiError)?;
    let request = AdmissionRequest {
        source: Source::Webhook,
        template_id: normalized.template_id,
        inputs: normalized.inputs,
        callback: normalized.callback,
        idempotency_key: idempotency_key(&headers).or(normalized.idempotency_key),
        trace_id,
        requested_by: "webhook".into(),
        dry_run: false,
    };
    let response = pipeline.admit(request).await.map_err(ApiError)?;
    Ok(respond(response))
}

pub(crate) async fn post_webhook_validate(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let trace_id = trace_from_headers(&headers);
    let raw = authenticate(&state, peer, &headers, uri.path(), &body)?;
    let normalized = crate::normalize::normalize_body(&raw).map_err(ApiError)?;

    let request = AdmissionRequest {
        source: Source::Webhook,
        template_id: normalized.template_id,
        inputs: normalized.inputs,
        callback: normalized.callback,
        idempotency_key: None,
        trace_id,
        requested_by: "webhook".into(),
        dry_run: true,
    };
    let response = state.pipeline().validate_only(request).await.map_err(ApiError)?;
    Ok(respond(response))
}
