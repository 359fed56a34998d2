// SPDX-License-Identifier: MIT OR Apache-2.0
//! Bridge subtree: the sidecar-facing surface.
//!
//! Devices authenticate with a pinned token (plus a certificate
//! fingerprint when an mTLS terminator fronts the daemon) and carry a
//! scope set. All state-changing endpoints require an idempotency key.

use crate::middleware::{client_ip, idempotency_key, trace_from_headers};
use crate::pipeline::AdmissionRequest;
use crate::{ApiError, AppState, api_err};
use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use ocw_auth::ct_eq;
use ocw_core::{Envelope, ErrorKind, Source};
use ocw_gate::EndpointClass;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

type Peer = crate::middleware::PeerAddr;

/// Protocol version this daemon speaks.
pub const BRIDGE_PROTOCOL_VERSION: u32 = 1;

/// Scope strings a device may hold.
pub const SCOPE_SUBMIT: &str = "job:submit";
/// Delivery scope.
pub const SCOPE_DELIVER: &str = "delivery:send";

/// One registered device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeDevice {
    /// Stable device identifier.
    pub device_id: String,
    /// Bearer token for this device.
    pub token: String,
    /// Scopes the device may exercise.
    pub scopes: BTreeSet<String>,
    /// Pinned certificate fingerprint (hex SHA-256), when mTLS fronts us.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedDevices {
    devices: Vec<BridgeDevice>,
}

/// The device map, loaded once at startup.
#[derive(Debug, Default)]
pub struct BridgeDeviceMap {
    devices: Vec<BridgeDevice>,
    /// Require a pinned fingerprint to match on every request.
    require_fingerprint: bool,
}

impl BridgeDeviceMap {
    /// Load `bridge_tokens.json`, falling back to the single env token
    /// (full scopes) when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error string when the file exists but cannot be parsed.
    pub fn load(
        path: &Path,
        env_token: Option<&str>,
        require_fingerprint: bool,
    ) -> Result<Self, String> {
        let mut devices = match std::fs::read(path) {
            Ok(bytes) => {
                serde_json::from_slice::<PersistedDevices>(&bytes)
                    .map_err(|e| e.to_string())?
                    .devices
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.to_string()),
        };
        if devices.is_empty()
            && let Some(token) = env_token
        {
            devices.push(BridgeDevice {
                device_id: "default".into(),
                token: token.to_string(),
                scopes: [SCOPE_SUBMIT.to_string(), SCOPE_DELIVER.to_string()]
                    .into_iter()
                    .collect(),
                fingerprint: None,
            });
        }
        Ok(Self {
            devices,
            require_fingerprint,
        })
    }

    /// Resolve a device by token (constant-time) and fingerprint.
    #[must_use]
    pub fn authenticate(&self, token: &str, fingerprint: Option<&str>) -> Option<&BridgeDevice> {
        let device = self
            .devices
            .iter()
            .find(|d| ct_eq(d.token.as_bytes(), token.as_bytes()))?;
        if self.require_fingerprint || device.fingerprint.is_some() {
            let pinned = device.fingerprint.as_deref()?;
            let presented = fingerprint?;
            if !ct_eq(
                pinned.to_ascii_lowercase().as_bytes(),
                presented.to_ascii_lowercase().as_bytes(),
            ) {
                return None;
            }
        }
        Some(device)
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

fn device_for(
    state: &AppState,
    peer: Peer,
    headers: &HeaderMap,
    scope: Option<&str>,
) -> Result<BridgeDevice, ApiError> {
    let ip = client_ip(state, peer, headers);
    state
        .limiter
        .check(ip, EndpointClass::Bridge)
        .map_err(|e| ApiError(crate::pipeline::gate_error(e)))?;

    let token = headers
        .get("x-device-token")
        .or_else(|| headers.get("authorization"))
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v))
        .ok_or_else(|| api_err(ErrorKind::AuthMissing, "device token required"))?;
    let fingerprint = headers
        .get("x-client-cert-fingerprint")
        .and_then(|v| v.to_str().ok());

    let device = state
        .bridge_devices
        .authenticate(token, fingerprint)
        .ok_or_else(|| api_err(ErrorKind::AuthInvalid, "device not recognized"))?;

    if let Some(scope) = scope
        && !device.scopes.contains(scope)
    {
        return Err(api_err(
            ErrorKind::ScopeDenied,
            format!("device lacks scope {scope}"),
        ));
    }
    Ok(device.clone())
}

fn require_idempotency_key(headers: &HeaderMap) -> Result<String, ApiError> {
    idempotency_key(headers).ok_or_else(|| {
        api_err(
            ErrorKind::ValidationError,
            "field 'Idempotency-Key': required on bridge writes",
        )
    })
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct HandshakeBody {
    protocol_version: u32,
}

pub(crate) async fn post_handshake(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<HandshakeBody>,
) -> Result<Response, ApiError> {
    // Handshake needs a valid device but no specific scope.
    let device = device_for(&state, peer, &headers, None)?;

    // Version mismatch goes through the common error path so the conflict
    // envelope is shaped (and redacted) like every other refusal.
    if body.protocol_version != BRIDGE_PROTOCOL_VERSION {
        return Err(api_err(
            ErrorKind::Conflict,
            format!(
                "protocol {} unsupported; daemon speaks {}",
                body.protocol_version, BRIDGE_PROTOCOL_VERSION
            ),
        ));
    }

    Ok(Json(Envelope::ok(serde_json::json!({
        "protocol_version": BRIDGE_PROTOCOL_VERSION,
        "device_id": device.device_id,
        "scopes": device.scopes,
    })))
    .into_response())
}

pub(crate) async fn post_submit(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let device = device_for(&state, peer, &headers, Some(SCOPE_SUBMIT))?;
    let key = require_idempotency_key(&headers)?;

    let normalized = crate::normalize::normalize_body(&body).map_err(ApiError)?;
    let request = AdmissionRequest {
        source: Source::Bridge,
        template_id: normalized.template_id,
        inputs: normalized.inputs,
        callback: normalized.callback,
        idempotency_key: Some(key),
        trace_id: trace_from_headers(&headers),
        requested_by: format!("bridge:{}", device.device_id),
        dry_run: false,
    };
    let response = state.pipeline().admit(request).await.map_err(ApiError)?;
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Ok((status, Json(response.envelope)).into_response())
}

#[derive(Debug, Deserialize)]
pub(crate) struct DeliverBody {
    url: String,
    payload: serde_json::Value,
}

pub(crate) async fn post_deliver(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    Json(body): Json<DeliverBody>,
) -> Result<Response, ApiError> {
    let device = device_for(&state, peer, &headers, Some(SCOPE_DELIVER))?;
    let key = require_idempotency_key(&headers)?;

    // Bridge deliveries are idempotent like admissions.
    match state.idempotency.begin(&key) {
        ocw_idempotency::Begin::Done(prior) => {
            return Ok(Json(prior).into_response());
        }
        ocw_idempotency::Begin::InFlight => {
            return Err(api_err(
                ErrorKind::IdempotencyInFlight,
                "delivery with this key is in flight",
            ));
        }
        ocw_idempotency::Begin::Fresh => {}
    }

    let url = match reqwest::Url::parse(&body.url) {
        Ok(url) => url,
        Err(e) => {
            state.idempotency.abort(&key);
            return Err(api_err(
                ErrorKind::ValidationError,
                format!("field 'url': {e}"),
            ));
        }
    };
    let policy = state.pipeline().callback_policy();
    let client = ocw_safeio::policy_client(std::time::Duration::from_secs(15));
    let payload = serde_json::to_vec(&body.payload).unwrap_or_default();
    let request = ocw_safeio::OutboundRequest::post_json(url, payload);

    let result = ocw_safeio::open(&client, request, &policy, None).await;
    match result {
        Ok(response) if response.status().is_success() => {
            let envelope = serde_json::to_value(Envelope::ok(serde_json::json!({
                "delivered": true,
                "device_id": device.device_id,
            })))
            .unwrap_or_default();
            state.idempotency.commit(&key, envelope.clone());
            Ok(Json(envelope).into_response())
        }
        Ok(response) => {
            state.idempotency.abort(&key);
            Err(api_err(
                ErrorKind::SubmitFailed,
                format!("destination status {}", response.status()),
            ))
        }
        Err(ocw_safeio::SafeIoError::Blocked { reason }) => {
            state.idempotency.abort(&key);
            Err(api_err(ErrorKind::SsrfBlocked, reason))
        }
        Err(ocw_safeio::SafeIoError::Transport(detail)) => {
            state.idempotency.abort(&key);
            Err(api_err(ErrorKind::SubmitFailed, detail))
        }
    }
}

pub(crate) async fn get_health(
    State(state): State<Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let device = device_for(&state, peer, &headers, None)?;
    Ok(Json(Envelope::ok(serde_json::json!({
        "status": "ok",
        "device_id": device.device_id,
        "protocol_version": BRIDGE_PROTOCOL_VERSION,
    }))))
}

/// 503 for every bridge endpoint while the subsystem is disabled.
pub(crate) async fn disabled() -> ApiError {
    api_err(ErrorKind::Disabled, "bridge is disabled")
}

/// GET variant of [`disabled`].
pub(crate) async fn disabled_get() -> ApiError {
    api_err(ErrorKind::Disabled, "bridge is disabled")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(devices: Vec<BridgeDevice>, require_fp: bool) -> BridgeDeviceMap {
        BridgeDeviceMap {
            devices,
            require_fingerprint: require_fp,
        }
    }

    fn device(token: &str, scopes: &[&str], fingerprint: Option<&str>) -> BridgeDevice {
        BridgeDevice {
            device_id: "dev-1".into(),
            token: token.into(),
            scopes: scopes.iter().map(|s| (*s).to_string()).collect(),
            fingerprint: fingerprint.map(str::to_string),
        }
    }

    #[test]
    fn token_authenticates_device() {
        let devices = map(vec![device("tok-1", &[SCOPE_SUBMIT], None)], false);
        assert!(devices.authenticate("tok-1", None).is_some());
        assert!(devices.authenticate("tok-2", None).is_none());
    }

    #[test]
    fn pinned_fingerprint_is_enforced() {
        let devices = map(vec![device("tok-1", &[SCOPE_SUBMIT], Some("AABB"))], false);
        assert!(devices.authenticate("tok-1", Some("aabb")).is_some());
        assert!(devices.authenticate("tok-1", Some("ccdd")).is_none());
        assert!(devices.authenticate("tok-1", None).is_none());
    }

    #[test]
    fn require_fingerprint_rejects_unpinned_devices() {
        let devices = map(vec![device("tok-1", &[SCOPE_SUBMIT], None)], true);
        assert!(devices.authenticate("tok-1", Some("aabb")).is_none());
    }

    #[test]
    fn env_token_fallback_gets_full_scopes() {
        let dir = tempfile::tempdir().unwrap();
        let devices = BridgeDeviceMap::load(
            &dir.path().join("bridge_tokens.json"),
            Some("env-tok"),
            false,
        )
        .unwrap();
        let device = devices.authenticate("env-tok", None).unwrap();
        assert!(device.scopes.contains(SCOPE_SUBMIT));
        assert!(device.scopes.contains(SCOPE_DELIVER));
    }

    #[test]
    fn device_file_overrides_env_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge_tokens.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "devices": [{"device_id": "d1", "token": "file-tok", "scopes": ["job:submit"]}]
            })
            .to_string(),
        )
        .unwrap();
        let devices = BridgeDeviceMap::load(&path, Some("env-tok"), false).unwrap();
        assert!(devices.authenticate("file-tok", None).is_some());
        assert!(devices.authenticate("env-tok", None).is_none());
    }
}
