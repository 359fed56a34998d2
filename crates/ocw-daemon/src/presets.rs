// SPDX-License-Identifier: MIT OR Apache-2.0
//! Saved presets: named input bundles for templates.

use crate::api::{guard_admin, guard_read};
use crate::{ApiError, AppState, api_err};
use axum::Json;
use axum::extract::{Path as AxPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use ocw_core::{Envelope, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

type Peer = crate::middleware::PeerAddr;

/// One saved preset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    /// Template the inputs belong to.
    pub template_id: String,
    /// Saved inputs (raw JSON; validated at admission time).
    pub inputs: serde_json::Value,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedPresets {
    presets: BTreeMap<String, Preset>,
}

/// Atomic-file preset store.
pub struct PresetStore {
    inner: Mutex<BTreeMap<String, Preset>>,
    path: Option<PathBuf>,
}

impl PresetStore {
    /// In-memory store (tests).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Store persisted at `path`, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error string when the file exists but cannot be parsed.
    pub fn at_path(path: PathBuf) -> Result<Self, String> {
        let presets = match std::fs::read(&path) {
            Ok(bytes) => {
                serde_json::from_slice::<PersistedPresets>(&bytes)
                    .map_err(|e| e.to_string())?
                    .presets
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.to_string()),
        };
        Ok(Self {
            inner: Mutex::new(presets),
            path: Some(path),
        })
    }

    /// Names of all presets.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("preset lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Fetch one preset.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Preset> {
        self.inner
            .lock()
            .expect("preset lock poisoned")
            .get(name)
            .cloned()
    }

    /// Insert or replace. Returns `true` when the preset was new.
    pub fn put(&self, name: &str, preset: Preset) -> Result<bool, String> {
        let mut inner = self.inner.lock().expect("preset lock poisoned");
        let created = inner.insert(name.to_string(), preset).is_none();
        self.persist_locked(&inner)?;
        Ok(created)
    }

    /// Delete by name. Returns `false` when absent.
    pub fn delete(&self, name: &str) -> Result<bool, String> {
        let mut inner = self.inner.lock().expect("preset lock poisoned");
        let removed = inner.remove(name).is_some();
        if removed {
            self.persist_locked(&inner)?;
        }
        Ok(removed)
    }

    fn persist_locked(&self, inner: &BTreeMap<String, Preset>) -> Result<(), String> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let snapshot = PersistedPresets {
            presets: inner.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| e.to_string())?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| e.to_string())?;
        std::fs::rename(&tmp, path).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Read guard honoring the presets-public-read flag.
fn guard_preset_read(state: &AppState, peer: Peer, headers: &HeaderMap) -> Result<(), ApiError> {
    if state.settings.presets_public_read {
        return Ok(());
    }
    guard_read(state, peer, headers)
}

pub(crate) async fn list_presets(
    State(state): State<std::sync::Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    guard_preset_read(&state, peer, &headers)?;
    Ok(Json(Envelope::ok(serde_json::json!({
        "presets": state.presets.names(),
    }))))
}

pub(crate) async fn get_preset(
    State(state): State<std::sync::Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(name): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_preset_read(&state, peer, &headers)?;
    let preset = state
        .presets
        .get(&name)
        .ok_or_else(|| api_err(ErrorKind::NotFound, format!("preset not found: {name}")))?;
    Ok(Json(Envelope::ok(
        serde_json::to_value(preset).unwrap_or_default(),
    )))
}

pub(crate) async fn put_preset(
    State(state): State<std::sync::Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(name): AxPath<String>,
    Json(preset): Json<Preset>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    state
        .templates
        .get(&preset.template_id)
        .map_err(|_| {
            api_err(
                ErrorKind::TemplateDenied,
                format!("template not allowed: {}", preset.template_id),
            )
        })?;
    let created = state
        .presets
        .put(&name, preset)
        .map_err(|e| api_err(ErrorKind::Internal, e))?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(Envelope::ok(serde_json::json!({"name": name})))))
}

pub(crate) async fn delete_preset(
    State(state): State<std::sync::Arc<AppState>>,
    peer: Peer,
    headers: HeaderMap,
    AxPath(name): AxPath<String>,
) -> Result<impl IntoResponse, ApiError> {
    guard_admin(&state, peer, &headers)?;
    let removed = state
        .presets
        .delete(&name)
        .map_err(|e| api_err(ErrorKind::Internal, e))?;
    if !removed {
        return Err(api_err(ErrorKind::NotFound, format!("preset not found: {name}")));
    }
    Ok(Json(Envelope::ok_empty()))
}
