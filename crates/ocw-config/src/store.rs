// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sanitized persistent configuration.
//!
//! `config.json` carries operator-tunable, non-secret fields only. Runtime
//! guardrails (posture, bypass flags, proxy trust) live exclusively in the
//! environment: reads report them as diagnostics, writes that try to
//! persist them are rejected.

use crate::ConfigError;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Mutex;

/// Field names that may never be persisted to `config.json`.
pub const GUARDRAIL_FIELDS: &[&str] = &[
    "deployment_profile",
    "runtime_profile",
    "public_surface_ack",
    "trusted_proxies",
    "trust_xff",
    "allow_any_public_llm_host",
    "allow_insecure_base_url",
    "allow_remote_admin",
    "admin_token",
    "observability_token",
    "webhook_secret",
    "webhook_token",
    "bridge_device_token",
];

/// Key under which reads attach the guardrail diagnostic subobject.
const DIAGNOSTIC_KEY: &str = "runtime_guardrails";

/// Atomic-file config store.
pub struct ConfigStore {
    inner: Mutex<Map<String, Value>>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// In-memory store (tests).
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Map::new()),
            path: None,
        }
    }

    /// Store persisted at `path`, loading any existing file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Store`] on unreadable or unparseable data.
    pub fn at_path(path: PathBuf) -> Result<Self, ConfigError> {
        let map = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(Value::Object(map)) => map,
                Ok(_) => return Err(ConfigError::Store("config root must be an object".into())),
                Err(e) => return Err(ConfigError::Store(e.to_string())),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(ConfigError::Store(e.to_string())),
        };
        Ok(Self {
            inner: Mutex::new(map),
            path: Some(path),
        })
    }

    /// The sanitized config plus the guardrail diagnostic subobject.
    #[must_use]
    pub fn read(&self, guardrails: Value) -> Value {
        let inner = self.inner.lock().expect("config lock poisoned");
        let mut out = inner.clone();
        out.insert(DIAGNOSTIC_KEY.to_string(), guardrails);
        Value::Object(out)
    }

    /// Replace the persisted configuration.
    ///
    /// The diagnostic subobject is ignored when echoed back (so a read can
    /// be written verbatim); actual guardrail fields are rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::GuardrailWrite`] listing offending fields, or
    /// [`ConfigError::Store`] on IO failure.
    pub fn write(&self, value: Value) -> Result<(), ConfigError> {
        let Value::Object(mut map) = value else {
            return Err(ConfigError::Store("config body must be an object".into()));
        };
        map.remove(DIAGNOSTIC_KEY);

        let rejected: Vec<String> = map
            .keys()
            .filter(|k| GUARDRAIL_FIELDS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !rejected.is_empty() {
            return Err(ConfigError::GuardrailWrite { fields: rejected });
        }

        let mut inner = self.inner.lock().expect("config lock poisoned");
        *inner = map;
        self.persist_locked(&inner)
    }

    fn persist_locked(&self, inner: &Map<String, Value>) -> Result<(), ConfigError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&Value::Object(inner.clone()))
            .map_err(|e| ConfigError::Store(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes).map_err(|e| ConfigError::Store(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| ConfigError::Store(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guardrails() -> Value {
        serde_json::json!({"deployment_profile": "local", "trust_xff": false})
    }

    #[test]
    fn read_attaches_diagnostics() {
        let store = ConfigStore::in_memory();
        let value = store.read(guardrails());
        assert_eq!(value["runtime_guardrails"]["deployment_profile"], "local");
    }

    #[test]
    fn read_write_read_is_stable() {
        let store = ConfigStore::in_memory();
        store
            .write(serde_json::json!({"default_template": "sdxl_basic"}))
            .unwrap();
        let first = store.read(guardrails());
        // Echo the read back through write; the diagnostic key is ignored.
        store.write(first.clone()).unwrap();
        let second = store.read(guardrails());
        assert_eq!(first, second);
    }

    #[test]
    fn guardrail_fields_are_rejected() {
        let store = ConfigStore::in_memory();
        let err = store
            .write(serde_json::json!({"deployment_profile": "public"}))
            .unwrap_err();
        match err {
            ConfigError::GuardrailWrite { fields } => {
                assert_eq!(fields, vec!["deployment_profile"]);
            }
            other => panic!("unexpected {other}"),
        }
        // Secrets can never be persisted either.
        assert!(store
            .write(serde_json::json!({"admin_token": "oops"}))
            .is_err());
    }

    #[test]
    fn persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = ConfigStore::at_path(path.clone()).unwrap();
        store
            .write(serde_json::json!({"default_template": "upscale"}))
            .unwrap();

        let reloaded = ConfigStore::at_path(path).unwrap();
        let value = reloaded.read(serde_json::json!({}));
        assert_eq!(value["default_template"], "upscale");
    }

    #[test]
    fn non_object_bodies_are_rejected() {
        let store = ConfigStore::in_memory();
        assert!(store.write(serde_json::json!([1, 2])).is_err());
        assert!(store.write(serde_json::json!("nope")).is_err());
    }
}
