// SPDX-License-Identifier: MIT OR Apache-2.0
//! Core data model for the OpenClaw control plane.
//!
//! This crate defines the canonical types shared by every other workspace
//! member: trace identifiers, the [`JobSpec`] admission record, the closed
//! trace [`EventKind`] set, the wire [`Envelope`], and the stable
//! [`ErrorKind`] taxonomy with its HTTP mapping.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod event;
mod job;

pub use error::{ErrorKind, OcwError, RetryHint};
pub use event::{EventKind, TraceEvent};
pub use job::{CallbackAuthMode, CallbackDescriptor, InputValue, JobSpec, Source, job_id_for};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Correlation identifier threaded through every admission.
///
/// Minted by the pipeline when the caller does not supply one via the
/// `X-Trace-Id` header. The string form is opaque to callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(pub String);

impl TraceId {
    /// Mint a fresh trace identifier.
    #[must_use]
    pub fn mint() -> Self {
        Self(format!("t-{}", Uuid::new_v4().simple()))
    }

    /// Wrap a caller-supplied identifier, rejecting empty or oversized input.
    #[must_use]
    pub fn from_header(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.len() > 128 {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Wire envelope
// ---------------------------------------------------------------------------

/// Uniform JSON response envelope for every HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// `true` on success, `false` when `error` is populated.
    pub ok: bool,
    /// Stable error kind tag (see [`ErrorKind`]).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable detail, already redacted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Trace identifier for joining logs to this response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<TraceId>,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    /// Successful envelope carrying `data`.
    #[must_use]
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
            trace_id: None,
            data: Some(data),
        }
    }

    /// Successful envelope with no payload.
    #[must_use]
    pub fn ok_empty() -> Self {
        Self {
            ok: true,
            error: None,
            detail: None,
            trace_id: None,
            data: None,
        }
    }

    /// Failure envelope for the given error.
    #[must_use]
    pub fn err(err: &OcwError) -> Self {
        Self {
            ok: false,
            error: Some(err.kind().wire_name().to_string()),
            detail: Some(err.detail().to_string()),
            trace_id: err.trace_id().cloned(),
            data: None,
        }
    }

    /// Attach a trace identifier.
    #[must_use]
    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_trace_ids_are_unique_and_prefixed() {
        let a = TraceId::mint();
        let b = TraceId::mint();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("t-"));
    }

    #[test]
    fn trace_id_from_header_trims_and_bounds() {
        assert_eq!(
            TraceId::from_header("  t-abc  ").unwrap().as_str(),
            "t-abc"
        );
        assert!(TraceId::from_header("").is_none());
        assert!(TraceId::from_header(&"x".repeat(200)).is_none());
    }

    #[test]
    fn ok_envelope_omits_error_fields() {
        let env = Envelope::ok(serde_json::json!({"prompt_id": "p-1"}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("error").is_none());
        assert_eq!(json["data"]["prompt_id"], "p-1");
    }

    #[test]
    fn err_envelope_carries_kind_and_trace() {
        let err = OcwError::new(ErrorKind::ValidationError, "seed out of range")
            .with_trace(TraceId("t-1".into()));
        let env = Envelope::err(&err);
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"], "validation_error");
        assert_eq!(json["trace_id"], "t-1");
    }
}
