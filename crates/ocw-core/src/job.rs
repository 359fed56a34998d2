// SPDX-License-Identifier: MIT OR Apache-2.0
//! The canonical admission record and its building blocks.

use crate::TraceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Where an admission originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// External HTTP webhook.
    Webhook,
    /// Sidecar bridge submit.
    Bridge,
    /// Scheduler tick firing.
    Scheduler,
    /// Manual trigger fire.
    Trigger,
    /// Execution of an approved request.
    Approval,
    /// Admin-initiated submission.
    Admin,
}

impl Source {
    /// Stable name used in counters and trace payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Bridge => "bridge",
            Self::Scheduler => "scheduler",
            Self::Trigger => "trigger",
            Self::Approval => "approval",
            Self::Admin => "admin",
        }
    }
}

/// A single template input value.
///
/// The set is deliberately closed: scalars, strings, and one level of
/// bounded lists. Nested objects never reach a renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Bounded homogeneous list.
    List(Vec<InputValue>),
}

impl InputValue {
    /// Convert a raw JSON value, rejecting objects and nested lists.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Int(i))
                } else {
                    n.as_f64().map(Self::Float)
                }
            }
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            serde_json::Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match Self::from_json(item)? {
                        Self::List(_) => return None,
                        scalar => out.push(scalar),
                    }
                }
                Some(Self::List(out))
            }
            _ => None,
        }
    }

    /// Render this value into a JSON document slot.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => {
                serde_json::Value::Array(items.iter().map(Self::to_json).collect())
            }
        }
    }

    /// String form used for `{{placeholder}}` interpolation.
    #[must_use]
    pub fn render_string(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
            Self::List(items) => items
                .iter()
                .map(Self::render_string)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// How callback deliveries authenticate to their destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackAuthMode {
    /// No authentication header.
    #[default]
    None,
    /// `X-Signature` HMAC-SHA256 of the body.
    Hmac,
    /// `Authorization: Bearer` token.
    Bearer,
}

/// Outbound result-delivery destination attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackDescriptor {
    /// Destination URL (must pass the callback allowlist).
    pub url: String,
    /// Authentication mode for the delivery request.
    #[serde(default)]
    pub auth_mode: CallbackAuthMode,
    /// Name of the secret used for HMAC/bearer, resolved at delivery time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    /// Maximum delivery attempts.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base backoff between attempts, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

/// The canonical representation of a queued or pending render.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Stable hash of the normalized inputs.
    pub job_id: String,
    /// Template to render.
    pub template_id: String,
    /// Normalized template inputs (deterministic ordering).
    pub inputs: BTreeMap<String, InputValue>,
    /// Where the admission originated.
    pub source: Source,
    /// Correlation identifier.
    pub trace_id: TraceId,
    /// When the admission was accepted.
    pub requested_at: DateTime<Utc>,
    /// Optional result-delivery destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackDescriptor>,
    /// Approval this job was executed from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_ref: Option<String>,
}

impl JobSpec {
    /// Build a job spec, deriving `job_id` from the normalized inputs.
    #[must_use]
    pub fn new(
        template_id: impl Into<String>,
        inputs: BTreeMap<String, InputValue>,
        source: Source,
        trace_id: TraceId,
    ) -> Self {
        let template_id = template_id.into();
        let job_id = job_id_for(&template_id, &inputs);
        Self {
            job_id,
            template_id,
            inputs,
            source,
            trace_id,
            requested_at: Utc::now(),
            callback: None,
            approval_ref: None,
        }
    }
}

/// Stable job identifier: hex SHA-256 of the template id and the
/// deterministically-serialized inputs.
#[must_use]
pub fn job_id_for(template_id: &str, inputs: &BTreeMap<String, InputValue>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_id.as_bytes());
    hasher.update([0u8]);
    // BTreeMap iteration order makes this serialization canonical.
    let encoded = serde_json::to_vec(inputs).unwrap_or_default();
    hasher.update(&encoded);
    let digest = hasher.finalize();
    format!("j-{digest:x}")
}
