// SPDX-License-Identifier: MIT OR Apache-2.0
//! Closed trace event vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The closed set of trace event kinds.
///
/// Every pipeline stage, the callback watcher, and the failover layer emit
/// exactly these kinds; nothing else lands on a trace timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A request entered the admission pipeline.
    Admit,
    /// Caller identity resolved successfully.
    AuthOk,
    /// Caller identity failed to resolve.
    AuthFail,
    /// A duplicate idempotency key short-circuited admission.
    DedupeHit,
    /// Template rendered (payload carries the byte size).
    TemplateRender,
    /// Rendered workflow submitted to the render engine.
    Submit,
    /// The render engine reported the job complete.
    HistoryReady,
    /// Callback delivery succeeded.
    DeliverOk,
    /// A callback delivery attempt failed.
    DeliverFail,
    /// A provider entered cooldown.
    Cooldown,
    /// A concurrent retry was coalesced by storm control.
    StormDrop,
    /// Incremental assist output.
    StreamDelta,
    /// Authoritative assist output.
    StreamFinal,
    /// Subscriber overflow marker (payload carries `dropped`).
    Dropped,
    /// Any other failure attributed to this trace.
    Error,
}

impl EventKind {
    /// Stable `snake_case` name, as used on the wire and in filters.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admit => "admit",
            Self::AuthOk => "auth_ok",
            Self::AuthFail => "auth_fail",
            Self::DedupeHit => "dedupe_hit",
            Self::TemplateRender => "template_render",
            Self::Submit => "submit",
            Self::HistoryReady => "history_ready",
            Self::DeliverOk => "deliver_ok",
            Self::DeliverFail => "deliver_fail",
            Self::Cooldown => "cooldown",
            Self::StormDrop => "storm_drop",
            Self::StreamDelta => "stream_delta",
            Self::StreamFinal => "stream_final",
            Self::Dropped => "dropped",
            Self::Error => "error",
        }
    }

    /// Parse a filter string back into a kind.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let kind = match raw {
            "admit" => Self::Admit,
            "auth_ok" => Self::AuthOk,
            "auth_fail" => Self::AuthFail,
            "dedupe_hit" => Self::DedupeHit,
            "template_render" => Self::TemplateRender,
            "submit" => Self::Submit,
            "history_ready" => Self::HistoryReady,
            "deliver_ok" => Self::DeliverOk,
            "deliver_fail" => Self::DeliverFail,
            "cooldown" => Self::Cooldown,
            "storm_drop" => Self::StormDrop,
            "stream_delta" => Self::StreamDelta,
            "stream_final" => Self::StreamFinal,
            "dropped" => Self::Dropped,
            "error" => Self::Error,
            _ => return None,
        };
        Some(kind)
    }
}

/// A single entry on a trace timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    /// When the source operation completed.
    pub ts: DateTime<Utc>,
    /// Which stage emitted this event.
    pub kind: EventKind,
    /// Redacted, size-bounded payload.
    pub payload: serde_json::Value,
}

impl TraceEvent {
    /// Construct an event stamped with the current time.
    #[must_use]
    pub fn now(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            ts: Utc::now(),
            kind,
            payload,
        }
    }
}
