// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stable error taxonomy shared across the control plane.
//!
//! Every client-visible failure carries an [`ErrorKind`] — a closed set of
//! machine-readable tags that map deterministically to HTTP statuses and a
//! retry hint. Raw error messages never cross the process boundary; the
//! `detail` string is what egresses, after redaction.

use crate::TraceId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ErrorKind
// ---------------------------------------------------------------------------

/// Machine-readable, stable error tag.
///
/// Each variant serialises to a `snake_case` wire name that is guaranteed
/// not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No credential was presented where one is required.
    AuthMissing,
    /// A credential was presented but failed verification.
    AuthInvalid,
    /// Authenticated caller is not allowed to perform the operation.
    Forbidden,
    /// A bridge device lacks the scope for this endpoint.
    ScopeDenied,
    /// Browser-origin check failed for a loopback admin request.
    CsrfFailed,
    /// Template input failed schema validation.
    ValidationError,
    /// The requested template is not on the allowlist.
    TemplateDenied,
    /// An outbound URL was rejected by the safe-IO policy.
    SsrfBlocked,
    /// The same idempotency key is currently being processed.
    IdempotencyInFlight,
    /// Rendered workflow exceeded the byte cap.
    PayloadTooLarge,
    /// A token bucket or provider rate limit refused the request.
    RateLimitExceeded,
    /// An in-flight concurrency cap refused the request.
    BudgetExceeded,
    /// The request was parked pending a human decision.
    ApprovalRequired,
    /// An approval transition was attempted out of graph order.
    ApprovalStateConflict,
    /// No LLM provider candidate is currently available.
    ProviderUnavailable,
    /// The render engine rejected or failed the queue submission.
    SubmitFailed,
    /// Callback delivery exhausted its retries.
    CallbackDeadLetter,
    /// A startup posture gate check failed (fatal, never served).
    PostureViolation,
    /// The requested resource does not exist.
    NotFound,
    /// Generic state conflict (version mismatch, duplicate name).
    Conflict,
    /// The subsystem is disabled by configuration.
    Disabled,
    /// Unexpected internal failure.
    Internal,
}

/// Whether (and how) a client should retry after this error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Do not retry; the same request will fail again.
    No,
    /// Retry after the indicated delay (carried as `Retry-After`).
    After(Duration),
    /// Poll the referenced resource instead of retrying.
    Poll,
}

impl ErrorKind {
    /// The stable `snake_case` wire name.
    #[must_use]
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth_missing",
            Self::AuthInvalid => "auth_invalid",
            Self::Forbidden => "forbidden",
            Self::ScopeDenied => "scope_denied",
            Self::CsrfFailed => "csrf_failed",
            Self::ValidationError => "validation_error",
            Self::TemplateDenied => "template_denied",
            Self::SsrfBlocked => "ssrf_blocked",
            Self::IdempotencyInFlight => "idempotency_in_flight",
            Self::PayloadTooLarge => "payload_too_large",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::BudgetExceeded => "budget_exceeded",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalStateConflict => "approval_state_conflict",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::SubmitFailed => "submit_failed",
            Self::CallbackDeadLetter => "callback_dead_letter",
            Self::PostureViolation => "posture_violation",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Disabled => "disabled",
            Self::Internal => "internal",
        }
    }

    /// HTTP status this kind maps to.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthMissing | Self::AuthInvalid => 401,
            Self::Forbidden | Self::ScopeDenied | Self::CsrfFailed | Self::TemplateDenied => 403,
            Self::ValidationError | Self::SsrfBlocked => 400,
            Self::IdempotencyInFlight | Self::ApprovalStateConflict | Self::Conflict => 409,
            Self::PayloadTooLarge => 413,
            Self::RateLimitExceeded | Self::BudgetExceeded => 429,
            Self::ApprovalRequired => 202,
            Self::ProviderUnavailable => 503,
            Self::SubmitFailed => 502,
            Self::NotFound => 404,
            Self::Disabled => 503,
            Self::CallbackDeadLetter | Self::PostureViolation | Self::Internal => 500,
        }
    }

    /// Default retry guidance when no live timing information applies.
    #[must_use]
    pub fn retry_hint(&self) -> RetryHint {
        match self {
            Self::IdempotencyInFlight => RetryHint::After(Duration::from_secs(1)),
            Self::RateLimitExceeded | Self::BudgetExceeded | Self::ProviderUnavailable => {
                RetryHint::After(Duration::from_secs(5))
            }
            Self::SubmitFailed => RetryHint::After(Duration::from_secs(2)),
            Self::ApprovalRequired => RetryHint::Poll,
            _ => RetryHint::No,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

// ---------------------------------------------------------------------------
// OcwError
// ---------------------------------------------------------------------------

/// Pipeline error carrying a stable kind, a redactable detail string, and
/// optional trace linkage plus a retry delay override.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct OcwError {
    kind: ErrorKind,
    detail: String,
    trace_id: Option<TraceId>,
    retry_after: Option<Duration>,
}

impl OcwError {
    /// Construct an error of the given kind.
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            trace_id: None,
            retry_after: None,
        }
    }

    /// Attach the trace this error belongs to.
    #[must_use]
    pub fn with_trace(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Override the retry delay (e.g. from a bucket reset or cooldown).
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// The stable kind tag.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable detail (pre-redaction).
    #[must_use]
    pub fn detail(&self) -> &str {
        &self.detail
    }

    /// Trace identifier, if attached.
    #[must_use]
    pub fn trace_id(&self) -> Option<&TraceId> {
        self.trace_id.as_ref()
    }

    /// Effective retry guidance, preferring the live override.
    #[must_use]
    pub fn retry_hint(&self) -> RetryHint {
        match self.retry_after {
            Some(delay) => RetryHint::After(delay),
            None => self.kind.retry_hint(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: &[ErrorKind] = &[
        ErrorKind::AuthMissing,
        ErrorKind::AuthInvalid,
        ErrorKind::Forbidden,
        ErrorKind::ScopeDenied,
        ErrorKind::CsrfFailed,
        ErrorKind::ValidationError,
        ErrorKind::TemplateDenied,
        ErrorKind::SsrfBlocked,
        ErrorKind::IdempotencyInFlight,
        ErrorKind::PayloadTooLarge,
        ErrorKind::RateLimitExceeded,
        ErrorKind::BudgetExceeded,
        ErrorKind::ApprovalRequired,
        ErrorKind::ApprovalStateConflict,
        ErrorKind::ProviderUnavailable,
        ErrorKind::SubmitFailed,
        ErrorKind::CallbackDeadLetter,
        ErrorKind::PostureViolation,
        ErrorKind::NotFound,
        ErrorKind::Conflict,
        ErrorKind::Disabled,
        ErrorKind::Internal,
    ];

    #[test]
    fn wire_names_match_serde() {
        for kind in ALL_KINDS {
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.wire_name()));
        }
    }

    #[test]
    fn wire_names_are_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for kind in ALL_KINDS {
            assert!(seen.insert(kind.wire_name()), "duplicate {kind}");
        }
    }

    #[test]
    fn status_table_spot_checks() {
        assert_eq!(ErrorKind::AuthMissing.http_status(), 401);
        assert_eq!(ErrorKind::CsrfFailed.http_status(), 403);
        assert_eq!(ErrorKind::SsrfBlocked.http_status(), 400);
        assert_eq!(ErrorKind::PayloadTooLarge.http_status(), 413);
        assert_eq!(ErrorKind::BudgetExceeded.http_status(), 429);
        assert_eq!(ErrorKind::ApprovalRequired.http_status(), 202);
        assert_eq!(ErrorKind::SubmitFailed.http_status(), 502);
        assert_eq!(ErrorKind::ProviderUnavailable.http_status(), 503);
        assert_eq!(ErrorKind::IdempotencyInFlight.http_status(), 409);
    }

    #[test]
    fn retryable_kinds_carry_delays() {
        assert!(matches!(
            ErrorKind::RateLimitExceeded.retry_hint(),
            RetryHint::After(_)
        ));
        assert_eq!(ErrorKind::ValidationError.retry_hint(), RetryHint::No);
        assert_eq!(ErrorKind::ApprovalRequired.retry_hint(), RetryHint::Poll);
    }

    #[test]
    fn live_retry_after_overrides_default() {
        let err = OcwError::new(ErrorKind::RateLimitExceeded, "bucket drained")
            .with_retry_after(Duration::from_secs(42));
        assert_eq!(err.retry_hint(), RetryHint::After(Duration::from_secs(42)));
    }
}
