// SPDX-License-Identifier: MIT OR Apache-2.0
//! Failure classification and reset-hint parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broad family of a provider failure; decides cooldown and failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Credential rejected. Long cooldown; retrying the same key is useless.
    Auth,
    /// Billing / quota exhausted. Long cooldown.
    Billing,
    /// 429. Cooldown from the reset hint; storm-control window opens.
    RateLimit,
    /// Request or connect timeout. Short cooldown.
    Timeout,
    /// Other 4xx. No cooldown, no failover — the request itself is wrong.
    InvalidRequest,
    /// 5xx. Medium cooldown with jitter.
    ServerError,
}

impl FailureClass {
    /// Whether the router should try the next candidate.
    #[must_use]
    pub fn fails_over(&self) -> bool {
        !matches!(self, Self::InvalidRequest)
    }

    /// Base cooldown for this class, before reset hints.
    #[must_use]
    pub fn base_cooldown(&self) -> Duration {
        match self {
            Self::Auth | Self::Billing => Duration::from_secs(15 * 60),
            Self::RateLimit => Duration::from_secs(60),
            Self::Timeout => Duration::from_secs(30),
            Self::ServerError => Duration::from_secs(60),
            Self::InvalidRequest => Duration::ZERO,
        }
    }
}

/// Classify a provider response from status code and body hints.
#[must_use]
pub fn classify_response(status: u16, body: &str) -> FailureClass {
    let body_lower = body.to_ascii_lowercase();
    match status {
        401 | 403 => FailureClass::Auth,
        402 => FailureClass::Billing,
        429 => {
            if body_lower.contains("quota") || body_lower.contains("billing") {
                FailureClass::Billing
            } else {
                FailureClass::RateLimit
            }
        }
        408 | 504 => FailureClass::Timeout,
        s if (500..600).contains(&s) => FailureClass::ServerError,
        _ => {
            if body_lower.contains("insufficient_quota") {
                FailureClass::Billing
            } else {
                FailureClass::InvalidRequest
            }
        }
    }
}

/// Extract the provider's reset hint from headers and body.
///
/// Recognizes `Retry-After` (seconds or HTTP-date), the
/// `x-ratelimit-reset*` family (seconds, milliseconds, or epoch), and a
/// plain `"retry_after": N` body field.
#[must_use]
pub fn parse_retry_after(headers: &[(String, String)], body: &str) -> Option<Duration> {
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if name == "retry-after" {
            if let Some(d) = parse_retry_after_value(value) {
                return Some(d);
            }
        }
        if name.starts_with("x-ratelimit-reset") {
            if let Some(d) = parse_reset_value(value) {
                return Some(d);
            }
        }
    }
    // Body hint: {"retry_after": 20} or {"error": {"retry_after_secs": 20}}.
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(body) {
        for pointer in ["/retry_after", "/retry_after_secs", "/error/retry_after", "/error/retry_after_secs"] {
            if let Some(n) = json.pointer(pointer).and_then(|v| v.as_f64()) {
                return Some(Duration::from_secs_f64(n.max(0.0)));
            }
        }
    }
    None
}

fn parse_retry_after_value(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date form.
    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    delta.to_std().ok()
}

fn parse_reset_value(value: &str) -> Option<Duration> {
    let value = value.trim();
    // Forms seen in the wild: "20", "20.5", "20s", "2000ms", epoch seconds.
    if let Some(ms) = value.strip_suffix("ms") {
        return ms.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(s) = value.strip_suffix('s') {
        return s.parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    let n = value.parse::<f64>().ok()?;
    let now_epoch = Utc::now().timestamp() as f64;
    if n > now_epoch {
        // Epoch timestamp; convert to a delta.
        return Some(Duration::from_secs_f64((n - now_epoch).max(0.0)));
    }
    Some(Duration::from_secs_f64(n.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn status_classification_table() {
        assert_eq!(classify_response(401, ""), FailureClass::Auth);
        assert_eq!(classify_response(403, ""), FailureClass::Auth);
        assert_eq!(classify_response(402, ""), FailureClass::Billing);
        assert_eq!(classify_response(429, ""), FailureClass::RateLimit);
        assert_eq!(classify_response(408, ""), FailureClass::Timeout);
        assert_eq!(classify_response(500, ""), FailureClass::ServerError);
        assert_eq!(classify_response(503, ""), FailureClass::ServerError);
        assert_eq!(classify_response(400, ""), FailureClass::InvalidRequest);
        assert_eq!(classify_response(422, ""), FailureClass::InvalidRequest);
    }

    #[test]
    fn quota_429_is_billing() {
        assert_eq!(
            classify_response(429, r#"{"error": "monthly quota exceeded"}"#),
            FailureClass::Billing
        );
    }

    #[test]
    fn invalid_request_never_fails_over() {
        assert!(!FailureClass::InvalidRequest.fails_over());
        assert!(FailureClass::RateLimit.fails_over());
        assert!(FailureClass::Auth.fails_over());
    }

    #[test]
    fn retry_after_seconds() {
        let d = parse_retry_after(&headers(&[("Retry-After", "60")]), "").unwrap();
        assert_eq!(d, Duration::from_secs(60));
    }

    #[test]
    fn retry_after_http_date() {
        let when = (Utc::now() + chrono::Duration::seconds(90)).to_rfc2822();
        let d = parse_retry_after(&headers(&[("retry-after", &when)]), "").unwrap();
        assert!(d > Duration::from_secs(80) && d < Duration::from_secs(100));
    }

    #[test]
    fn ratelimit_reset_variants() {
        assert_eq!(
            parse_retry_after(&headers(&[("x-ratelimit-reset-requests", "20s")]), ""),
            Some(Duration::from_secs(20))
        );
        assert_eq!(
            parse_retry_after(&headers(&[("x-ratelimit-reset", "1500ms")]), ""),
            Some(Duration::from_millis(1500))
        );
        let epoch = (Utc::now().timestamp() + 45).to_string();
        let d = parse_retry_after(&headers(&[("x-ratelimit-reset", &epoch)]), "").unwrap();
        assert!(d > Duration::from_secs(40) && d <= Duration::from_secs(46));
    }

    #[test]
    fn body_reset_hint() {
        let d = parse_retry_after(&[], r#"{"error": {"retry_after_secs": 12}}"#).unwrap();
        assert_eq!(d, Duration::from_secs(12));
    }

    #[test]
    fn no_hint_is_none() {
        assert_eq!(parse_retry_after(&[], "not json"), None);
        assert_eq!(parse_retry_after(&headers(&[("x-other", "1")]), "{}"), None);
    }
}
