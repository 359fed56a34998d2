// SPDX-License-Identifier: MIT OR Apache-2.0
//! Credential verification for the three auth classes.

use chrono::Utc;
use hmac::{Hmac, Mac};
use ocw_core::ErrorKind;
use ocw_idempotency::IdempotencyStore;
use sha2::Sha256;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew for signed webhook timestamps, in seconds.
const TIMESTAMP_SKEW_SECS: i64 = 300;

/// Webhook credential configuration.
#[derive(Debug, Clone, Default)]
pub enum WebhookAuth {
    /// No webhook credential configured.
    #[default]
    Unconfigured,
    /// Bearer token only.
    Bearer(String),
    /// HMAC signature only.
    Hmac(String),
    /// Either a bearer token or an HMAC signature is accepted.
    BearerOrHmac {
        /// Accepted bearer token.
        token: String,
        /// HMAC signing secret.
        secret: String,
    },
}

impl WebhookAuth {
    /// Whether any webhook credential is configured.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        !matches!(self, Self::Unconfigured)
    }
}

/// Resolved credential configuration for the HTTP surface.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    /// Admin (write) token.
    pub admin_token: Option<String>,
    /// Observability (read) token.
    pub observability_token: Option<String>,
    /// Webhook credentials.
    pub webhook: WebhookAuth,
    /// Allow admin writes from non-loopback peers (requires a token).
    pub allow_remote_admin: bool,
    /// Accept loopback admin requests that carry no Origin header.
    pub allow_no_origin_loopback: bool,
}

/// Per-request authentication material extracted by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RequestAuth {
    /// Whether the immediate peer is a loopback address.
    pub peer_is_loopback: bool,
    /// `Authorization: Bearer` value, if present.
    pub bearer: Option<String>,
    /// `Origin` header.
    pub origin: Option<String>,
    /// `Sec-Fetch-Site` header.
    pub sec_fetch_site: Option<String>,
    /// `X-Timestamp` header (unix seconds).
    pub timestamp: Option<String>,
    /// `X-Nonce` header.
    pub nonce: Option<String>,
    /// `X-Signature` header (hex HMAC).
    pub signature: Option<String>,
}

/// Authentication failure with its taxonomy kind.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct AuthError {
    /// Stable kind (AuthMissing, AuthInvalid, Forbidden, CsrfFailed).
    pub kind: ErrorKind,
    /// Redaction-safe detail.
    pub detail: String,
}

impl AuthError {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Constant-time byte-slice equality.
///
/// Length differences short-circuit; content comparison folds every byte so
/// timing does not reveal the first mismatching position.
#[must_use]
pub fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Verify an admin (write) credential.
///
/// With a token configured, the token decides — remotely only when
/// `allow_remote_admin` is set. Without a token, admin is loopback-only and
/// must additionally pass the browser-origin check.
///
/// # Errors
///
/// Returns the matching [`AuthError`] on refusal.
pub fn verify_admin(config: &AuthConfig, request: &RequestAuth) -> Result<(), AuthError> {
    match &config.admin_token {
        Some(token) => {
            let presented = request
                .bearer
                .as_deref()
                .ok_or_else(|| AuthError::new(ErrorKind::AuthMissing, "admin token required"))?;
            if !ct_eq(presented.as_bytes(), token.as_bytes()) {
                return Err(AuthError::new(ErrorKind::AuthInvalid, "admin token mismatch"));
            }
            if !request.peer_is_loopback && !config.allow_remote_admin {
                return Err(AuthError::new(
                    ErrorKind::Forbidden,
                    "remote admin disabled",
                ));
            }
            Ok(())
        }
        None => {
            if !request.peer_is_loopback {
                return Err(AuthError::new(
                    ErrorKind::AuthMissing,
                    "no admin token configured; loopback only",
                ));
            }
            check_browser_origin(config, request)
        }
    }
}

/// CSRF protection for tokenless loopback admin.
fn check_browser_origin(config: &AuthConfig, request: &RequestAuth) -> Result<(), AuthError> {
    if let Some(site) = request.sec_fetch_site.as_deref() {
        return match site {
            "same-origin" | "none" => Ok(()),
            _ => Err(AuthError::new(ErrorKind::CsrfFailed, "cross-site request")),
        };
    }
    match request.origin.as_deref() {
        Some(origin) => {
            let loopback_origin = origin.contains("://127.0.0.1")
                || origin.contains("://localhost")
                || origin.contains("://[::1]");
            if loopback_origin {
                Ok(())
            } else {
                Err(AuthError::new(ErrorKind::CsrfFailed, "foreign origin"))
            }
        }
        None if config.allow_no_origin_loopback => Ok(()),
        None => Err(AuthError::new(
            ErrorKind::CsrfFailed,
            "origin required for tokenless admin",
        )),
    }
}

/// Verify an observability (read) credential.
///
/// Loopback reads are always allowed; off-box reads need the token when one
/// is configured and are refused when none is.
///
/// # Errors
///
/// Returns the matching [`AuthError`] on refusal.
pub fn verify_observability(config: &AuthConfig, request: &RequestAuth) -> Result<(), AuthError> {
    if request.peer_is_loopback {
        return Ok(());
    }
    match &config.observability_token {
        Some(token) => {
            let presented = request.bearer.as_deref().ok_or_else(|| {
                AuthError::new(ErrorKind::AuthMissing, "observability token required")
            })?;
            if ct_eq(presented.as_bytes(), token.as_bytes()) {
                Ok(())
            } else {
                Err(AuthError::new(
                    ErrorKind::AuthInvalid,
                    "observability token mismatch",
                ))
            }
        }
        None => Err(AuthError::new(
            ErrorKind::AuthMissing,
            "observability reads are loopback-only without a token",
        )),
    }
}

/// Compute the webhook signature for the canonical signed string.
#[must_use]
pub fn webhook_signature(
    secret: &str,
    method: &str,
    path: &str,
    timestamp: &str,
    nonce: &str,
    body: &[u8],
) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(method.as_bytes());
    mac.update(path.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(nonce.as_bytes());
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write as _;
        let _ = write!(out, "{b:02x}");
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Verify a webhook credential (bearer, HMAC, or either).
///
/// HMAC verification checks timestamp skew, consumes the nonce through the
/// idempotency store (replay suppression), and compares signatures in
/// constant time.
///
/// # Errors
///
/// Returns the matching [`AuthError`] on refusal.
pub fn verify_webhook(
    config: &AuthConfig,
    request: &RequestAuth,
    method: &str,
    path: &str,
    body: &[u8],
    nonces: &IdempotencyStore,
) -> Result<(), AuthError> {
    match &config.webhook {
        WebhookAuth::Unconfigured => Err(AuthError::new(
            ErrorKind::AuthMissing,
            "no webhook credential configured",
        )),
        WebhookAuth::Bearer(token) => verify_webhook_bearer(token, request),
        WebhookAuth::Hmac(secret) => {
            verify_webhook_hmac(secret, request, method, path, body, nonces)
        }
        WebhookAuth::BearerOrHmac { token, secret } => {
            if request.bearer.is_some() {
                verify_webhook_bearer(token, request)
            } else {
                verify_webhook_hmac(secret, request, method, path, body, nonces)
            }
        }
    }
}

fn verify_webhook_bearer(token: &str, request: &RequestAuth) -> Result<(), AuthError> {
    let presented = request
        .bearer
        .as_deref()
        .ok_or_else(|| AuthError::new(ErrorKind::AuthMissing, "webhook token required"))?;
    if ct_eq(presented.as_bytes(), token.as_bytes()) {
        Ok(())
    } else {
        Err(AuthError::new(ErrorKind::AuthInvalid, "webhook token mismatch"))
    }
}

fn verify_webhook_hmac(
    secret: &str,
    request: &RequestAuth,
    method: &str,
    path: &str,
    body: &[u8],
    nonces: &IdempotencyStore,
) -> Result<(), AuthError> {
    let timestamp = request
        .timestamp
        .as_deref()
        .ok_or_else(|| AuthError::new(ErrorKind::AuthMissing, "X-Timestamp required"))?;
    let nonce = request
        .nonce
        .as_deref()
        .ok_or_else(|| AuthError::new(ErrorKind::AuthMissing, "X-Nonce required"))?;
    let signature = request
        .signature
        .as_deref()
        .ok_or_else(|| AuthError::new(ErrorKind::AuthMissing, "X-Signature required"))?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AuthError::new(ErrorKind::AuthInvalid, "bad timestamp"))?;
    let now = Utc::now().timestamp();
    if (now - ts).abs() > TIMESTAMP_SKEW_SECS {
        return Err(AuthError::new(ErrorKind::AuthInvalid, "timestamp outside window"));
    }

    let expected = webhook_signature(secret, method, path, timestamp, nonce, body);
    let presented = hex_decode(signature)
        .ok_or_else(|| AuthError::new(ErrorKind::AuthInvalid, "signature not hex"))?;
    let expected_bytes = hex_decode(&expected).unwrap_or_default();
    if !ct_eq(&presented, &expected_bytes) {
        return Err(AuthError::new(ErrorKind::AuthInvalid, "signature mismatch"));
    }

    // Consume the nonce only after the signature checks out, so garbage
    // requests cannot burn legitimate nonces.
    if !nonces.consume_nonce(nonce) {
        debug!(nonce, "webhook nonce replayed");
        return Err(AuthError::new(ErrorKind::AuthInvalid, "nonce replayed"));
    }
    Ok(())
}
