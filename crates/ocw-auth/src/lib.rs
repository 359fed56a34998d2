// SPDX-License-Identifier: MIT OR Apache-2.0
//! Authentication and deployment posture.
//!
//! Three distinct auth classes guard the HTTP surface: admin (writes),
//! observability (reads from off-box), and webhook (bearer and/or HMAC).
//! The posture gate evaluates the locked [`PostureSnapshot`] at startup and
//! fails closed in hardened/public deployments.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod gate;
mod verify;

pub use gate::{PostureSnapshot, PostureViolation, check_posture};
pub use verify::{
    AuthConfig, AuthError, RequestAuth, WebhookAuth, ct_eq, verify_admin, verify_observability,
    verify_webhook, webhook_signature,
};

use serde::{Deserialize, Serialize};

/// Deployment posture label; gates which features may start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentProfile {
    /// Single-host, loopback-only use.
    #[default]
    Local,
    /// Trusted LAN exposure.
    Lan,
    /// Internet-facing; every control is mandatory.
    Public,
}

/// Runtime hardening level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeProfile {
    /// Development-friendly defaults.
    #[default]
    Minimal,
    /// Fail-closed posture checks, mandatory credentials.
    Hardened,
}
