// SPDX-License-Identifier: MIT OR Apache-2.0
//! Fail-closed startup posture gate.
//!
//! The snapshot is taken once at startup and never mutated; the gate runs
//! against it before route registration. Any violation in a hardened or
//! public posture aborts startup deterministically — the process never
//! serves a partial surface.

use crate::verify::AuthConfig;
use crate::{DeploymentProfile, RuntimeProfile};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::error;

/// Process-wide immutable posture snapshot.
#[derive(Debug, Clone, Default)]
pub struct PostureSnapshot {
    /// Deployment profile label.
    pub profile: DeploymentProfile,
    /// Runtime hardening level.
    pub runtime_profile: RuntimeProfile,
    /// Resolved credential configuration.
    pub auth: AuthConfig,
    /// Bridge subsystem enabled.
    pub bridge_enabled: bool,
    /// Bridge device token configured.
    pub bridge_token_configured: bool,
    /// mTLS bundle paths configured for the bridge.
    pub bridge_mtls_configured: bool,
    /// Any-public-LLM-host bypass flag.
    pub allow_any_public_llm_host: bool,
    /// Insecure (http) base-URL bypass flag.
    pub allow_insecure_base_url: bool,
    /// Callback allowlist has at least one entry.
    pub callback_allowlist_configured: bool,
    /// A chat connector is active.
    pub connector_active: bool,
    /// Operator acknowledged the shared public surface.
    pub public_surface_acknowledged: bool,
}

/// One fail-closed check that did not hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "violation")]
pub enum PostureViolation {
    /// Hardened/public posture without an admin token.
    MissingAdminCredential,
    /// Hardened/public posture without webhook credentials.
    MissingWebhookCredential,
    /// A safety bypass flag is set in a hardened/public posture.
    BypassFlagEnabled {
        /// Which flag.
        flag: String,
    },
    /// A connector is active but no callback allowlist is configured.
    ConnectorWithoutAllowlist,
    /// Public profile without the shared-surface acknowledgement.
    PublicWithoutAcknowledgement,
    /// Bridge enabled in public profile without an mTLS bundle.
    BridgeWithoutMtls,
    /// Bridge enabled without a device token.
    BridgeWithoutToken,
}

impl fmt::Display for PostureViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingAdminCredential => write!(f, "admin credential missing"),
            Self::MissingWebhookCredential => write!(f, "webhook credential missing"),
            Self::BypassFlagEnabled { flag } => write!(f, "bypass flag enabled: {flag}"),
            Self::ConnectorWithoutAllowlist => {
                write!(f, "connector active without callback allowlist")
            }
            Self::PublicWithoutAcknowledgement => {
                write!(f, "public profile without shared-surface acknowledgement")
            }
            Self::BridgeWithoutMtls => write!(f, "bridge enabled in public profile without mTLS"),
            Self::BridgeWithoutToken => write!(f, "bridge enabled without a device token"),
        }
    }
}

/// Evaluate every posture check against the snapshot.
///
/// An empty result means the process may serve. Violations are logged as
/// they are found; the caller decides fatality (hardened/public: always).
#[must_use]
pub fn check_posture(snapshot: &PostureSnapshot) -> Vec<PostureViolation> {
    let mut violations = Vec::new();
    let strict = snapshot.runtime_profile == RuntimeProfile::Hardened
        || snapshot.profile == DeploymentProfile::Public;

    if strict {
        if snapshot.auth.admin_token.is_none() {
            violations.push(PostureViolation::MissingAdminCredential);
        }
        if !snapshot.auth.webhook.is_configured() {
            violations.push(PostureViolation::MissingWebhookCredential);
        }
        if snapshot.allow_any_public_llm_host {
            violations.push(PostureViolation::BypassFlagEnabled {
                flag: "allow_any_public_llm_host".into(),
            });
        }
        if snapshot.allow_insecure_base_url {
            violations.push(PostureViolation::BypassFlagEnabled {
                flag: "allow_insecure_base_url".into(),
            });
        }
        if snapshot.connector_active && !snapshot.callback_allowlist_configured {
            violations.push(PostureViolation::ConnectorWithoutAllowlist);
        }
    }

    if snapshot.profile == DeploymentProfile::Public {
        if !snapshot.public_surface_acknowledged {
            violations.push(PostureViolation::PublicWithoutAcknowledgement);
        }
        if snapshot.bridge_enabled && !snapshot.bridge_mtls_configured {
            violations.push(PostureViolation::BridgeWithoutMtls);
        }
    }

    if snapshot.bridge_enabled && !snapshot.bridge_token_configured {
        violations.push(PostureViolation::BridgeWithoutToken);
    }

    for violation in &violations {
        error!(%violation, "posture gate violation");
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::WebhookAuth;

    fn hardened_with_creds() -> PostureSnapshot {
        PostureSnapshot {
            runtime_profile: RuntimeProfile::Hardened,
            auth: AuthConfig {
                admin_token: Some("adm".into()),
                webhook: WebhookAuth::Bearer("tok".into()),
                ..AuthConfig::default()
            },
            ..PostureSnapshot::default()
        }
    }

    #[test]
    fn minimal_local_posture_passes_empty() {
        assert!(check_posture(&PostureSnapshot::default()).is_empty());
    }

    #[test]
    fn hardened_requires_credentials() {
        let snapshot = PostureSnapshot {
            runtime_profile: RuntimeProfile::Hardened,
            ..PostureSnapshot::default()
        };
        let violations = check_posture(&snapshot);
        assert!(violations.contains(&PostureViolation::MissingAdminCredential));
        assert!(violations.contains(&PostureViolation::MissingWebhookCredential));
    }

    #[test]
    fn hardened_with_credentials_passes() {
        assert!(check_posture(&hardened_with_creds()).is_empty());
    }

    #[test]
    fn bypass_flags_fail_closed_in_hardened() {
        let mut snapshot = hardened_with_creds();
        snapshot.allow_any_public_llm_host = true;
        snapshot.allow_insecure_base_url = true;
        let violations = check_posture(&snapshot);
        assert_eq!(
            violations
                .iter()
                .filter(|v| matches!(v, PostureViolation::BypassFlagEnabled { .. }))
                .count(),
            2
        );
    }

    #[test]
    fn bypass_flags_tolerated_in_minimal_local() {
        let snapshot = PostureSnapshot {
            allow_any_public_llm_host: true,
            ..PostureSnapshot::default()
        };
        assert!(check_posture(&snapshot).is_empty());
    }

    #[test]
    fn public_requires_acknowledgement_and_bridge_mtls() {
        let mut snapshot = hardened_with_creds();
        snapshot.profile = DeploymentProfile::Public;
        snapshot.bridge_enabled = true;
        snapshot.bridge_token_configured = true;
        let violations = check_posture(&snapshot);
        assert!(violations.contains(&PostureViolation::PublicWithoutAcknowledgement));
        assert!(violations.contains(&PostureViolation::BridgeWithoutMtls));

        snapshot.public_surface_acknowledged = true;
        snapshot.bridge_mtls_configured = true;
        assert!(check_posture(&snapshot).is_empty());
    }

    #[test]
    fn bridge_always_needs_a_token() {
        let snapshot = PostureSnapshot {
            bridge_enabled: true,
            ..PostureSnapshot::default()
        };
        assert!(check_posture(&snapshot).contains(&PostureViolation::BridgeWithoutToken));
    }

    #[test]
    fn connector_without_allowlist_flagged_in_strict() {
        let mut snapshot = hardened_with_creds();
        snapshot.connector_active = true;
        assert!(check_posture(&snapshot).contains(&PostureViolation::ConnectorWithoutAllowlist));
        snapshot.callback_allowlist_configured = true;
        assert!(check_posture(&snapshot).is_empty());
    }
}
