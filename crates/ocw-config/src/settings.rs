// SPDX-License-Identifier: MIT OR Apache-2.0
//! The recognized environment surface.

use crate::ConfigError;
use ocw_auth::{
    AuthConfig, DeploymentProfile, PostureSnapshot, RuntimeProfile, WebhookAuth,
};
use ocw_failover::{Candidate, ProviderApi};
use ocw_gate::{Cidr, InflightLimits};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Canonical environment prefix.
const CANONICAL: &str = "OPENCLAW_";
/// Legacy prefix, read at lower precedence.
const LEGACY: &str = "MOLTBOT_";

/// Safety-related toggles and allowlists.
#[derive(Debug, Clone, Default)]
pub struct SafetySettings {
    /// Allow LLM calls to any public host (bypass flag).
    pub allow_any_public_llm_host: bool,
    /// Allow a plain-http engine base URL (bypass flag).
    pub allow_insecure_base_url: bool,
    /// Hosts LLM providers may resolve to.
    pub llm_allowed_hosts: BTreeSet<String>,
    /// Hosts callbacks may deliver to.
    pub callback_allow_hosts: BTreeSet<String>,
    /// Bridge subsystem enabled.
    pub bridge_enabled: bool,
    /// Bridge device token.
    pub bridge_device_token: Option<String>,
    /// Bridge mTLS bundle (cert, key, CA paths).
    pub bridge_mtls: Option<(PathBuf, PathBuf, PathBuf)>,
}

/// Budget caps.
#[derive(Debug, Clone)]
pub struct BudgetSettings {
    /// In-flight caps.
    pub inflight: InflightLimits,
    /// Rendered-workflow byte cap.
    pub max_rendered_workflow_bytes: usize,
    /// LLM call timeout.
    pub llm_timeout: Duration,
    /// Connector media TTL.
    pub media_ttl: Duration,
    /// Connector media size cap, in megabytes.
    pub media_max_mb: u64,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self {
            inflight: InflightLimits::default(),
            max_rendered_workflow_bytes: 524_288,
            llm_timeout: Duration::from_secs(120),
            media_ttl: Duration::from_secs(3600),
            media_max_mb: 32,
        }
    }
}

/// The resolved settings snapshot, taken once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Bind address for the HTTP listener.
    pub bind: String,
    /// Render engine base URL.
    pub engine_url: String,
    /// Credential configuration.
    pub auth: AuthConfig,
    /// Submissions require an approval by default.
    pub require_approval: bool,
    /// Presets readable without observability auth.
    pub presets_public_read: bool,
    /// Deployment profile.
    pub profile: DeploymentProfile,
    /// Runtime profile.
    pub runtime_profile: RuntimeProfile,
    /// Operator acknowledged the shared public surface.
    pub public_surface_ack: bool,
    /// Trusted proxy blocks for `X-Forwarded-For`.
    pub trusted_proxies: Vec<Cidr>,
    /// Honor `X-Forwarded-For` at all.
    pub trust_xff: bool,
    /// Safety toggles.
    pub safety: SafetySettings,
    /// Budget caps.
    pub budgets: BudgetSettings,
    /// State directory.
    pub state_dir: PathBuf,
    /// Diagnostics selector (comma-separated subsystem names).
    pub diagnostics: BTreeSet<String>,
    /// Truncate the log file at startup.
    pub log_truncate: bool,
    /// LLM failover candidates, in preference order.
    pub llm_candidates: Vec<Candidate>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".into(),
            engine_url: "http://127.0.0.1:8188".into(),
            auth: AuthConfig::default(),
            require_approval: false,
            presets_public_read: false,
            profile: DeploymentProfile::Local,
            runtime_profile: RuntimeProfile::Minimal,
            public_surface_ack: false,
            trusted_proxies: Vec::new(),
            trust_xff: false,
            safety: SafetySettings::default(),
            budgets: BudgetSettings::default(),
            state_dir: PathBuf::from(".openclaw"),
            diagnostics: BTreeSet::new(),
            log_truncate: false,
            llm_candidates: Vec::new(),
        }
    }
}

impl Settings {
    /// Load from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through a key lookup (tests inject maps here).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparseable values.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let get = |suffix: &str| -> Option<String> {
            lookup(&format!("{CANONICAL}{suffix}"))
                .or_else(|| lookup(&format!("{LEGACY}{suffix}")))
        };
        let get_bool = |suffix: &str| -> Result<bool, ConfigError> {
            match get(suffix) {
                None => Ok(false),
                Some(raw) => parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
                    key: format!("{CANONICAL}{suffix}"),
                    reason: format!("not a boolean: {raw}"),
                }),
            }
        };
        let get_u64 = |suffix: &str| -> Result<Option<u64>, ConfigError> {
            match get(suffix) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: format!("{CANONICAL}{suffix}"),
                        reason: format!("not an integer: {raw}"),
                    }),
            }
        };

        let mut settings = Self::default();

        if let Some(bind) = get("BIND") {
            settings.bind = bind;
        }
        if let Some(engine) = get("ENGINE_URL") {
            settings.engine_url = engine;
        }

        // -- Auth ------------------------------------------------------------
        settings.auth.admin_token = get("ADMIN_TOKEN").filter(|t| !t.is_empty());
        settings.auth.observability_token =
            get("OBSERVABILITY_TOKEN").filter(|t| !t.is_empty());
        settings.auth.allow_remote_admin = get_bool("ALLOW_REMOTE_ADMIN")?;
        settings.auth.allow_no_origin_loopback = get_bool("ALLOW_NO_ORIGIN_LOOPBACK")?;
        settings.auth.webhook = match (
            get("WEBHOOK_MODE").as_deref(),
            get("WEBHOOK_TOKEN"),
            get("WEBHOOK_SECRET"),
        ) {
            (Some("bearer"), Some(token), _) => WebhookAuth::Bearer(token),
            (Some("hmac"), _, Some(secret)) => WebhookAuth::Hmac(secret),
            (Some("bearer_or_hmac"), Some(token), Some(secret)) => {
                WebhookAuth::BearerOrHmac { token, secret }
            }
            (None, Some(token), None) => WebhookAuth::Bearer(token),
            (None, None, Some(secret)) => WebhookAuth::Hmac(secret),
            (None, Some(token), Some(secret)) => WebhookAuth::BearerOrHmac { token, secret },
            (Some(mode), _, _) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{CANONICAL}WEBHOOK_MODE"),
                    reason: format!("mode '{mode}' missing its credential"),
                });
            }
            (None, None, None) => WebhookAuth::Unconfigured,
        };
        settings.require_approval = get_bool("REQUIRE_APPROVAL")?;
        settings.presets_public_read = get_bool("PRESETS_PUBLIC_READ")?;

        // -- Posture ---------------------------------------------------------
        settings.profile = match get("DEPLOYMENT_PROFILE").as_deref() {
            None | Some("local") => DeploymentProfile::Local,
            Some("lan") => DeploymentProfile::Lan,
            Some("public") => DeploymentProfile::Public,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{CANONICAL}DEPLOYMENT_PROFILE"),
                    reason: format!("unknown profile: {other}"),
                });
            }
        };
        settings.runtime_profile = match get("RUNTIME_PROFILE").as_deref() {
            None | Some("minimal") => RuntimeProfile::Minimal,
            Some("hardened") => RuntimeProfile::Hardened,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{CANONICAL}RUNTIME_PROFILE"),
                    reason: format!("unknown profile: {other}"),
                });
            }
        };
        settings.public_surface_ack = get_bool("PUBLIC_SURFACE_ACK")?;
        settings.trust_xff = get_bool("TRUST_XFF")?;
        if let Some(raw) = get("TRUSTED_PROXIES") {
            for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let cidr = entry.parse::<Cidr>().map_err(|reason| {
                    ConfigError::InvalidValue {
                        key: format!("{CANONICAL}TRUSTED_PROXIES"),
                        reason,
                    }
                })?;
                settings.trusted_proxies.push(cidr);
            }
        }

        // -- Safety ----------------------------------------------------------
        settings.safety.allow_any_public_llm_host = get_bool("ALLOW_ANY_PUBLIC_LLM_HOST")?;
        settings.safety.allow_insecure_base_url = get_bool("ALLOW_INSECURE_BASE_URL")?;
        settings.safety.llm_allowed_hosts = split_hosts(get("LLM_ALLOWED_HOSTS"));
        settings.safety.callback_allow_hosts = split_hosts(get("CALLBACK_ALLOW_HOSTS"));
        settings.safety.bridge_enabled = get_bool("BRIDGE_ENABLED")?;
        settings.safety.bridge_device_token =
            get("BRIDGE_DEVICE_TOKEN").filter(|t| !t.is_empty());
        settings.safety.bridge_mtls = match (
            get("BRIDGE_MTLS_CERT"),
            get("BRIDGE_MTLS_KEY"),
            get("BRIDGE_MTLS_CA"),
        ) {
            (Some(cert), Some(key), Some(ca)) => {
                Some((PathBuf::from(cert), PathBuf::from(key), PathBuf::from(ca)))
            }
            (None, None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: format!("{CANONICAL}BRIDGE_MTLS_CERT"),
                    reason: "mTLS bundle needs cert, key, and CA together".into(),
                });
            }
        };

        // -- Budgets ---------------------------------------------------------
        if let Some(total) = get_u64("MAX_INFLIGHT_TOTAL")? {
            settings.budgets.inflight.total = total as usize;
        }
        if let Some(webhook) = get_u64("MAX_INFLIGHT_WEBHOOK")? {
            settings.budgets.inflight.webhook = webhook as usize;
        }
        if let Some(bridge) = get_u64("MAX_INFLIGHT_BRIDGE")? {
            settings.budgets.inflight.bridge = bridge as usize;
        }
        if let Some(bytes) = get_u64("MAX_RENDERED_WORKFLOW_BYTES")? {
            settings.budgets.max_rendered_workflow_bytes = bytes as usize;
        }
        if let Some(secs) = get_u64("LLM_TIMEOUT_SECS")? {
            settings.budgets.llm_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = get_u64("MEDIA_TTL_SECS")? {
            settings.budgets.media_ttl = Duration::from_secs(secs);
        }
        if let Some(mb) = get_u64("MEDIA_MAX_MB")? {
            settings.budgets.media_max_mb = mb;
        }

        // -- Paths -----------------------------------------------------------
        if let Some(dir) = get("STATE_DIR") {
            settings.state_dir = PathBuf::from(dir);
        }
        settings.diagnostics = get("DIAGNOSTICS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        settings.log_truncate = get_bool("LOG_TRUNCATE")?;

        // -- LLM candidates --------------------------------------------------
        if let Some(raw) = get("LLM_CANDIDATES") {
            settings.llm_candidates =
                serde_json::from_str(&raw).map_err(|e| ConfigError::InvalidValue {
                    key: format!("{CANONICAL}LLM_CANDIDATES"),
                    reason: e.to_string(),
                })?;
        } else if let Some(base_url) = get("LLM_BASE_URL") {
            settings.llm_candidates.push(Candidate {
                provider_id: get("LLM_PROVIDER_ID").unwrap_or_else(|| "primary".into()),
                model: get("LLM_MODEL").unwrap_or_else(|| "default".into()),
                base_url,
                api: match get("LLM_API").as_deref() {
                    Some("ollama") => ProviderApi::Ollama,
                    _ => ProviderApi::OpenAiChat,
                },
                api_key: get("LLM_API_KEY").filter(|k| !k.is_empty()),
            });
        }

        if settings.profile == DeploymentProfile::Public && settings.auth.admin_token.is_none() {
            warn!("public profile without an admin token; the posture gate will refuse startup");
        }

        Ok(settings)
    }

    /// Take the immutable posture snapshot for the gate.
    #[must_use]
    pub fn posture_snapshot(&self, connector_active: bool) -> PostureSnapshot {
        PostureSnapshot {
            profile: self.profile,
            runtime_profile: self.runtime_profile,
            auth: self.auth.clone(),
            bridge_enabled: self.safety.bridge_enabled,
            bridge_token_configured: self.safety.bridge_device_token.is_some(),
            bridge_mtls_configured: self.safety.bridge_mtls.is_some(),
            allow_any_public_llm_host: self.safety.allow_any_public_llm_host,
            allow_insecure_base_url: self.safety.allow_insecure_base_url,
            callback_allowlist_configured: !self.safety.callback_allow_hosts.is_empty(),
            connector_active,
            public_surface_acknowledged: self.public_surface_ack,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn split_hosts(raw: Option<String>) -> BTreeSet<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_are_loopback_minimal() {
        let settings = from_map(&[]).unwrap();
        assert_eq!(settings.bind, "127.0.0.1:8787");
        assert_eq!(settings.profile, DeploymentProfile::Local);
        assert_eq!(settings.runtime_profile, RuntimeProfile::Minimal);
        assert_eq!(settings.budgets.max_rendered_workflow_bytes, 524_288);
        assert_eq!(settings.budgets.llm_timeout, Duration::from_secs(120));
        assert!(!settings.auth.webhook.is_configured());
    }

    #[test]
    fn canonical_beats_legacy() {
        let settings = from_map(&[
            ("OPENCLAW_ADMIN_TOKEN", "new"),
            ("MOLTBOT_ADMIN_TOKEN", "old"),
        ])
        .unwrap();
        assert_eq!(settings.auth.admin_token.as_deref(), Some("new"));
    }

    #[test]
    fn legacy_alias_read_when_canonical_absent() {
        let settings = from_map(&[("MOLTBOT_OBSERVABILITY_TOKEN", "legacy-tok")]).unwrap();
        assert_eq!(
            settings.auth.observability_token.as_deref(),
            Some("legacy-tok")
        );
    }

    #[test]
    fn webhook_mode_combinations() {
        let settings = from_map(&[
            ("OPENCLAW_WEBHOOK_MODE", "bearer_or_hmac"),
            ("OPENCLAW_WEBHOOK_TOKEN", "tok"),
            ("OPENCLAW_WEBHOOK_SECRET", "sec"),
        ])
        .unwrap();
        assert!(matches!(
            settings.auth.webhook,
            WebhookAuth::BearerOrHmac { .. }
        ));

        // Mode without its credential is an error.
        assert!(from_map(&[("OPENCLAW_WEBHOOK_MODE", "hmac")]).is_err());

        // Bare secret implies hmac.
        let settings = from_map(&[("OPENCLAW_WEBHOOK_SECRET", "sec")]).unwrap();
        assert!(matches!(settings.auth.webhook, WebhookAuth::Hmac(_)));
    }

    #[test]
    fn budgets_parse_and_override() {
        let settings = from_map(&[
            ("OPENCLAW_MAX_INFLIGHT_TOTAL", "4"),
            ("OPENCLAW_MAX_INFLIGHT_WEBHOOK", "2"),
            ("OPENCLAW_MAX_RENDERED_WORKFLOW_BYTES", "1048576"),
            ("OPENCLAW_LLM_TIMEOUT_SECS", "60"),
        ])
        .unwrap();
        assert_eq!(settings.budgets.inflight.total, 4);
        assert_eq!(settings.budgets.inflight.webhook, 2);
        assert_eq!(settings.budgets.max_rendered_workflow_bytes, 1_048_576);
        assert_eq!(settings.budgets.llm_timeout, Duration::from_secs(60));
    }

    #[test]
    fn bad_values_are_rejected_with_key() {
        let err = from_map(&[("OPENCLAW_MAX_INFLIGHT_TOTAL", "lots")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. }
            if key == "OPENCLAW_MAX_INFLIGHT_TOTAL"));
        assert!(from_map(&[("OPENCLAW_DEPLOYMENT_PROFILE", "cloud")]).is_err());
        assert!(from_map(&[("OPENCLAW_TRUST_XFF", "maybe")]).is_err());
    }

    #[test]
    fn host_lists_split_and_trim() {
        let settings = from_map(&[(
            "OPENCLAW_CALLBACK_ALLOW_HOSTS",
            "hooks.example, cb.example:8443 ,",
        )])
        .unwrap();
        assert!(settings.safety.callback_allow_hosts.contains("hooks.example"));
        assert!(settings
            .safety
            .callback_allow_hosts
            .contains("cb.example:8443"));
        assert_eq!(settings.safety.callback_allow_hosts.len(), 2);
    }

    #[test]
    fn trusted_proxies_parse_as_cidrs() {
        let settings =
            from_map(&[("OPENCLAW_TRUSTED_PROXIES", "10.0.0.0/8, 192.168.1.1")]).unwrap();
        assert_eq!(settings.trusted_proxies.len(), 2);
        assert!(from_map(&[("OPENCLAW_TRUSTED_PROXIES", "10.0.0.0/99")]).is_err());
    }

    #[test]
    fn partial_mtls_bundle_is_rejected() {
        assert!(from_map(&[
            ("OPENCLAW_BRIDGE_MTLS_CERT", "/x/cert.pem"),
            ("OPENCLAW_BRIDGE_MTLS_KEY", "/x/key.pem"),
        ])
        .is_err());
    }

    #[test]
    fn llm_candidates_from_json() {
        let settings = from_map(&[(
            "OPENCLAW_LLM_CANDIDATES",
            r#"[{"provider_id": "a", "model": "m1", "base_url": "https://llm-a.example", "api": "open_ai_chat"},
                {"provider_id": "b", "model": "m2", "base_url": "http://127.0.0.1:11434", "api": "ollama"}]"#,
        )])
        .unwrap();
        assert_eq!(settings.llm_candidates.len(), 2);
        assert_eq!(settings.llm_candidates[1].api, ProviderApi::Ollama);
    }

    #[test]
    fn single_candidate_from_simple_keys() {
        let settings = from_map(&[
            ("OPENCLAW_LLM_BASE_URL", "http://127.0.0.1:11434"),
            ("OPENCLAW_LLM_MODEL", "llama3"),
            ("OPENCLAW_LLM_API", "ollama"),
        ])
        .unwrap();
        assert_eq!(settings.llm_candidates.len(), 1);
        assert_eq!(settings.llm_candidates[0].model, "llama3");
    }

    #[test]
    fn posture_snapshot_reflects_settings() {
        let settings = from_map(&[
            ("OPENCLAW_DEPLOYMENT_PROFILE", "public"),
            ("OPENCLAW_RUNTIME_PROFILE", "hardened"),
            ("OPENCLAW_BRIDGE_ENABLED", "1"),
            ("OPENCLAW_CALLBACK_ALLOW_HOSTS", "hooks.example"),
        ])
        .unwrap();
        let snapshot = settings.posture_snapshot(true);
        assert_eq!(snapshot.profile, DeploymentProfile::Public);
        assert!(snapshot.bridge_enabled);
        assert!(!snapshot.bridge_token_configured);
        assert!(snapshot.callback_allowlist_configured);
        assert!(snapshot.connector_active);
    }
}
