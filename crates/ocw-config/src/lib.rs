// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading for the OpenClaw daemon.
//!
//! The environment is the source of truth for security-relevant settings
//! ("runtime guardrails"); the state directory carries operator-tunable
//! non-secret configuration. Canonical keys use the `OPENCLAW_` prefix;
//! legacy `MOLTBOT_` aliases are read at lower precedence.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod settings;
mod state;
mod store;

pub use settings::{BudgetSettings, SafetySettings, Settings};
pub use state::StateLayout;
pub use store::{ConfigStore, GUARDRAIL_FIELDS};

use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Configuration failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// An environment value failed to parse.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Offending key (canonical name).
        key: String,
        /// Parse detail.
        reason: String,
    },
    /// Persistent config could not be read or written.
    #[error("config store failure: {0}")]
    Store(String),
    /// A write attempted to persist a runtime guardrail.
    #[error("refusing to persist runtime guardrail fields: {fields:?}")]
    GuardrailWrite {
        /// The rejected field names.
        fields: Vec<String>,
    },
}

/// Install the tracing subscriber and handle log-file truncation.
///
/// The daemon logs to stderr; `log_file` is the operator-visible copy whose
/// truncate-on-start flag is honored here.
pub fn init_logging(filter: &str, log_file: Option<&Path>, truncate: bool) {
    if truncate
        && let Some(path) = log_file
    {
        let _ = std::fs::write(path, b"");
    }
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
