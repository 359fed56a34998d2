// SPDX-License-Identifier: MIT OR Apache-2.0
//! State-directory layout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Canonical file layout under the state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at `root`, creating the directory tree.
    ///
    /// # Errors
    ///
    /// Returns an IO error when the directories cannot be created.
    pub fn create(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let layout = Self { root: root.into() };
        std::fs::create_dir_all(layout.history_dir())?;
        std::fs::create_dir_all(layout.deadletter_dir())?;
        Ok(layout)
    }

    /// The state directory root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Operator-tunable non-secret configuration.
    #[must_use]
    pub fn config_json(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Plain secrets file (values only leave through redaction).
    #[must_use]
    pub fn secrets_json(&self) -> PathBuf {
        self.root.join("secrets.json")
    }

    /// Persisted schedules.
    #[must_use]
    pub fn schedules_json(&self) -> PathBuf {
        self.root.join("schedules.json")
    }

    /// Persisted approvals.
    #[must_use]
    pub fn approvals_json(&self) -> PathBuf {
        self.root.join("approvals.json")
    }

    /// Restart-survivable webhook idempotency entries.
    #[must_use]
    pub fn idempotency_json(&self) -> PathBuf {
        self.root.join("idempotency.json")
    }

    /// Saved presets.
    #[must_use]
    pub fn presets_json(&self) -> PathBuf {
        self.root.join("presets.json")
    }

    /// Run-history directory.
    #[must_use]
    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    /// Scheduler run records.
    #[must_use]
    pub fn runs_json(&self) -> PathBuf {
        self.history_dir().join("runs.json")
    }

    /// Dead-letter directory.
    #[must_use]
    pub fn deadletter_dir(&self) -> PathBuf {
        self.root.join("deadletter")
    }

    /// Operator-visible log file.
    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.root.join("openclaw.log")
    }

    /// Load `secrets.json` if present.
    ///
    /// # Errors
    ///
    /// Returns an error when the file exists but cannot be parsed.
    pub fn load_secrets(&self) -> std::io::Result<HashMap<String, String>> {
        match std::fs::read(self.secrets_json()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_builds_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::create(dir.path().join("state")).unwrap();
        assert!(layout.history_dir().is_dir());
        assert!(layout.deadletter_dir().is_dir());
        assert_eq!(layout.log_file().file_name().unwrap(), "openclaw.log");
    }

    #[test]
    fn missing_secrets_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::create(dir.path()).unwrap();
        assert!(layout.load_secrets().unwrap().is_empty());
    }

    #[test]
    fn secrets_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StateLayout::create(dir.path()).unwrap();
        std::fs::write(
            layout.secrets_json(),
            serde_json::json!({"cb": "hook-secret"}).to_string(),
        )
        .unwrap();
        let secrets = layout.load_secrets().unwrap();
        assert_eq!(secrets["cb"], "hook-secret");
    }
}
