//! Core state configuration.
//!
//! Loaded from a TOML file; every field has a default so an empty file is
//! a valid configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings for [`CoreState`](crate::CoreState) and its parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Directory holding every persisted control value.
    pub state_dir: PathBuf,
    /// How long binding may wait for the cluster to settle on an id.
    pub binding_timeout_secs: u64,
    /// Pause between two topology polls while binding.
    pub binding_retry_ms: u64,
    /// How long a node with no local state waits for its first snapshot.
    pub first_snapshot_timeout_secs: u64,
    /// How often a blocked applier sync logs a warning.
    pub applier_stuck_warning_secs: u64,
    /// Records per state file before switching to the other file.
    pub state_rotation_entries: u64,
    /// Applied entries between two flushes of the last applied index.
    pub flush_every: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data/cluster-state"),
            binding_timeout_secs: 300,
            binding_retry_ms: 1000,
            first_snapshot_timeout_secs: 600,
            applier_stuck_warning_secs: 10,
            state_rotation_entries: 1000,
            flush_every: 100,
        }
    }
}

impl CoreConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: CoreConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("state_dir must not be empty".into()));
        }
        let positive = [
            ("binding_timeout_secs", self.binding_timeout_secs),
            ("binding_retry_ms", self.binding_retry_ms),
            ("applier_stuck_warning_secs", self.applier_stuck_warning_secs),
            ("state_rotation_entries", self.state_rotation_entries),
            ("flush_every", self.flush_every),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
            }
        }
        Ok(())
    }

    pub fn binding_timeout(&self) -> Duration {
        Duration::from_secs(self.binding_timeout_secs)
    }

    pub fn binding_retry_interval(&self) -> Duration {
        Duration::from_millis(self.binding_retry_ms)
    }

    pub fn first_snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.first_snapshot_timeout_secs)
    }

    pub fn applier_stuck_warning(&self) -> Duration {
        Duration::from_secs(self.applier_stuck_warning_secs)
    }
}
