//! Configuration for dev server orchestration.
//!
//! Every field has a default so a partial JSON file (or none at all) is valid.
//! Durations are written as humantime strings such as `"5s"` or `"500ms"`.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::ports::{DEFAULT_BASE_PORT, DEFAULT_HOST, DEFAULT_PROBE_TIMEOUT, MAX_ATTEMPTS};

/// Subdirectory of the storage directory holding one directory per project
pub const PROJECTS_DIR: &str = "projects";

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Settings for the dependency installation step run before a dev server starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Command installing the project's dependencies
    pub command: String,
    /// File that must exist in the project root for installation to run
    pub manifest: String,
    /// Path whose presence means dependencies are already installed
    pub marker: String,
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            command: "npm install".to_string(),
            manifest: "package.json".to_string(),
            marker: "node_modules".to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DevServeConfig {
    /// Host used when probing port availability
    pub host: String,
    /// First candidate port handed out by the allocator
    pub base_port: u16,
    /// Number of consecutive ports scanned before giving up
    pub max_port_attempts: u16,
    #[serde(with = "humantime_duration")]
    pub probe_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(with = "humantime_duration")]
    pub stop_timeout: Duration,
    /// How long a second `stop` waits for an in-flight stop before forcing cleanup
    #[serde(with = "humantime_duration")]
    pub stopping_wait: Duration,
    /// Output lines retained per owner for late subscribers
    pub replay_capacity: usize,
    /// How long a single subscriber may take to accept an event
    #[serde(with = "humantime_duration")]
    pub delivery_timeout: Duration,
    pub storage_dir: PathBuf,
    /// Command used when a launch request does not name one
    pub dev_command: String,
    pub install: InstallConfig,
}

impl Default for DevServeConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            base_port: DEFAULT_BASE_PORT,
            max_port_attempts: MAX_ATTEMPTS,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            stop_timeout: Duration::from_secs(5),
            stopping_wait: Duration::from_secs(5),
            replay_capacity: 200,
            delivery_timeout: Duration::from_secs(5),
            storage_dir: PathBuf::from("storage"),
            dev_command: "npm run dev".to_string(),
            install: InstallConfig::default(),
        }
    }
}

impl DevServeConfig {
    /// Load a config from a JSON file, filling unspecified fields with defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Directory containing one subdirectory per project.
    pub fn projects_dir(&self) -> PathBuf {
        self.storage_dir.join(PROJECTS_DIR)
    }
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: DevServeConfig =
            serde_json::from_str(r#"{"base_port": 4000, "stop_timeout": "750ms"}"#).unwrap();

        assert_eq!(config.base_port, 4000);
        assert_eq!(config.stop_timeout, Duration::from_millis(750));
        assert_eq!(config.max_port_attempts, MAX_ATTEMPTS);
        assert_eq!(config.replay_capacity, 200);
        assert_eq!(config.install, InstallConfig::default());
    }

    #[test]
    fn test_durations_round_trip_as_humantime() {
        let config = DevServeConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["stop_timeout"], "5s");
        assert_eq!(json["install"]["timeout"], "5m");

        let parsed: DevServeConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_load_reports_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devserve.json");
        std::fs::write(&path, r#"{"stop_timeout": "soon"}"#).unwrap();

        let err = DevServeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));

        let missing = DevServeConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_projects_dir() {
        let config = DevServeConfig {
            storage_dir: PathBuf::from("/srv/devserve"),
            ..Default::default()
        };
        assert_eq!(config.projects_dir(), PathBuf::from("/srv/devserve/projects"));
    }
}
