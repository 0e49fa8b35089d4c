//! Task configuration for the ingestion capsule.
//!
//! A [`TaskConfig`] is read from a YAML file (if one is found) and then
//! overridden from `INGEST_*` environment variables. Environment values for
//! the container may reference secrets as `secret://scope/key`; see
//! [`secrets::render_env`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, instrument};

pub mod secrets;
pub use secrets::{render_env, EnvFileSecretProvider, SecretError, SecretProvider};

pub const DEFAULT_IMAGE: &str = "acryldata/datahub-ingestion:head";
pub const DEFAULT_NETWORK: &str = "datahub_network";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("YAML parsing failed: {message}")]
    YamlParsingFailed { message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// When the container image is fetched before the container is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

#[derive(Debug, Clone, Error)]
#[error("unknown pull policy '{0}' (expected ALWAYS, NEVER or IF_NOT_PRESENT)")]
pub struct ParsePullPolicyError(String);

impl FromStr for PullPolicy {
    type Err = ParsePullPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "ALWAYS" => Ok(PullPolicy::Always),
            "NEVER" => Ok(PullPolicy::Never),
            "IF_NOT_PRESENT" | "IFNOTPRESENT" => Ok(PullPolicy::IfNotPresent),
            _ => Err(ParsePullPolicyError(s.to_string())),
        }
    }
}

impl fmt::Display for PullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PullPolicy::Always => "ALWAYS",
            PullPolicy::Never => "NEVER",
            PullPolicy::IfNotPresent => "IF_NOT_PRESENT",
        })
    }
}

/// Shape of the result handed back to the workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeForm {
    /// `{ "success": bool }` only.
    Legacy,
    /// Exit code, structured outputs and per-stream line counts.
    #[default]
    Detailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct TaskConfig {
    pub image: String,
    pub network: String,
    /// Container engine connection target, e.g. `unix:///var/run/docker.sock`.
    pub host: Option<String>,
    pub pull_policy: PullPolicy,
    pub env: BTreeMap<String, String>,
    pub outcome: OutcomeForm,
    pub auto_remove: bool,
    /// Where materialized recipes are staged. Defaults to the system temp dir.
    pub work_dir: Option<PathBuf>,
    /// Root directory backing `blob://` recipe references.
    pub storage_root: Option<PathBuf>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            network: DEFAULT_NETWORK.to_string(),
            host: None,
            pull_policy: PullPolicy::default(),
            env: BTreeMap::new(),
            outcome: OutcomeForm::default(),
            auto_remove: true,
            work_dir: None,
            storage_root: None,
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.image.trim().is_empty() {
            return Err(invalid("image", "container image cannot be empty"));
        }

        if self.network.trim().is_empty() {
            return Err(invalid("network", "network name cannot be empty"));
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(invalid(
                    "env",
                    format!("'{}' is not a valid environment variable name", key),
                ));
            }
        }

        Ok(())
    }

    /// Apply `INGEST_*` environment overrides on top of the file values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(image) = env_override("INGEST_IMAGE") {
            self.image = image;
        }
        if let Some(network) = env_override("INGEST_NETWORK") {
            self.network = network;
        }
        if let Some(host) = env_override("INGEST_HOST") {
            self.host = Some(host);
        }
        if let Some(policy) = env_override("INGEST_PULL_POLICY") {
            self.pull_policy = policy
                .parse()
                .map_err(|e: ParsePullPolicyError| invalid("INGEST_PULL_POLICY", e.to_string()))?;
        }
        if let Some(dir) = env_override("INGEST_WORK_DIR") {
            self.work_dir = Some(PathBuf::from(dir));
        }
        if let Some(dir) = env_override("INGEST_STORAGE_ROOT") {
            self.storage_root = Some(PathBuf::from(dir));
        }
        Ok(())
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: Self::find_config_file(),
        }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    fn find_config_file() -> Option<PathBuf> {
        // An explicit path wins even if it does not exist, so typos surface.
        if let Ok(path) = std::env::var("INGEST_CONFIG") {
            if !path.trim().is_empty() {
                return Some(PathBuf::from(path));
            }
        }

        let local = PathBuf::from(".ingest/config.yaml");
        if local.is_file() {
            return Some(local);
        }

        dirs::config_dir()
            .map(|dir| dir.join("ingest").join("config.yaml"))
            .filter(|path| path.is_file())
    }

    /// Load the file (or defaults when none was found), apply environment
    /// overrides and validate the result.
    #[instrument(skip(self))]
    pub fn load(&self) -> Result<TaskConfig, ConfigError> {
        let mut config = match &self.config_path {
            Some(path) => Self::load_file(path)?,
            None => {
                debug!("No config file found, using defaults");
                TaskConfig::default()
            }
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<TaskConfig, ConfigError> {
        debug!("Loading config from: {:?}", path);

        if !path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: path.to_string_lossy().to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file {}: {}", path.display(), e),
        })?;

        if content.trim().is_empty() {
            return Ok(TaskConfig::default());
        }

        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParsingFailed {
            message: e.to_string(),
        })
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
