//! Controller settings.
//!
//! Settings come from environment variables in a deployment and from a JSON
//! file in tests or local runs. Every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::version::VersionFilter;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Output encoding of log records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" | "console" => Ok(LogFormat::Text),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogSettings {
    /// Filter directive used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub namespace: String,
    /// Parent directory of every temporary workspace.
    pub temp_folder: PathBuf,
    pub git_username: String,
    pub git_host: String,
    pub git_port: u16,
    /// Overrides the derived `ssh://user@host:port` remote base.
    pub git_base_url: Option<String>,
    pub git_key_secret_name: String,
    pub git_key_secret_key: String,
    /// Version filter expression limiting which registries are imported.
    pub registry_version_filter: String,
    pub default_retry_secs: u64,
    pub postpone_secs: u64,
    pub cached_files_ttl_secs: u64,
    /// Concurrent codebase reconciliations. Merge requests always run one at a time.
    pub codebase_workers: usize,
    pub ci_git_credentials_id: String,
    pub ci_git_server_version: String,
    pub ci_repository_base: String,
    pub log: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            temp_folder: PathBuf::from("/tmp"),
            git_username: "project-creator".to_string(),
            git_host: "gerrit".to_string(),
            git_port: 31000,
            git_base_url: None,
            git_key_secret_name: "gerrit-project-creator".to_string(),
            git_key_secret_key: "id_rsa".to_string(),
            registry_version_filter: String::new(),
            default_retry_secs: 15,
            postpone_secs: 15,
            cached_files_ttl_secs: 3600,
            codebase_workers: 4,
            ci_git_credentials_id: "gerrit-ciuser-sshkey".to_string(),
            ci_git_server_version: "v2".to_string(),
            ci_repository_base: "ssh://jenkins@gerrit:31000".to_string(),
            log: LogSettings::default(),
        }
    }
}

fn parse_env<T>(key: &str, value: String) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let parsed = value.trim().parse::<T>();
    parsed.map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value,
        reason: e.to_string(),
    })
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Settings::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("NAMESPACE") {
            settings.namespace = v;
        }
        if let Some(v) = get("TEMP_FOLDER") {
            settings.temp_folder = PathBuf::from(v);
        }
        if let Some(v) = get("GERRIT_GIT_USERNAME") {
            settings.git_username = v;
        }
        if let Some(v) = get("GERRIT_GIT_HOSTNAME") {
            settings.git_host = v;
        }
        if let Some(v) = get("GERRIT_GIT_PORT") {
            settings.git_port = parse_env("GERRIT_GIT_PORT", v)?;
        }
        if let Some(v) = get("GIT_BASE_URL") {
            settings.git_base_url = Some(v);
        }
        if let Some(v) = get("GERRIT_GIT_KEY_SECRET_NAME") {
            settings.git_key_secret_name = v;
        }
        if let Some(v) = get("GERRIT_GIT_KEY_SECRET_KEY") {
            settings.git_key_secret_key = v;
        }
        if let Some(v) = get("REGISTRY_VERSION_FILTER") {
            settings.registry_version_filter = v;
        }
        if let Some(v) = get("DEFAULT_RETRY_SECS") {
            settings.default_retry_secs = parse_env("DEFAULT_RETRY_SECS", v)?;
        }
        if let Some(v) = get("POSTPONE_SECS") {
            settings.postpone_secs = parse_env("POSTPONE_SECS", v)?;
        }
        if let Some(v) = get("CACHED_FILES_TTL_SECS") {
            settings.cached_files_ttl_secs = parse_env("CACHED_FILES_TTL_SECS", v)?;
        }
        if let Some(v) = get("CODEBASE_WORKERS") {
            settings.codebase_workers = parse_env("CODEBASE_WORKERS", v)?;
        }
        if let Some(v) = get("CI_GIT_CREDENTIALS_ID") {
            settings.ci_git_credentials_id = v;
        }
        if let Some(v) = get("CI_GIT_SERVER_VERSION") {
            settings.ci_git_server_version = v;
        }
        if let Some(v) = get("CI_REPOSITORY_BASE") {
            settings.ci_repository_base = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            settings.log.level = v;
        }
        if let Some(v) = get("LOG_ENCODING") {
            settings.log.format = parse_env("LOG_ENCODING", v)?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.version_filter()?;

        for (name, value) in [
            ("defaultRetrySecs", self.default_retry_secs),
            ("postponeSecs", self.postpone_secs),
            ("cachedFilesTtlSecs", self.cached_files_ttl_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation {
                    message: format!("{} must be greater than zero", name),
                });
            }
        }

        if self.codebase_workers == 0 {
            return Err(ConfigError::Validation {
                message: "codebaseWorkers must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    /// Git remote of `project` in the review system.
    pub fn git_remote_url(&self, project: &str) -> String {
        match &self.git_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), project),
            None => format!(
                "ssh://{}@{}:{}/{}",
                self.git_username, self.git_host, self.git_port, project
            ),
        }
    }

    /// Repository path the CI system clones `project` from.
    pub fn ci_repository_path(&self, project: &str) -> String {
        format!("{}/{}", self.ci_repository_base.trim_end_matches('/'), project)
    }

    pub fn version_filter(&self) -> Result<VersionFilter, ConfigError> {
        VersionFilter::parse(&self.registry_version_filter).map_err(|e| {
            ConfigError::InvalidValue {
                key: "registryVersionFilter".to_string(),
                value: self.registry_version_filter.clone(),
                reason: e.to_string(),
            }
        })
    }

    pub fn default_retry(&self) -> Duration {
        Duration::from_secs(self.default_retry_secs)
    }

    pub fn postpone_delay(&self) -> Duration {
        Duration::from_secs(self.postpone_secs)
    }

    pub fn cached_files_ttl(&self) -> Duration {
        Duration::from_secs(self.cached_files_ttl_secs)
    }
}

/// Loads settings from a JSON file.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_settings_from_str(&content)
}

pub fn load_settings_from_str(content: &str) -> Result<Settings, ConfigError> {
    let settings: Settings = serde_json::from_str(content)?;
    settings.validate()?;
    Ok(settings)
}
