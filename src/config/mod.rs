// src/config/mod.rs

pub mod validator;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::error::CoreError;
use crate::validation::ValidationError;

pub use validator::ConfigValidator;

/// Prefix of environment overrides (`OWEHOST__PATHS__ACCOUNTS_ROOT=...`)
pub const ENV_PREFIX: &str = "OWEHOST";

/// Configuration of one hosting node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Filesystem roots
    pub paths: PathsConfig,

    /// External process execution
    pub exec: ExecConfig,

    /// Event log retention
    pub events: EventsConfig,

    /// PHP-FPM versions installed on the node
    pub php: PhpConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Node identifier stamped on identities and events
    pub node_id: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            exec: ExecConfig::default(),
            events: EventsConfig::default(),
            php: PhpConfig::default(),
            logging: LoggingConfig::default(),
            node_id: default_node_id(),
        }
    }
}

/// Filesystem roots; every generated path hangs off one of these
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Parent of every tenant directory
    pub accounts_root: PathBuf,

    /// System base holding the event log, alerts and index
    pub opt_root: PathBuf,

    /// nginx configuration root (`sites-available`, `sites-enabled`, `conf.d`)
    pub nginx_root: PathBuf,

    /// PHP configuration root (`<ver>/fpm/pool.d`)
    pub php_root: PathBuf,

    /// cgroup v2 directory owning the per-tenant groups
    pub cgroup_root: PathBuf,

    /// Directory holding PHP-FPM sockets
    pub php_run_dir: PathBuf,

    /// Mount point passed to setquota
    pub quota_mount: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            accounts_root: PathBuf::from("/srv/accounts"),
            opt_root: PathBuf::from("/opt/owehost"),
            nginx_root: PathBuf::from("/etc/nginx"),
            php_root: PathBuf::from("/etc/php"),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/owehost"),
            php_run_dir: PathBuf::from("/run/php"),
            quota_mount: PathBuf::from("/srv"),
        }
    }
}

impl PathsConfig {
    /// Roots all placed under one base directory, used by tests and dry runs
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            accounts_root: base.join("srv/accounts"),
            opt_root: base.join("opt/owehost"),
            nginx_root: base.join("etc/nginx"),
            php_root: base.join("etc/php"),
            cgroup_root: base.join("sys/fs/cgroup/owehost"),
            php_run_dir: base.join("run/php"),
            quota_mount: base.join("srv"),
        }
    }
}

/// External process execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Wall-time cap for every child process
    pub timeout_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// Event log retention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Day directories older than this are pruned
    pub retention_days: u32,

    /// Pruner cadence
    pub prune_interval_hours: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            prune_interval_hours: 6,
        }
    }
}

/// PHP versions known to the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhpConfig {
    /// Versions whose FPM units are reloaded after generation
    pub versions: Vec<String>,

    /// Version used by callers that do not pick one
    pub default_version: String,
}

impl Default for PhpConfig {
    fn default() -> Self {
        Self {
            versions: ["7.4", "8.0", "8.1", "8.2", "8.3"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
            default_version: "8.2".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Log format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text
    Plain,

    /// JSON format
    Json,
}

fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Configuration manager
pub struct ConfigManager {
    /// Current active configuration
    config: HostConfig,

    /// Configuration file path
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a new configuration manager with a default configuration
    pub fn new() -> Self {
        Self {
            config: HostConfig::default(),
            config_path: None,
        }
    }

    /// Loads defaults, then the optional YAML file, then `OWEHOST__*` overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&HostConfig::default())
                .map_err(|e| ConfigError::SerializationError(e.to_string()))?,
        );

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileReadError {
                    path: path.to_path_buf(),
                    source: io::Error::from(io::ErrorKind::NotFound),
                });
            }
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Yaml),
            );
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let config: HostConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let manager = Self {
            config,
            config_path: path.map(Path::to_path_buf),
        };
        manager.validate()?;

        match &manager.config_path {
            Some(path) => info!("Configuration loaded from {}", path.display()),
            None => debug!("Configuration loaded from defaults and environment"),
        }
        Ok(manager)
    }

    /// Loads configuration from a YAML file without environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let config: HostConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let manager = Self {
            config,
            config_path: Some(path.to_path_buf()),
        };
        manager.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(manager)
    }

    /// Saves the current configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let config_str = serde_yaml::to_string(&self.config)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        fs::write(path, config_str).map_err(|source| ConfigError::FileWriteError {
            path: path.to_path_buf(),
            source,
        })?;

        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Validates the current configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigValidator::new().validate(&self.config)?;
        debug!("Configuration validated successfully");
        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &HostConfig {
        &self.config
    }

    /// Path the configuration was read from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Replaces the configuration after validating it
    pub fn update_config(&mut self, config: HostConfig) -> Result<(), ConfigError> {
        ConfigValidator::new().validate(&config)?;
        self.config = config;
        Ok(())
    }

    /// Consumes the manager
    pub fn into_config(self) -> HostConfig {
        self.config
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write configuration file {path}: {source}")]
    FileWriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::FileReadError { path, source }
            | ConfigError::FileWriteError { path, source } => CoreError::Io { path, source },
            ConfigError::ParseError(reason) => CoreError::Corrupt {
                path: PathBuf::from("config"),
                reason,
            },
            ConfigError::SerializationError(message) | ConfigError::ValidationError(message) => {
                CoreError::Validation(ValidationError::new("config", message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_a_stock_node() {
        let config = HostConfig::default();
        assert_eq!(config.paths.accounts_root, PathBuf::from("/srv/accounts"));
        assert_eq!(config.exec.timeout_secs, 30);
        assert_eq!(config.events.retention_days, 90);
        assert_eq!(config.php.default_version, "8.2");
        assert!(!config.node_id.is_empty());
        assert!(ConfigValidator::new().validate(&config).is_ok());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("owehost.yaml");
        fs::write(
            &path,
            "exec:\n  timeout_secs: 5\nlogging:\n  format: json\nnode_id: node-7\n",
        )
        .unwrap();

        let manager = ConfigManager::load(Some(&path)).unwrap();
        let config = manager.get_config();
        assert_eq!(config.exec.timeout_secs, 5);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.node_id, "node-7");
        assert_eq!(config.events.retention_days, 90);
    }

    #[test]
    fn save_then_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("saved.yaml");
        let mut manager = ConfigManager::new();
        let mut config = HostConfig::default();
        config.paths = PathsConfig::under(dir.path());
        manager.update_config(config.clone()).unwrap();
        manager.save_to_file(&path).unwrap();

        let loaded = ConfigManager::load_from_file(&path).unwrap();
        assert_eq!(loaded.get_config(), &config);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = ConfigManager::load(Some(Path::new("/nonexistent/owehost.yaml"))).err();
        assert!(matches!(err, Some(ConfigError::FileReadError { .. })));
    }
}
