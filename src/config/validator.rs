// src/config/validator.rs

use std::path::Path;
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, EventsConfig, ExecConfig, HostConfig, PathsConfig, PhpConfig};

/// Configuration validator
pub struct ConfigValidator {}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates a configuration
    pub fn validate(&self, config: &HostConfig) -> Result<(), ConfigError> {
        self.validate_paths(&config.paths)?;
        self.validate_exec(&config.exec)?;
        self.validate_events(&config.events)?;
        self.validate_php(&config.php)?;

        if config.node_id.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Node id cannot be empty".to_string(),
            ));
        }

        if EnvFilter::try_new(&config.logging.level).is_err() {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level directive: {}",
                config.logging.level
            )));
        }

        Ok(())
    }

    /// Every root must be absolute and free of traversal
    fn validate_paths(&self, paths: &PathsConfig) -> Result<(), ConfigError> {
        let roots: [(&str, &Path); 7] = [
            ("accounts_root", &paths.accounts_root),
            ("opt_root", &paths.opt_root),
            ("nginx_root", &paths.nginx_root),
            ("php_root", &paths.php_root),
            ("cgroup_root", &paths.cgroup_root),
            ("php_run_dir", &paths.php_run_dir),
            ("quota_mount", &paths.quota_mount),
        ];

        for (name, path) in roots {
            if !path.is_absolute() {
                return Err(ConfigError::ValidationError(format!(
                    "paths.{} must be absolute: {}",
                    name,
                    path.display()
                )));
            }

            let raw = path.to_string_lossy();
            if raw.contains("..") || raw.chars().any(char::is_whitespace) {
                return Err(ConfigError::ValidationError(format!(
                    "Potential path traversal detected in paths.{}: {}",
                    name, raw
                )));
            }
        }

        Ok(())
    }

    fn validate_exec(&self, exec: &ExecConfig) -> Result<(), ConfigError> {
        if exec.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Exec timeout cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_events(&self, events: &EventsConfig) -> Result<(), ConfigError> {
        if events.retention_days == 0 {
            return Err(ConfigError::ValidationError(
                "Event retention cannot be zero days".to_string(),
            ));
        }

        if events.prune_interval_hours == 0 {
            return Err(ConfigError::ValidationError(
                "Prune interval cannot be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates PHP version configuration
    fn validate_php(&self, php: &PhpConfig) -> Result<(), ConfigError> {
        if php.versions.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one PHP version must be configured".to_string(),
            ));
        }

        for version in &php.versions {
            let valid = version
                .split_once('.')
                .map(|(major, minor)| {
                    major.len() == 1
                        && minor.len() == 1
                        && major.chars().all(|c| c.is_ascii_digit())
                        && minor.chars().all(|c| c.is_ascii_digit())
                })
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid PHP version: {}",
                    version
                )));
            }
        }

        if !php.versions.contains(&php.default_version) {
            return Err(ConfigError::ValidationError(format!(
                "Default PHP version {} is not in the configured version list",
                php.default_version
            )));
        }

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}
