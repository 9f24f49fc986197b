//! Daemon configuration.
//!
//! Parsed from a TOML file; every knob has a default so a minimal config is
//! just the two paths. Validation is fail-closed: a config that would make
//! the daemon silently misbehave (zero batch size, empty environment name)
//! is rejected at load.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// Could not read the config file.
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML failed to parse.
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The parsed config is not usable.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// SQLite database path.
    pub database_path: PathBuf,

    /// Directory the agents' uploaded publication files land in.
    pub intake_dir: PathBuf,

    /// Environment name used when a publication reports an empty one.
    #[serde(default = "default_environment")]
    pub default_environment: String,

    /// Days a silent JVM is retained before the weeding task reclaims it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Upper bound on a blocking lock wait.
    #[serde(default = "default_lock_wait_seconds")]
    pub lock_wait_seconds: u64,

    /// Age after which a lock row left by a crashed holder may be taken
    /// over.
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,

    /// Events drained per receiver poll.
    #[serde(default = "default_receiver_batch_size")]
    pub receiver_batch_size: usize,

    /// Seconds between intake directory sweeps.
    #[serde(default = "default_intake_sweep_seconds")]
    pub intake_sweep_seconds: u64,

    /// Seconds between receiver polls.
    #[serde(default = "default_receiver_poll_seconds")]
    pub receiver_poll_seconds: u64,

    /// Seconds between weeding runs.
    #[serde(default = "default_weeding_interval_seconds")]
    pub weeding_interval_seconds: u64,
}

fn default_environment() -> String {
    "<default>".to_string()
}
const fn default_retention_days() -> u32 {
    30
}
const fn default_lock_wait_seconds() -> u64 {
    20
}
const fn default_lock_ttl_seconds() -> u64 {
    300
}
const fn default_receiver_batch_size() -> usize {
    100
}
const fn default_intake_sweep_seconds() -> u64 {
    30
}
const fn default_receiver_poll_seconds() -> u64 {
    10
}
const fn default_weeding_interval_seconds() -> u64 {
    600
}

impl DaemonConfig {
    /// Loads and validates configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on read, parse, or validation failure.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on parse or validation failure.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_environment.trim().is_empty() {
            return Err(ConfigError::Validation(
                "default_environment must not be empty".to_string(),
            ));
        }
        if self.receiver_batch_size == 0 {
            return Err(ConfigError::Validation(
                "receiver_batch_size must be at least 1".to_string(),
            ));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::Validation(
                "retention_days must be at least 1".to_string(),
            ));
        }
        if self.lock_wait_seconds == 0 || self.lock_ttl_seconds == 0 {
            return Err(ConfigError::Validation(
                "lock_wait_seconds and lock_ttl_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Bounded lock wait as a [`Duration`].
    #[must_use]
    pub const fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_seconds)
    }

    /// Lock takeover TTL as a [`Duration`].
    #[must_use]
    pub const fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    /// Retention boundary in milliseconds.
    #[must_use]
    pub const fn retention_millis(&self) -> i64 {
        self.retention_days as i64 * 24 * 60 * 60 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = DaemonConfig::from_toml(
            r#"
            database_path = "/var/lib/deadwood/deadwood.db"
            intake_dir = "/var/lib/deadwood/intake"
            "#,
        )
        .expect("minimal config must load");

        assert_eq!(config.default_environment, "<default>");
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.receiver_batch_size, 100);
        assert_eq!(config.lock_wait_seconds, 20);
    }

    #[test]
    fn config_loads_from_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let path = dir.path().join("deadwoodd.toml");
        std::fs::write(
            &path,
            r#"
            database_path = "/var/lib/deadwood/deadwood.db"
            intake_dir = "/var/lib/deadwood/intake"
            retention_days = 7
            "#,
        )
        .expect("write config");

        let config = DaemonConfig::from_file(&path).expect("load");
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.retention_millis(), 7 * 24 * 60 * 60 * 1000);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let result = DaemonConfig::from_toml(
            r#"
            database_path = "dw.db"
            intake_dir = "intake"
            receiver_batch_size = 0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn empty_default_environment_is_rejected() {
        let result = DaemonConfig::from_toml(
            r#"
            database_path = "dw.db"
            intake_dir = "intake"
            default_environment = " "
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
