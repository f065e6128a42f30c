//! Configuration management for Roster
//!
//! Values are layered, later sources winning:
//! 1. built-in defaults
//! 2. an optional config file (format picked from its extension)
//! 3. environment variables, e.g. `ROSTER_COORDINATOR__ADDRESS`
//! 4. explicit overrides (command line)

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Coordination backend the adapter talks to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Consul agent HTTP API (sessions + KV)
    #[default]
    Consul,
    /// In-process coordinator, single process only
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 3000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub backend: BackendKind,
    pub address: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub session_ttl_ms: u64,
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Consul,
            address: "127.0.0.1:8500".to_string(),
            connect_timeout_ms: 5000,
            request_timeout_ms: 10000,
            session_ttl_ms: 15000,
            retry: RetryConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Upper bound for a whole `get_all_brokers` scan
    pub scan_timeout_ms: u64,
    /// Upper bound for reading one entry during a scan
    pub read_timeout_ms: u64,
    /// Upper bound for one subscriber handler invocation
    pub handler_timeout_ms: u64,
    /// How long `register` waits for an entry owned by another session to
    /// expire before reporting a duplicate id. Zero fails immediately.
    pub takeover_wait_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10000,
            read_timeout_ms: 2000,
            handler_timeout_ms: 5000,
            takeover_wait_ms: 0,
        }
    }
}

impl MembershipConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn takeover_wait(&self) -> Duration {
        Duration::from_millis(self.takeover_wait_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Directory for the rolling log file, `None` keeps the default location
    pub dir: Option<String>,
    pub file: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file: false,
        }
    }
}

/// Application configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterConfig {
    pub coordinator: CoordinatorConfig,
    pub registry: MembershipConfig,
    pub logging: LoggingSettings,
}

impl RosterConfig {
    /// Load configuration from defaults, `file`, the environment and `overrides`.
    ///
    /// Override keys use dotted paths, e.g. `coordinator.address`.
    pub fn load<K, V>(file: Option<&Path>, overrides: &[(K, V)]) -> Result<Self, ConfigError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut builder = Config::builder().add_source(Config::try_from(&RosterConfig::default())?);

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("ROSTER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in overrides {
            builder = builder.set_override(key.as_ref(), value.as_ref())?;
        }

        let loaded: RosterConfig = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject settings the registry cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let coordinator = &self.coordinator;
        if coordinator.address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "coordinator.address must not be empty".to_string(),
            ));
        }

        let positive = [
            ("coordinator.connect_timeout_ms", coordinator.connect_timeout_ms),
            ("coordinator.request_timeout_ms", coordinator.request_timeout_ms),
            ("coordinator.session_ttl_ms", coordinator.session_ttl_ms),
            ("registry.scan_timeout_ms", self.registry.scan_timeout_ms),
            ("registry.read_timeout_ms", self.registry.read_timeout_ms),
            ("registry.handler_timeout_ms", self.registry.handler_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        let retry = &coordinator.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "coordinator.retry.max_attempts must be positive".to_string(),
            ));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ConfigError::Invalid(format!(
                "coordinator.retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                retry.initial_backoff_ms, retry.max_backoff_ms
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RosterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.coordinator.backend, BackendKind::Consul);
        assert_eq!(config.coordinator.session_ttl(), Duration::from_secs(15));
        assert_eq!(config.registry.takeover_wait(), Duration::ZERO);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = RosterConfig::default();
        config.coordinator.retry.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = RosterConfig::default();
        config.coordinator.retry.initial_backoff_ms = 5000;
        config.coordinator.retry.max_backoff_ms = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = RosterConfig::default();
        config.registry.read_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("registry.read_timeout_ms"));
    }

    #[test]
    fn test_overrides_apply() {
        let config = RosterConfig::load(
            None,
            &[
                ("coordinator.address", "10.1.1.1:8500"),
                ("coordinator.backend", "memory"),
            ],
        )
        .unwrap();
        assert_eq!(config.coordinator.address, "10.1.1.1:8500");
        assert_eq!(config.coordinator.backend, BackendKind::Memory);
    }
}
