//! Runtime configuration, loaded from TOML with env/default fallback.
//!
//! Loading hierarchy: explicit file > defaults. Mirrors the layering used
//! by the wider workspace's configuration crate.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables for a [`crate::scheduler::Scheduler`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum non-blocking retries a single logical socket operation may
    /// make before yielding once to the tail of the run queue.
    pub max_io_calls: u32,
    /// Default per-operation timeout in milliseconds applied to new
    /// sockets when no explicit `timeout()` call has been made. `0` means
    /// no default deadline.
    pub default_timeout_ms: u64,
    /// Capacity hint for the poller's readiness event batch.
    pub poll_event_capacity: usize,
    /// Default number of peer schedulers `spawn()` creates when not told
    /// otherwise.
    pub default_peer_count: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_io_calls: 10,
            default_timeout_ms: 0,
            poll_event_capacity: 128,
            default_peer_count: num_cpus::get().max(1),
        }
    }
}

/// Errors produced while loading or validating a [`RuntimeConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[source] std::io::Error),
    /// The config file was not valid TOML, or did not match the schema.
    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
    /// The config parsed but violated an invariant.
    #[error("invalid config: {0}")]
    Validation(String),
}

impl RuntimeConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults if the
    /// file does not exist.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_io_calls == 0 {
            return Err(ConfigError::Validation(
                "max_io_calls must be at least 1".into(),
            ));
        }
        if self.poll_event_capacity == 0 {
            return Err(ConfigError::Validation(
                "poll_event_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let cfg = RuntimeConfig::from_toml_str("max_io_calls = 4\n").unwrap();
        assert_eq!(cfg.max_io_calls, 4);
        assert_eq!(cfg.poll_event_capacity, 128);
    }

    #[test]
    fn rejects_zero_io_calls() {
        let err = RuntimeConfig::from_toml_str("max_io_calls = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = RuntimeConfig::from_file("/nonexistent/evloop.toml").unwrap();
        assert_eq!(cfg.max_io_calls, RuntimeConfig::default().max_io_calls);
    }

    #[test]
    fn loads_from_a_real_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evloop.toml");
        std::fs::write(&path, "max_io_calls = 64\ndefault_timeout_ms = 5000\n").unwrap();

        let cfg = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(cfg.max_io_calls, 64);
        assert_eq!(cfg.default_timeout_ms, 5000);
        assert_eq!(cfg.poll_event_capacity, RuntimeConfig::default().poll_event_capacity);
    }

    #[test]
    fn malformed_file_on_disk_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evloop.toml");
        std::fs::write(&path, "max_io_calls = \"not a number\"\n").unwrap();

        assert!(matches!(RuntimeConfig::from_file(&path), Err(ConfigError::Parse(_))));
    }
}
