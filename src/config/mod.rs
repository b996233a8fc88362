//! Server configuration.
//!
//! Loaded from an optional JSON file. Every section has defaults, so an empty
//! object (or no file at all) yields a working server on `127.0.0.1:5050`
//! serving the current directory.
//!
//! ```json
//! {
//!   "bind": "0.0.0.0:5050",
//!   "root": "/srv/csv",
//!   "cache": { "capacity": 256, "ttl": "10m", "wait_timeout": "30s" },
//!   "server": { "max_connections": 512, "shutdown_grace": "5s", "idle_timeout": "30s" },
//!   "logging": { "level": "info", "format": "json" }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::logging::LoggingConfig;

/// Errors raised while loading the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Connection handling limits.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Upper bound on connections served at the same time.
    pub max_connections: usize,

    /// How long shutdown waits for open connections before aborting them.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// How long a connection may sit without sending data before it is
    /// closed and its slot released.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            shutdown_grace: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// Top-level configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Socket address to listen on.
    pub bind: String,
    /// Directory that request paths are resolved against.
    pub root: PathBuf,
    pub cache: CacheConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5050".to_owned(),
            root: PathBuf::from("."),
            cache: CacheConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `path`, or the defaults if `None`.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or parsed, or if the result does not
    /// pass [`validate`](Self::validate).
    pub fn get(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Rejects settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate().map_err(ConfigError::Invalid)?;
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "server.max_connections must be at least 1",
            ));
        }
        if self.server.idle_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "server.idle_timeout must be greater than zero",
            ));
        }
        if self.bind.trim().is_empty() {
            return Err(ConfigError::Invalid("bind must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_is_default() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn durations_are_human_readable() {
        let config: Config = serde_json::from_str(
            r#"{ "cache": { "capacity": 3, "ttl": "10m", "wait_timeout": "250ms" } }"#,
        )
        .unwrap();
        assert_eq!(config.cache.capacity, 3);
        assert_eq!(config.cache.ttl, Duration::from_secs(600));
        assert_eq!(config.cache.wait_timeout, Duration::from_millis(250));
        assert_eq!(config.cache.lock_timeout, CacheConfig::default().lock_timeout);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config: Config = serde_json::from_str(r#"{ "cache": { "capacity": 0 } }"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn idle_timeout_is_configurable() {
        let config: Config =
            serde_json::from_str(r#"{ "server": { "idle_timeout": "2s" } }"#).unwrap();
        assert_eq!(config.server.idle_timeout, Duration::from_secs(2));
        assert_eq!(config.server.max_connections, ServerConfig::default().max_connections);

        let zero: Config =
            serde_json::from_str(r#"{ "server": { "idle_timeout": "0s" } }"#).unwrap();
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheetcache.json");
        std::fs::write(&path, r#"{ "bind": "0.0.0.0:8080", "root": "/srv" }"#).unwrap();

        let config = Config::get(Some(&path)).unwrap();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.root, PathBuf::from("/srv"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::get(Some(Path::new("/nonexistent/sheetcache.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
