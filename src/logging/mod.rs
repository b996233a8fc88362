//! Logging setup and the per-request access record.
//!
//! The library only emits `tracing` events. [`init`] installs a
//! `tracing-subscriber` formatter for the binary; `RUST_LOG` takes precedence
//! over the configured level.

use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::http::{Request, Response};

/// Target of access-log events, usable in `RUST_LOG` filters.
pub const ACCESS_TARGET: &str = "sheetcache::access";

/// Output format of the log subscriber.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging section of the configuration file.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `sheetcache=debug`.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: LogFormat::Pretty,
        }
    }
}

/// Installs the global subscriber.
///
/// Does nothing if a subscriber is already installed.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };

    if let Err(err) = result {
        tracing::debug!(error = %err, "log subscriber already installed");
    }
}

/// One request/response pair, as written to the access log.
#[derive(Debug)]
pub struct AccessRecord<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub protocol: &'static str,
    pub host: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub status: u16,
    pub timestamp: SystemTime,
    pub content_type: Option<&'a str>,
    pub content_length: usize,
    pub elapsed: Duration,
}

impl<'a> AccessRecord<'a> {
    pub fn new(request: &'a Request, response: &'a Response, elapsed: Duration) -> Self {
        Self {
            method: request.method().as_str(),
            path: request.path(),
            protocol: request.protocol(),
            host: request.host(),
            user_agent: request.user_agent(),
            status: response.status().as_u16(),
            timestamp: SystemTime::now(),
            content_type: response.media_type(),
            content_length: response.content_length(),
            elapsed,
        }
    }

    /// Writes the record as a single `info` event.
    pub fn emit(&self) {
        tracing::info!(
            target: ACCESS_TARGET,
            method = self.method,
            path = self.path,
            protocol = self.protocol,
            host = self.host.unwrap_or("-"),
            user_agent = self.user_agent.unwrap_or("-"),
            status = self.status,
            timestamp = %humantime::format_rfc3339_millis(self.timestamp),
            content_type = self.content_type.unwrap_or("-"),
            content_length = self.content_length,
            elapsed = ?self.elapsed,
            "{} {} - {}",
            self.method,
            self.path,
            self.status,
        );
    }
}
