use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::ChannelKey;

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_TERMINAL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} is not a valid url ({value}): {reason}")]
    InvalidUrl {
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("{field} uses unsupported scheme {scheme}")]
    UnsupportedScheme { field: &'static str, scheme: String },
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Delay strategy between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum Backoff {
    /// Wait `reconnect_delay_ms` before every attempt.
    #[default]
    Fixed,
    /// Multiply the delay by `factor` per attempt, capped at `max_delay_ms`.
    Exponential { factor: f64, max_delay_ms: u64 },
}

/// Per-channel connection behaviour. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub auto_connect: bool,
    pub reconnect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub backoff: Backoff,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            reconnect: true,
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            backoff: Backoff::Fixed,
        }
    }
}

impl ConnectionOptions {
    /// Zero falls back to the default; heartbeat is never disabled.
    pub fn heartbeat_interval(&self) -> Duration {
        let ms = if self.heartbeat_interval_ms == 0 {
            DEFAULT_HEARTBEAT_INTERVAL_MS
        } else {
            self.heartbeat_interval_ms
        };
        Duration::from_millis(ms)
    }

    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let base = self.reconnect_delay_ms;
        let ms = match &self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential {
                factor,
                max_delay_ms,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let scaled = base as f64 * factor.max(1.0).powi(exponent);
                if scaled.is_finite() {
                    (scaled as u64).min(*max_delay_ms)
                } else {
                    *max_delay_ms
                }
            }
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base of the REST api, e.g. `http://localhost:8000/api/v1`.
    pub api_base_url: String,
    /// Base of the push endpoints, e.g. `ws://localhost:8000`.
    pub ws_base_url: String,
    pub connection: ConnectionOptions,
    pub poll_interval_ms: u64,
    pub terminal_grace_ms: u64,
    pub request_timeout_ms: u64,
    /// Keep polling ids whose push channel is open.
    pub poll_while_push_open: bool,
    pub notification_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000/api/v1".to_string(),
            ws_base_url: "ws://localhost:8000".to_string(),
            connection: ConnectionOptions::default(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            terminal_grace_ms: DEFAULT_TERMINAL_GRACE_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            poll_while_push_open: true,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
        check_url("ws_base_url", &self.ws_base_url, &["ws", "wss"])?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("poll_interval_ms"));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ZeroInterval("request_timeout_ms"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn terminal_grace(&self) -> Duration {
        Duration::from_millis(self.terminal_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn channel_url(&self, channel: &ChannelKey) -> String {
        join_segments(&self.ws_base_url, &channel.segments())
    }

    /// `GET {api}/evaluations/{id}`
    pub fn evaluation_url(&self, id: &str) -> String {
        join_segments(&self.api_base_url, &["evaluations", id])
    }

    /// `GET {api}/evaluations`
    pub fn evaluations_url(&self) -> String {
        join_segments(&self.api_base_url, &["evaluations"])
    }
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|err| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::UnsupportedScheme {
            field,
            scheme: url.scheme().to_string(),
        });
    }
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
            reason: "cannot be a base".to_string(),
        });
    }
    Ok(())
}

fn join_segments(base: &str, segments: &[&str]) -> String {
    match Url::parse(base) {
        Ok(mut url) => {
            if let Ok(mut path) = url.path_segments_mut() {
                path.pop_if_empty().extend(segments);
            }
            url.into()
        }
        Err(_) => format!("{}/{}", base.trim_end_matches('/'), segments.join("/")),
    }
}
