//! Service Configuration Settings
//!
//! Configuration types for the portfolio stream service, loaded from
//! environment variables.

use std::time::Duration;

use crate::infrastructure::stream::heartbeat::HeartbeatConfig;
use crate::infrastructure::stream::manager::StreamConfig;
use crate::infrastructure::stream::reconnect::ReconnectConfig;

/// Connection-related settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// WebSocket URL of the market data server.
    pub url: String,
    /// Maximum reconnection attempts before entering the failed state.
    pub reconnect_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub reconnect_base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub reconnect_cap_delay: Duration,
    /// Interval between outbound heartbeat frames.
    pub heartbeat_interval: Duration,
    /// Maximum time for a transport open to complete.
    pub connection_timeout: Duration,
}

impl ConnectionSettings {
    fn with_url(url: String) -> Self {
        Self {
            url,
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_millis(1000),
            reconnect_cap_delay: Duration::from_millis(30_000),
            heartbeat_interval: Duration::from_millis(30_000),
            connection_timeout: Duration::from_millis(10_000),
        }
    }
}

/// Portfolio pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Cadence of coalescing-queue flushes.
    pub flush_interval: Duration,
    /// Cadence of snapshot republication for late subscribers
    /// (0 = disabled).
    pub snapshot_refresh_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
            snapshot_refresh_interval: Duration::ZERO,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Connection settings.
    pub connection: ConnectionSettings,
    /// Portfolio pipeline settings.
    pub pipeline: PipelineSettings,
}

impl ServiceConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `STREAM_URL` is missing or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("STREAM_URL")
            .map_err(|_| ConfigError::MissingEnvVar("STREAM_URL".to_string()))?;
        if url.is_empty() {
            return Err(ConfigError::EmptyValue("STREAM_URL".to_string()));
        }

        let defaults = ConnectionSettings::with_url(url.clone());
        let connection = ConnectionSettings {
            url,
            reconnect_attempts: parse_env_u32(
                "STREAM_RECONNECT_ATTEMPTS",
                defaults.reconnect_attempts,
            ),
            reconnect_base_delay: parse_env_duration_millis(
                "STREAM_RECONNECT_BASE_DELAY_MS",
                defaults.reconnect_base_delay,
            ),
            reconnect_cap_delay: parse_env_duration_millis(
                "STREAM_RECONNECT_CAP_DELAY_MS",
                defaults.reconnect_cap_delay,
            ),
            heartbeat_interval: parse_env_duration_millis(
                "STREAM_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            connection_timeout: parse_env_duration_millis(
                "STREAM_CONNECTION_TIMEOUT_MS",
                defaults.connection_timeout,
            ),
        };

        let pipeline = PipelineSettings {
            flush_interval: parse_env_duration_millis(
                "STREAM_FLUSH_INTERVAL_MS",
                PipelineSettings::default().flush_interval,
            ),
            snapshot_refresh_interval: parse_env_duration_millis(
                "STREAM_SNAPSHOT_REFRESH_INTERVAL_MS",
                PipelineSettings::default().snapshot_refresh_interval,
            ),
        };

        Ok(Self {
            connection,
            pipeline,
        })
    }

    /// Build a [`StreamConfig`] for the connection manager.
    #[must_use]
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            url: self.connection.url.clone(),
            reconnect: ReconnectConfig {
                base_delay: self.connection.reconnect_base_delay,
                cap_delay: self.connection.reconnect_cap_delay,
                max_attempts: self.connection.reconnect_attempts,
                jitter_factor: 0.0,
            },
            heartbeat: HeartbeatConfig::new(self.connection.heartbeat_interval),
            connection_timeout: self.connection.connection_timeout,
        }
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_millis)
}
