//! Configuration loading for reverseqr-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`). Every
//! section and key has a default, so an empty file is a valid configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration for reverseqr-relay.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener configuration.
    pub server: ServerConfig,
    /// Blob storage configuration.
    pub storage: StorageConfig,
    /// Session registry configuration.
    pub sessions: SessionConfig,
    /// WebSocket signaling configuration.
    pub signaling: SignalingConfig,
    /// Rate limiting configuration.
    pub limits: LimitsConfig,
    /// Blob retention sweep configuration.
    pub cleanup: CleanupConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the HTTP/WebSocket listener (default: 0.0.0.0:3000).
    pub bind_address: String,
    /// Public base URL used to build join links (default: http://localhost:3000).
    pub base_url: String,
}

/// Blob storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding uploaded blobs (default: `uploads`).
    pub upload_dir: PathBuf,
    /// Maximum size of a single uploaded file in bytes (default: 5GB).
    pub max_file_size: u64,
    /// Maximum request body size in bytes (default: 5GB + 1MB).
    pub max_body_size: u64,
    /// Age after which a blob may be deleted, in seconds (default: 1 hour).
    pub retention_secs: u64,
}

/// Session registry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime in seconds (default: 15 minutes).
    pub ttl_secs: u64,
    /// Interval of the expired-session sweep in seconds (default: 5 minutes).
    pub sweep_interval_secs: u64,
}

/// WebSocket signaling configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Ping interval in seconds; a peer that misses one ping is dropped (default: 30).
    pub heartbeat_interval_secs: u64,
    /// Frames buffered per connection before new hints are dropped (default: 32).
    pub outbound_queue_depth: usize,
}

/// One fixed-window rate limit tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct WindowLimit {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Requests allowed per window.
    pub max_requests: u32,
}

impl WindowLimit {
    /// Window length as a Duration.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Shared by every request (default: 1000 per minute).
    pub global: WindowLimit,
    /// Per caller, all `/api` routes (default: 300 per 15 minutes).
    pub api: WindowLimit,
    /// Per caller, session creation (default: 20 per 15 minutes).
    pub session: WindowLimit,
    /// Per caller, message sends (default: 10 per 15 minutes).
    pub upload: WindowLimit,
}

/// Blob retention sweep configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Retention sweep interval in seconds (default: 3600 = 1 hour).
    pub interval_secs: u64,
    /// Enable the retention sweep (default: true).
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_max_file_size() -> u64 {
    5 * 1024 * 1024 * 1024 // 5GB
}

fn default_max_body_size() -> u64 {
    default_max_file_size() + 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            base_url: default_base_url(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            max_file_size: default_max_file_size(),
            max_body_size: default_max_body_size(),
            retention_secs: 60 * 60,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 15 * 60,
            sweep_interval_secs: 5 * 60,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            outbound_queue_depth: 32,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            global: WindowLimit {
                window_ms: 60_000,
                max_requests: 1000,
            },
            api: WindowLimit {
                window_ms: 15 * 60_000,
                max_requests: 300,
            },
            session: WindowLimit {
                window_ms: 15 * 60_000,
                max_requests: 20,
            },
            upload: WindowLimit {
                window_ms: 15 * 60_000,
                max_requests: 10,
            },
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            enabled: true,
        }
    }
}

impl StorageConfig {
    /// Retention window as a Duration.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl SessionConfig {
    /// Session lifetime as a Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Override the listen port, keeping the configured host.
    pub fn set_port(&mut self, port: u16) {
        let host = self
            .server
            .bind_address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        self.server.bind_address = format!("{host}:{port}");
    }

    /// Check values that would make the relay unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tiers = [
            ("limits.global", self.limits.global),
            ("limits.api", self.limits.api),
            ("limits.session", self.limits.session),
            ("limits.upload", self.limits.upload),
        ];
        for (field, tier) in tiers {
            if tier.window_ms == 0 || tier.max_requests == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "window_ms and max_requests must be > 0".to_string(),
                });
            }
        }

        let intervals = [
            ("sessions.ttl_secs", self.sessions.ttl_secs),
            ("sessions.sweep_interval_secs", self.sessions.sweep_interval_secs),
            (
                "signaling.heartbeat_interval_secs",
                self.signaling.heartbeat_interval_secs,
            ),
            ("cleanup.interval_secs", self.cleanup.interval_secs),
        ];
        for (field, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be > 0".to_string(),
                });
            }
        }

        if self.signaling.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "signaling.outbound_queue_depth",
                reason: "must be > 0".to_string(),
            });
        }

        if self.storage.max_body_size < self.storage.max_file_size {
            return Err(ConfigError::Invalid {
                field: "storage.max_body_size",
                reason: "must not be smaller than storage.max_file_size".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid configuration value {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending key.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
