//! # Configuration Management
//!
//! Centralized configuration for the frame engine, connections and channels.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()`
//!
//! ## Security Considerations
//! - The message size cap is checked against announced lengths, so a peer
//!   cannot make the engine buffer more than `max_message_size`
//! - The idle timeout bounds how long a silent peer holds resources

use crate::core::codec::Role;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Mode;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Max allowed logical message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload written in a single outbound frame
pub const MAX_FRAME_PAYLOAD: usize = crate::core::frame::DEFAULT_MAX_CHUNK;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Per-connection settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Channel settings
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Host/accept-loop settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("WS_CHANNELS_MODE") {
            config.connection.mode = match mode.to_ascii_lowercase().as_str() {
                "simple" => Mode::Simple,
                "advanced" => Mode::Advanced,
                other => {
                    return Err(ProtocolError::ConfigError(format!(
                        "Invalid WS_CHANNELS_MODE: '{other}' (expected 'simple' or 'advanced')"
                    )))
                }
            };
        }

        if let Ok(size) = std::env::var("WS_CHANNELS_MAX_MESSAGE_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.connection.max_message_size = val;
            }
        }

        if let Ok(queue) = std::env::var("WS_CHANNELS_OUTBOUND_QUEUE") {
            if let Ok(val) = queue.parse::<usize>() {
                config.connection.outbound_queue = val;
            }
        }

        if let Ok(heartbeat) = std::env::var("WS_CHANNELS_HEARTBEAT_INTERVAL_MS") {
            if let Ok(val) = heartbeat.parse::<u64>() {
                config.connection.heartbeat_interval = Duration::from_millis(val);
            }
        }

        if let Ok(idle) = std::env::var("WS_CHANNELS_IDLE_TIMEOUT_MS") {
            if let Ok(val) = idle.parse::<u64>() {
                config.connection.idle_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(max) = std::env::var("WS_CHANNELS_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.connection.validate());
        errors.extend(self.channel.validate());
        errors.extend(self.server.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Simple (payload only) or advanced (event + data) messaging
    pub mode: Mode,

    /// Local end of the connection; decides masking in both directions
    pub role: Role,

    /// Largest logical message accepted from the peer, in bytes
    pub max_message_size: usize,

    /// Largest payload written in one outbound frame; longer messages are fragmented
    pub max_frame_payload: usize,

    /// Maximum number of queued outbound messages before senders wait
    pub outbound_queue: usize,

    /// Maximum number of undelivered notifications per connection
    pub event_buffer: usize,

    /// Interval between keepalive pings
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Close the connection when the peer has been silent this long
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// How long to wait for the peer's close reply
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,

    /// How long `ping()` waits for a pong
    #[serde(with = "duration_serde")]
    pub pong_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Simple,
            role: Role::Server,
            max_message_size: MAX_MESSAGE_SIZE,
            max_frame_payload: MAX_FRAME_PAYLOAD,
            outbound_queue: 64,
            event_buffer: 64,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            idle_timeout: timeout::IDLE_TIMEOUT,
            close_timeout: timeout::CLOSE_TIMEOUT,
            pong_timeout: timeout::DEFAULT_TIMEOUT,
        }
    }
}

impl ConnectionConfig {
    /// Validate connection configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_message_size == 0 {
            errors.push("Max message size cannot be 0".to_string());
        } else if self.max_message_size > 1024 * 1024 * 1024 {
            errors.push(format!(
                "Max message size too large: {} bytes (maximum recommended: 1 GB)",
                self.max_message_size
            ));
        }

        if self.max_frame_payload == 0 {
            errors.push("Max frame payload cannot be 0".to_string());
        } else if self.max_frame_payload > self.max_message_size {
            errors.push("Max frame payload cannot be larger than max message size".to_string());
        }

        if self.outbound_queue == 0 {
            errors.push("Outbound queue must be greater than 0".to_string());
        } else if self.outbound_queue > 1_000_000 {
            errors.push(format!(
                "Outbound queue too large: {} (max recommended: 1,000,000)",
                self.outbound_queue
            ));
        }

        if self.event_buffer == 0 {
            errors.push("Event buffer must be greater than 0".to_string());
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.idle_timeout <= self.heartbeat_interval {
            errors.push("Idle timeout must be longer than the heartbeat interval".to_string());
        }

        if self.close_timeout.as_millis() < 10 {
            errors.push("Close timeout too short (minimum: 10ms)".to_string());
        } else if self.close_timeout.as_secs() > 60 {
            errors.push("Close timeout too long (maximum: 60s)".to_string());
        }

        if self.pong_timeout.as_millis() < 10 {
            errors.push("Pong timeout too short (minimum: 10ms)".to_string());
        }

        errors
    }
}

/// Channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Close a channel automatically when its last member leaves
    pub close_when_empty: bool,

    /// Capacity of each channel's notification buffer
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            close_when_empty: true,
            event_capacity: 128,
        }
    }
}

impl ChannelConfig {
    /// Validate channel configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.event_capacity == 0 {
            errors.push("Channel event capacity must be greater than 0".to_string());
        }
        errors
    }
}

/// Host and accept-loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Timeout for graceful shutdown
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 1_000_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.shutdown_timeout.as_secs() < 1 {
            errors.push("Shutdown timeout too short (minimum: 1s)".to_string());
        } else if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("websocket-channels"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
