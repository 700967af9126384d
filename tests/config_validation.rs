//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use std::io::Write;
use std::time::Duration;
use tracing::Level;
use websocket_channels::config::{ChannelConfig, ConnectionConfig, EngineConfig, LoggingConfig, ServerConfig};
use websocket_channels::{Mode, ProtocolError, Role};

#[test]
fn test_default_config_validates() {
    let config = EngineConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_defaults_match_documented_values() {
    let config = EngineConfig::default();
    assert_eq!(config.connection.mode, Mode::Simple);
    assert_eq!(config.connection.role, Role::Server);
    assert_eq!(config.connection.max_message_size, 16 * 1024 * 1024);
    assert_eq!(config.connection.max_frame_payload, 65535);
    assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(config.connection.idle_timeout, Duration::from_secs(60));
    assert!(config.channel.close_when_empty);
    assert_eq!(config.server.max_connections, 10_000);
}

#[test]
fn test_zero_max_message_size() {
    let mut config = EngineConfig::default();
    config.connection.max_message_size = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max message size cannot be 0")));
}

#[test]
fn test_frame_payload_larger_than_message() {
    let mut config = EngineConfig::default();
    config.connection.max_message_size = 1024;
    config.connection.max_frame_payload = 4096;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("cannot be larger than max message size")));
}

#[test]
fn test_zero_outbound_queue() {
    let mut config = EngineConfig::default();
    config.connection.outbound_queue = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Outbound queue must be greater than 0")));
}

#[test]
fn test_excessive_outbound_queue() {
    let mut config = EngineConfig::default();
    config.connection.outbound_queue = 2_000_000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Outbound queue too large")));
}

#[test]
fn test_heartbeat_bounds() {
    let mut config = ConnectionConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..ConnectionConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Heartbeat interval too short")));

    config.heartbeat_interval = Duration::from_secs(7200);
    config.idle_timeout = Duration::from_secs(8000);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Heartbeat interval too long")));
}

#[test]
fn test_idle_timeout_must_exceed_heartbeat() {
    let config = ConnectionConfig {
        heartbeat_interval: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(30),
        ..ConnectionConfig::default()
    };

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Idle timeout must be longer than the heartbeat interval")));
}

#[test]
fn test_zero_channel_event_capacity() {
    let config = ChannelConfig {
        event_capacity: 0,
        ..ChannelConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Channel event capacity must be greater than 0")));
}

#[test]
fn test_server_limits() {
    let mut config = ServerConfig {
        max_connections: 0,
        ..ServerConfig::default()
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));

    config.max_connections = 100;
    config.shutdown_timeout = Duration::from_millis(500);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too short")));
}

#[test]
fn test_empty_app_name() {
    let config = LoggingConfig {
        app_name: String::new(),
        log_level: Level::DEBUG,
        json_format: true,
    };
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_multiple_errors_are_collected() {
    let mut config = EngineConfig::default();
    config.connection.outbound_queue = 0;
    config.connection.event_buffer = 0;
    config.server.max_connections = 0;

    assert!(config.validate().len() >= 3);
}

#[test]
fn test_validate_strict_reports_config_error() {
    let mut config = EngineConfig::default();
    config.connection.max_message_size = 0;

    match config.validate_strict() {
        Err(ProtocolError::ConfigError(msg)) => {
            assert!(msg.contains("Configuration validation failed"));
        }
        other => panic!("expected ConfigError, got {:?}", other),
    }
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = EngineConfig::from_toml(
        r#"
        [connection]
        mode = "advanced"
        heartbeat_interval = 5000
        idle_timeout = 15000

        [channel]
        close_when_empty = false
        "#,
    )
    .expect("TOML should parse");

    assert_eq!(config.connection.mode, Mode::Advanced);
    assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(5));
    assert_eq!(config.connection.idle_timeout, Duration::from_secs(15));
    assert_eq!(config.connection.outbound_queue, 64);
    assert!(!config.channel.close_when_empty);
    assert!(config.validate().is_empty());
}

#[test]
fn test_invalid_toml_is_config_error() {
    let result = EngineConfig::from_toml("[connection\nmode = ");
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}

#[test]
fn test_file_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("engine.toml");

    let config = EngineConfig::default_with_overrides(|c| {
        c.connection.role = Role::Client;
        c.server.max_connections = 42;
    });
    config.save_to_file(&path).expect("save");

    let loaded = EngineConfig::from_file(&path).expect("load");
    assert_eq!(loaded.connection.role, Role::Client);
    assert_eq!(loaded.server.max_connections, 42);
}

#[test]
fn test_example_config_parses() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(EngineConfig::example_config().as_bytes())
        .expect("write");

    let loaded = EngineConfig::from_file(file.path()).expect("example config should load");
    assert!(loaded.validate().is_empty());
}

#[test]
fn test_missing_file_is_config_error() {
    let result = EngineConfig::from_file("/nonexistent/engine.toml");
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}
