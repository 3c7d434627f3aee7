//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment
//! variables. Environment detection (cluster mode, pod identity, extra
//! bypass entries) happens here so the rest of the crate never reads the
//! process environment.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}")))?;

    config.validate()?;

    info!(
        "Configuration loaded: {} proxy on {}:{}",
        config.server.protocol, config.server.bind_host, config.server.port
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment overrides applied
///
/// Environment variables:
/// - `PROXY_RELAY_PORT`: Override the requested listen port
/// - `PROXY_RELAY_PROTOCOL`: Override the protocol kind (socks5/http)
/// - `PROXY_RELAY_LOG_LEVEL`: Override the log level
/// - `PROXY_BYPASS_HOSTS`: Comma-separated extra bypass entries
/// - `KUBERNETES_SERVICE_HOST`: Presence enables cluster mode (unless the
///   config pins `cluster_mode` explicitly)
/// - `HOSTNAME`: Pod identity reported in stats snapshots
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing, or an override is invalid.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env(&mut config)?;
    Ok(config)
}

/// Apply environment overrides and environment detection to a configuration
///
/// # Errors
///
/// Returns `ConfigError::EnvError` if an override value cannot be parsed.
pub fn apply_env(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(port) = std::env::var("PROXY_RELAY_PORT") {
        config.server.port = port.parse().map_err(|_| ConfigError::EnvError {
            name: "PROXY_RELAY_PORT".into(),
            reason: format!("Invalid port number: {port}"),
        })?;
        debug!("Listen port overridden to {}", config.server.port);
    }

    if let Ok(protocol) = std::env::var("PROXY_RELAY_PROTOCOL") {
        config.server.protocol = protocol.parse().map_err(|_| ConfigError::EnvError {
            name: "PROXY_RELAY_PROTOCOL".into(),
            reason: format!("Invalid protocol kind: {protocol}"),
        })?;
        debug!("Protocol overridden to {}", config.server.protocol);
    }

    if let Ok(level) = std::env::var("PROXY_RELAY_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(extra) = std::env::var("PROXY_BYPASS_HOSTS") {
        let entries = extra
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from);
        config.bypass.hosts.extend(entries);
        debug!("Bypass entries from environment: {:?}", config.bypass.hosts);
    }

    if config.server.cluster_mode.is_none() {
        let detected = std::env::var("KUBERNETES_SERVICE_HOST").is_ok();
        config.server.cluster_mode = Some(detected);
        if detected {
            info!("Cluster environment detected, dynamic port search enabled");
        }
    }

    if config.server.pod_name.is_none() {
        config.server.pod_name = std::env::var("HOSTNAME").ok();
    }

    config.validate()?;

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
