//! Bridge configuration loaded from TOML
//!
//! The loaded [`BridgeConfig`] is validated and has its environment-sourced
//! credentials resolved before anything else in the process sees it.

use crate::peripheral::codec::PayloadFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub ble: BleSection,
    /// Peripherals to bridge, in connect/disconnect order
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

/// Broker connection parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: Option<String>,
    /// Literal password; replaced by the value of `password_env` when that is set
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Leading topic segment
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Overrides the hostname as MQTT client identifier
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_disconnect_linger")]
    pub disconnect_linger_ms: u64,
    #[serde(default = "default_probe_topic")]
    pub probe_topic: String,
}

fn default_port() -> u16 {
    1883
}

fn default_namespace() -> String {
    "prometheus".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_disconnect_linger() -> u64 {
    250
}

fn default_probe_topic() -> String {
    "testTopic".to_string()
}

impl MqttSection {
    /// `tcp://host:port` rendering used in logs
    pub fn server(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn disconnect_linger(&self) -> Duration {
        Duration::from_millis(self.disconnect_linger_ms)
    }
}

/// Notification pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Per-device reading channel capacity
    #[serde(default = "default_reading_buffer")]
    pub reading_buffer: usize,
    /// How long shutdown waits for queued readings to be published
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

fn default_reading_buffer() -> usize {
    32
}

fn default_drain_timeout() -> u64 {
    1000
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            reading_buffer: default_reading_buffer(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl BridgeSection {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Bluetooth LE host settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BleSection {
    /// Index into the adapters reported by the platform
    #[serde(default)]
    pub adapter: usize,
    #[serde(default)]
    pub format: PayloadFormat,
    /// Notify characteristic UUID; defaults to the one implied by `format`
    pub characteristic: Option<String>,
    #[serde(default = "default_scan_timeout")]
    pub scan_timeout_secs: u64,
}

fn default_scan_timeout() -> u64 {
    15
}

impl Default for BleSection {
    fn default() -> Self {
        Self {
            adapter: 0,
            format: PayloadFormat::default(),
            characteristic: None,
            scan_timeout_secs: default_scan_timeout(),
        }
    }
}

/// A configured peripheral
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Unique name, used as a topic segment
    pub name: String,
    /// Peripheral address
    pub addr: String,
}

impl DeviceDescriptor {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid {field} '{value}': must be non-empty and contain no '/', '+' or '#'")]
    InvalidTopicSegment { field: &'static str, value: String },
    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unable to determine hostname for client ID: {0}")]
    Hostname(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file, validating it and resolving credentials
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse, validate and resolve a configuration document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        config.resolve_env_vars()?;
        Ok(config)
    }

    /// Check every field constraint the bridge relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.host must not be empty".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be greater than 0".to_string(),
            ));
        }
        // Bridge floor; rumqttc itself only panics below one second
        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                self.mqtt.keep_alive_secs
            )));
        }
        for (field, value) in [
            ("mqtt.ping_timeout_secs", self.mqtt.ping_timeout_secs),
            ("mqtt.connect_timeout_secs", self.mqtt.connect_timeout_secs),
            ("ble.scan_timeout_secs", self.ble.scan_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{field} must be greater than 0"
                )));
            }
        }
        if self.bridge.reading_buffer == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.reading_buffer must be greater than 0".to_string(),
            ));
        }

        validate_topic_segment("mqtt.namespace", &self.mqtt.namespace)?;
        if let Some(client_id) = &self.mqtt.client_id {
            validate_topic_segment("mqtt.client_id", client_id)?;
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            validate_topic_segment("device name", &device.name)?;
            if device.addr.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "device '{}' has an empty addr",
                    device.name
                )));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::DuplicateDevice(device.name.clone()));
            }
        }

        Ok(())
    }

    fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(env_name) = &self.mqtt.password_env {
            let password = std::env::var(env_name)
                .map_err(|_| ConfigError::EnvVarNotFound(env_name.clone()))?;
            self.mqtt.password = Some(password);
        }
        Ok(())
    }

    /// Client identifier: the configured override, or the process hostname
    pub fn resolve_client_id(&self) -> Result<String, ConfigError> {
        if let Some(client_id) = &self.mqtt.client_id {
            return Ok(client_id.clone());
        }

        let hostname = hostname::get().map_err(|e| ConfigError::Hostname(e.to_string()))?;
        let hostname = hostname
            .into_string()
            .map_err(|raw| ConfigError::Hostname(format!("non UTF-8 hostname {raw:?}")))?;
        validate_topic_segment("hostname", &hostname)
            .map_err(|e| ConfigError::Hostname(e.to_string()))?;
        Ok(hostname)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
host = "localhost"
client_id = "host1"

[[devices]]
name = "sensor-a"
addr = "A4:C1:38:00:00:01"

[[devices]]
name = "sensor-b"
addr = "A4:C1:38:00:00:02"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Topic segments must not contain the level separator or wildcards
fn validate_topic_segment(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = value.is_empty() || value.contains(|c| matches!(c, '/' | '+' | '#'));
    if invalid {
        return Err(ConfigError::InvalidTopicSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}
