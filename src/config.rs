//! Bridge configuration
//!
//! Settings are parsed once from TOML, patched with the environment variables
//! the Home Assistant add-on exposes (`MQTT_HOST`, `MQTT_PORT`, `MQTT_USER`,
//! `MQTT_PASSWORD`, `MQTT_TOPIC`), validated, and then handed by value to each
//! component constructor.

use crate::protocol::topics::{canonicalize_topic, validate_base_topic};
use crate::transport::mqtt::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Searched in order when no configuration path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "solarbridge.toml",
    "config/solarbridge.toml",
    "/data/options.toml",
];

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub poll: PollSection,
}

/// Charge controller connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub host: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Bound on connect and on each request/response exchange
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
}

impl DeviceSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// MQTT broker session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub base_topic: String,
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Startup handshake attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// How long one handshake attempt waits for ConnAck
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Mid-run reconnection attempts before the session is declared lost;
    /// 0 retries forever
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: Vec<u64>,
    #[serde(default = "default_reconnect_sustained_delay")]
    pub reconnect_sustained_delay_ms: u64,
}

impl MqttSection {
    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        let max = self.reconnect_max_attempts;
        ReconnectConfig {
            max_attempts: (max > 0).then_some(max),
            backoff_pattern: self.reconnect_backoff_ms.clone(),
            sustained_delay: self.reconnect_sustained_delay_ms,
        }
    }
}

/// Poll loop timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollSection {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
}

impl PollSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
        }
    }
}

fn default_device_port() -> u16 {
    502
}

fn default_unit_id() -> u8 {
    1
}

fn default_device_timeout_ms() -> u64 {
    3000
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_attempts() -> u32 {
    5
}

fn default_connect_retry_delay_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_max_attempts() -> u32 {
    20
}

fn default_reconnect_backoff() -> Vec<u64> {
    vec![500, 1000, 2000, 5000]
}

fn default_reconnect_sustained_delay() -> u64 {
    5000
}

fn default_poll_interval() -> u64 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid port in {var}: {value}")]
    InvalidPort { var: String, value: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No configuration file found, searched: {searched}")]
    NotFound { searched: String },
}

impl BridgeConfig {
    /// Pick the configuration file: the explicit path, else the first
    /// existing candidate
    pub fn resolve_path(
        explicit: Option<&Path>,
        candidates: &[&str],
    ) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        candidates
            .iter()
            .map(Path::new)
            .find(|path| path.exists())
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::NotFound {
                searched: candidates.join(", "),
            })
    }

    /// Load configuration from a TOML file, apply environment overrides, validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content, |name| std::env::var(name).ok())
    }

    /// Parse TOML and apply overrides from an injectable variable lookup
    pub fn from_toml_with_env<F>(content: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: BridgeConfig = toml::from_str(content)?;
        config.apply_env_overrides(lookup)?;
        config.mqtt.base_topic = canonicalize_topic(&config.mqtt.base_topic);
        config.validate()?;
        Ok(config)
    }

    /// Overlay the add-on environment variables onto the MQTT section
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port.trim().parse().map_err(|_| ConfigError::InvalidPort {
                var: "MQTT_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(user) = lookup("MQTT_USER") {
            self.mqtt.username = Some(user);
        }
        if let Some(password) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(password);
        }
        if let Some(topic) = lookup("MQTT_TOPIC") {
            self.mqtt.base_topic = topic;
        }
        Ok(())
    }

    /// Check field ranges and consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidConfig(msg.to_string()));

        if self.device.host.trim().is_empty() {
            return invalid("device.host must not be empty");
        }
        if self.device.port == 0 {
            return invalid("device.port must be non-zero");
        }
        if self.device.timeout_ms == 0 {
            return invalid("device.timeout_ms must be greater than 0");
        }
        if self.mqtt.host.trim().is_empty() {
            return invalid("mqtt.host must not be empty");
        }
        if self.mqtt.port == 0 {
            return invalid("mqtt.port must be non-zero");
        }
        validate_base_topic(&self.mqtt.base_topic)
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.base_topic: {e}")))?;
        if let Some(client_id) = &self.mqtt.client_id {
            if client_id.is_empty() || client_id.starts_with(char::is_whitespace) {
                return invalid("mqtt.client_id must not be empty or start with whitespace");
            }
        }
        if self.mqtt.connect_attempts == 0 {
            return invalid("mqtt.connect_attempts must be at least 1");
        }
        if self.mqtt.connect_timeout_ms == 0 {
            return invalid("mqtt.connect_timeout_ms must be greater than 0");
        }
        if self.poll.interval_secs == 0 {
            return invalid("poll.interval_secs must be at least 1");
        }
        Ok(())
    }

    /// Copy with secrets masked, for display
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.mqtt.password.is_some() {
            copy.mqtt.password = Some("***".to_string());
        }
        copy
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
host = "127.0.0.1"

[mqtt]
host = "localhost"
base_topic = "solar"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
