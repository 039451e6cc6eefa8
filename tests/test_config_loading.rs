//! Configuration loading and validation tests
//!
//! Tests focus on behavior of loading, environment overrides and validation.

use solarbridge::config::{BridgeConfig, ConfigError};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

const MINIMAL: &str = r#"
[device]
host = "192.168.1.50"

[mqtt]
host = "broker.local"
base_topic = "solar"
"#;

fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    write!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[device]
host = "192.168.1.50"
port = 5020
unit_id = 3
timeout_ms = 1500

[mqtt]
host = "broker.local"
port = 8883
username = "bridge"
password = "hunter2"
base_topic = "home/solar"
client_id = "solarbridge-garage"
connect_attempts = 3

[poll]
interval_secs = 30
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.device.host, "192.168.1.50");
    assert_eq!(config.device.port, 5020);
    assert_eq!(config.device.unit_id, 3);
    assert_eq!(config.device.timeout(), Duration::from_millis(1500));
    assert_eq!(config.mqtt.port, 8883);
    assert_eq!(config.mqtt.username.as_deref(), Some("bridge"));
    assert_eq!(config.mqtt.base_topic, "home/solar");
    assert_eq!(config.mqtt.client_id.as_deref(), Some("solarbridge-garage"));
    assert_eq!(config.mqtt.connect_attempts, 3);
    assert_eq!(config.poll.interval(), Duration::from_secs(30));
}

#[test]
fn test_defaults_fill_optional_settings() {
    let config = BridgeConfig::from_toml_with_env(MINIMAL, env(&[])).unwrap();

    assert_eq!(config.device.port, 502);
    assert_eq!(config.device.unit_id, 1);
    assert_eq!(config.device.timeout_ms, 3000);
    assert_eq!(config.mqtt.port, 1883);
    assert_eq!(config.mqtt.username, None);
    assert_eq!(config.mqtt.client_id, None);
    assert_eq!(config.mqtt.keep_alive_secs, 60);
    assert_eq!(config.mqtt.connect_attempts, 5);
    assert_eq!(config.mqtt.connect_retry_delay(), Duration::from_secs(5));
    assert_eq!(config.mqtt.reconnect_max_attempts, 20);
    assert_eq!(config.mqtt.reconnect_backoff_ms, vec![500, 1000, 2000, 5000]);
    assert_eq!(config.poll.interval_secs, 10);
}

#[test]
fn test_environment_overrides_mqtt_settings() {
    let config = BridgeConfig::from_toml_with_env(
        MINIMAL,
        env(&[
            ("MQTT_HOST", "core-mosquitto"),
            ("MQTT_PORT", "1884"),
            ("MQTT_USER", "addon"),
            ("MQTT_PASSWORD", "s3cret"),
            ("MQTT_TOPIC", "epever"),
        ]),
    )
    .unwrap();

    assert_eq!(config.mqtt.host, "core-mosquitto");
    assert_eq!(config.mqtt.port, 1884);
    assert_eq!(config.mqtt.username.as_deref(), Some("addon"));
    assert_eq!(config.mqtt.password.as_deref(), Some("s3cret"));
    assert_eq!(config.mqtt.base_topic, "epever");
    // Device settings are never overridden
    assert_eq!(config.device.host, "192.168.1.50");
}

#[test]
fn test_invalid_port_override_is_rejected() {
    let result = BridgeConfig::from_toml_with_env(MINIMAL, env(&[("MQTT_PORT", "not-a-port")]));

    match result {
        Err(ConfigError::InvalidPort { var, value }) => {
            assert_eq!(var, "MQTT_PORT");
            assert_eq!(value, "not-a-port");
        }
        other => panic!("expected InvalidPort, got {other:?}"),
    }
}

#[test]
fn test_base_topic_is_canonicalized() {
    let config =
        BridgeConfig::from_toml_with_env(MINIMAL, env(&[("MQTT_TOPIC", "/home//solar/")])).unwrap();
    assert_eq!(config.mqtt.base_topic, "home/solar");
}

#[test]
fn test_wildcard_base_topic_is_rejected() {
    let result = BridgeConfig::from_toml_with_env(MINIMAL, env(&[("MQTT_TOPIC", "solar/#")]));
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));

    let result = BridgeConfig::from_toml_with_env(MINIMAL, env(&[("MQTT_TOPIC", "///")]));
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_missing_required_section_fails_to_parse() {
    let result = BridgeConfig::from_toml_with_env(
        r#"
[mqtt]
host = "broker.local"
base_topic = "solar"
"#,
        env(&[]),
    );
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_out_of_range_values_are_rejected() {
    let zero_interval = format!("{MINIMAL}\n[poll]\ninterval_secs = 0\n");
    let err = BridgeConfig::from_toml_with_env(&zero_interval, env(&[])).unwrap_err();
    assert!(err.to_string().contains("poll.interval_secs"));

    let zero_attempts = MINIMAL.replace(
        "base_topic = \"solar\"",
        "base_topic = \"solar\"\nconnect_attempts = 0",
    );
    let err = BridgeConfig::from_toml_with_env(&zero_attempts, env(&[])).unwrap_err();
    assert!(err.to_string().contains("mqtt.connect_attempts"));

    let blank_host = MINIMAL.replace("192.168.1.50", " ");
    let err = BridgeConfig::from_toml_with_env(&blank_host, env(&[])).unwrap_err();
    assert!(err.to_string().contains("device.host"));
}

#[test]
fn test_missing_file_reports_read_error() {
    let result = BridgeConfig::load_from_file(Path::new("/nonexistent/solarbridge.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_redacted_config_hides_password() {
    let config = BridgeConfig::from_toml_with_env(
        MINIMAL,
        env(&[("MQTT_USER", "addon"), ("MQTT_PASSWORD", "s3cret")]),
    )
    .unwrap();

    let rendered = toml::to_string_pretty(&config.redacted()).unwrap();

    assert!(!rendered.contains("s3cret"));
    assert!(rendered.contains("***"));
    assert!(rendered.contains("addon"));
    // The original keeps its secret
    assert_eq!(config.mqtt.password.as_deref(), Some("s3cret"));
}

#[test]
fn test_first_existing_default_location_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("solarbridge.toml");
    let present = dir.path().join("options.toml");
    std::fs::write(&present, MINIMAL).unwrap();

    let missing = missing.to_string_lossy().into_owned();
    let present = present.to_string_lossy().into_owned();
    let path = BridgeConfig::resolve_path(None, &[missing.as_str(), present.as_str()]).unwrap();
    assert_eq!(path, Path::new(&present));

    let config = BridgeConfig::load_from_file(&path).unwrap();
    assert_eq!(config.device.host, "192.168.1.50");
}

#[test]
fn test_no_default_location_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let missing = missing.to_string_lossy().into_owned();

    let result = BridgeConfig::resolve_path(None, &[missing.as_str()]);

    assert!(matches!(result, Err(ConfigError::NotFound { .. })));
    let error: solarbridge::BridgeError = result.unwrap_err().into();
    assert!(error.to_string().contains("absent.toml"));
}
