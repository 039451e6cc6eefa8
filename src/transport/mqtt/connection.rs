//! Pure session state management for the MQTT publisher
//!
//! Session states, the reconnection policy, the error type and the
//! construction of client options (credentials, keep-alive, last will).

use crate::config::MqttSection;
use crate::protocol::topics::{TopicBuilder, STATUS_OFFLINE};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use std::time::Duration;
use thiserror::Error;

/// Publisher session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// No session; also the state after a graceful disconnect
    Offline,
    /// Handshake in progress
    Connecting,
    /// ConnAck received, publishes allowed
    Online,
    /// Session dropped, waiting for reconnection attempt N
    Reconnecting(u32),
    /// Reconnection budget exhausted
    PermanentlyOffline(String),
}

/// Mid-run reconnection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Per-attempt delays in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay once the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(20),
            backoff_pattern: vec![500, 1000, 2000, 5000],
            sustained_delay: 5000,
        }
    }
}

impl ReconnectConfig {
    /// Worst-case time spent in backoff before giving up
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for the given attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("No ConnAck within {0:?}")]
    ConnectTimeout(Duration),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publish not queued within {0:?}")]
    PublishTimeout(Duration),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: SessionState },
}

/// Build client options from config
///
/// The last will (`<base>/status` = `offline`, retained, QoS 1) is part of the
/// CONNECT packet, so it is registered before the handshake starts.
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
    topics: &TopicBuilder,
) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(client_id, config.host.as_str(), config.port);

    if let Some(username) = &config.username {
        let password = config.password.clone().unwrap_or_default();
        mqtt_options.set_credentials(username, &password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    let lwt = LastWill::new(
        topics.status_topic(),
        STATUS_OFFLINE,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    mqtt_options
}

/// Client id from config, or a fresh `solarbridge-<uuid>`
pub fn resolve_client_id(config: &MqttSection) -> String {
    config
        .client_id
        .clone()
        .unwrap_or_else(|| format!("solarbridge-{}", uuid::Uuid::new_v4()))
}
