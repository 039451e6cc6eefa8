//! rumqttc-backed implementation of the [`Publisher`](crate::transport::Publisher)
//!
//! Split so that everything except the I/O is a pure function:
//!
//! - [`connection`] - session states, reconnect policy, client options
//! - [`message_handler`] - routing of event loop events
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the publisher itself and its background event loop task
//!
//! # Usage
//!
//! ```rust,no_run
//! use solarbridge::config::BridgeConfig;
//! use solarbridge::transport::mqtt::MqttPublisher;
//! use solarbridge::transport::Publisher;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::load_from_file("solarbridge.toml".as_ref())?;
//! let mut publisher = MqttPublisher::new(config.mqtt);
//! publisher.connect().await?;
//! publisher.publish_field("battery_voltage", "12.5").await?;
//! publisher.announce_offline().await?;
//! Publisher::disconnect(&publisher).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttPublisher;
pub use connection::{MqttError, ReconnectConfig, SessionState};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
