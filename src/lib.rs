//! Solar charge controller bridge
//!
//! Polls a charge controller's telemetry registers over Modbus TCP and
//! republishes each decoded field as a retained MQTT message under a base
//! topic, with `online`/`offline` presence on `<base>/status`.
//!
//! # Overview
//!
//! - Register-read codec and topic construction ([`protocol`])
//! - Lazily connected device link ([`device`])
//! - Fixed field table and scaling ([`measurement`])
//! - MQTT session with last will and bounded reconnection ([`transport`])
//! - Poll loop and lifecycle supervisor ([`bridge`])
//!
//! # Quick Start
//!
//! ```rust
//! use solarbridge::measurement::MeasurementDecoder;
//!
//! let primary = [1000, 50, 0, 1250, 20, 0, 1200, 30, 0];
//! let secondary = [2500, 3000, 80, 1, 2];
//!
//! let set = MeasurementDecoder::decode(&primary, &secondary).unwrap();
//! assert_eq!(set.len(), 14);
//! assert_eq!(set.get("pv_voltage").unwrap().to_payload(), "10.0");
//! ```

pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod measurement;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeSupervisor, PollLoop, SupervisorError};
pub use config::{BridgeConfig, ConfigError};
pub use error::{BridgeError, BridgeResult};
pub use measurement::{MeasurementDecoder, MeasurementSet};
pub use transport::mqtt::MqttPublisher;
pub use transport::Publisher;
