//! Test doubles for the device link and the publisher
//!
//! Public so integration tests can run the bridge without a controller or an
//! MQTT broker.

pub mod broker;
pub mod mocks;

pub use broker::{FakeBroker, ReceivedPublish};
pub use mocks::*;
