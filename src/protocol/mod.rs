//! Wire formats spoken by the bridge
//!
//! [`codec`] frames the Modbus TCP register reads exchanged with the charge
//! controller; [`topics`] lays out the MQTT namespace the readings land in.

pub mod codec;
pub mod topics;

pub use codec::{DecodeError, RegisterRequest, RegisterResponse};
pub use topics::*;
