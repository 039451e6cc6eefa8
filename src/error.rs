//! Top-level error taxonomy
//!
//! Component errors stay in their modules; this wraps the ones that can end
//! a CLI command so `main` has a single type to report.

use crate::bridge::{CycleError, SupervisorError};
use crate::config::ConfigError;
use crate::device::ReadError;
use crate::measurement::MeasurementError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bridge error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Device error: {0}")]
    Device(#[from] ReadError),

    #[error("Measurement error: {0}")]
    Measurement(#[from] MeasurementError),
}

impl From<CycleError> for BridgeError {
    fn from(err: CycleError) -> Self {
        match err {
            CycleError::Read { source, .. } => Self::Device(source),
            CycleError::Decode(e) => Self::Measurement(e),
        }
    }
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
