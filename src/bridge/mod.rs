//! Bridge orchestration: the poll loop and the supervisor that owns it

pub mod poll_loop;
pub mod supervisor;

pub use poll_loop::{read_measurements, CycleError, CycleOutcome, PollLoop};
pub use supervisor::{BridgeSupervisor, SupervisorSettings};

use thiserror::Error;

/// Conditions that end the bridge with a failure
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("MQTT session unavailable after {attempts} attempts")]
    SessionUnavailable { attempts: u32 },
    #[error("Poll loop crashed: {0}")]
    PollLoopCrashed(String),
    #[error("MQTT session lost: {0}")]
    SessionLost(String),
}
