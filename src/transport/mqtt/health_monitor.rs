//! Pure reconnection decisions and session state transitions

use super::connection::{ReconnectConfig, SessionState};
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnection attempt should be made
    /// Supports unlimited retries when max_attempts is None
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts };
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Next session state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> SessionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("MQTT session established");
                SessionState::Online
            }
            ConnectionEvent::DisconnectedByBroker => {
                warn!("MQTT broker closed the session");
                SessionState::Offline
            }
            ConnectionEvent::NetworkError(error) => {
                warn!(error = %error, "MQTT session lost");
                SessionState::Offline
            }
            ConnectionEvent::ReconnectionStarted(attempt) => SessionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                error!(reason = %reason, "MQTT session permanently lost");
                SessionState::PermanentlyOffline(reason)
            }
            ConnectionEvent::ClosedByClient => SessionState::Offline,
        }
    }

    /// Publishing is only allowed while online
    pub fn can_publish(state: &SessionState) -> bool {
        matches!(state, SessionState::Online)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay_ms`, then try again
    Proceed { attempt: u32, delay_ms: u64 },
    /// Shutdown in progress; stop reconnecting
    AbortShutdownRequested,
    /// Budget exhausted
    AbortMaxAttemptsExceeded { max_attempts: u32 },
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    PermanentFailure(String),
    ClosedByClient,
}
