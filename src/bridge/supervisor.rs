//! Process lifecycle
//!
//! Startup establishes the publisher session with bounded retries, then the
//! poll loop runs as its own task. The supervisor waits for whichever comes
//! first: the shutdown signal, the poll task ending, or the session being
//! given up for good. Every exit path retracts presence and closes the
//! session.

use super::poll_loop::PollLoop;
use super::SupervisorError;
use crate::config::BridgeConfig;
use crate::device::{Connector, DeviceLink, TcpConnector};
use crate::lifecycle_span;
use crate::observability::metrics::{metrics, BridgeState};
use crate::transport::mqtt::MqttPublisher;
use crate::transport::{Publisher, SessionState};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// How often the session state is checked for a permanent loss
const SESSION_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Timing and retry knobs for the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,
    /// How long the poll task gets to finish its cycle at shutdown
    pub poll_stop_timeout: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            poll_interval: config.poll.interval(),
            connect_attempts: config.mqtt.connect_attempts,
            connect_retry_delay: config.mqtt.connect_retry_delay(),
            // One cycle is two bounded exchanges plus a connect
            poll_stop_timeout: config.device.timeout() * 3,
        }
    }
}

/// Why the supervisor stopped waiting
enum Exit {
    Interrupted,
    PollLoopEnded(String),
    SessionLost(String),
}

/// Top-level lifecycle owner
pub struct BridgeSupervisor<C: Connector, P: Publisher> {
    link: DeviceLink<C>,
    publisher: P,
    settings: SupervisorSettings,
}

impl BridgeSupervisor<TcpConnector, MqttPublisher> {
    /// Production wiring from a validated configuration
    pub fn from_config(config: &BridgeConfig) -> Self {
        let link = DeviceLink::new(
            TcpConnector::from_config(&config.device),
            config.device.unit_id,
            config.device.timeout(),
        );
        let publisher = MqttPublisher::new(config.mqtt.clone());
        Self::new(link, publisher, SupervisorSettings::from_config(config))
    }
}

impl<C: Connector, P: Publisher> BridgeSupervisor<C, P> {
    pub fn new(link: DeviceLink<C>, publisher: P, settings: SupervisorSettings) -> Self {
        Self {
            link,
            publisher,
            settings,
        }
    }

    /// Connect the publisher, retrying with a fixed delay
    async fn establish_session(
        publisher: &mut P,
        settings: &SupervisorSettings,
    ) -> Result<(), SupervisorError> {
        let attempts = settings.connect_attempts;
        for attempt in 1..=attempts {
            metrics().record_connect_attempt();
            match publisher.connect().await {
                Ok(()) => {
                    info!(attempt = attempt, "Publisher session established");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        attempt = attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Publisher connect failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(settings.connect_retry_delay).await;
                    }
                }
            }
        }
        Err(SupervisorError::SessionUnavailable { attempts })
    }

    /// Resolve once the session is permanently offline
    async fn watch_session(publisher: &P) -> String {
        loop {
            if let SessionState::PermanentlyOffline(reason) = publisher.session_state() {
                return reason;
            }
            tokio::time::sleep(SESSION_CHECK_INTERVAL).await;
        }
    }

    /// Let the poll task finish its in-flight cycle, then make sure it is gone
    async fn stop_poll_loop(
        stop_tx: &watch::Sender<bool>,
        mut handle: JoinHandle<()>,
        timeout: Duration,
    ) {
        let _ = stop_tx.send(true);
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!("Poll loop did not stop in time, aborting it");
            handle.abort();
        }
    }

    /// Retract presence and close the session; failures are logged only
    async fn retract_presence(publisher: &P) {
        match publisher.announce_offline().await {
            Ok(()) => info!("Announced offline status"),
            Err(e) => warn!(error = %e, "Failed to announce offline status"),
        }
        if let Err(e) = publisher.disconnect().await {
            warn!(error = %e, "Failed to close publisher session");
        }
    }

    /// Run until `shutdown` resolves or a fatal condition occurs
    ///
    /// Returns Ok after a graceful shutdown. Exhausted startup retries, a poll
    /// task that ends on its own, and a permanently lost session are errors.
    pub async fn run<F>(self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        let Self {
            link,
            mut publisher,
            settings,
        } = self;
        tokio::pin!(shutdown);

        metrics().set_state(BridgeState::Connecting);
        let established = tokio::select! {
            result = Self::establish_session(&mut publisher, &settings)
                .instrument(lifecycle_span!(phase = "connect")) => result,
            _ = &mut shutdown => {
                info!("Shutdown requested before the session was established");
                metrics().set_state(BridgeState::Stopped);
                return Ok(());
            }
        };
        if let Err(e) = established {
            error!(error = %e, "Giving up on the publisher session");
            metrics().set_state(BridgeState::Failed);
            return Err(e);
        }

        let publisher = Arc::new(publisher);
        let (stop_tx, stop_rx) = watch::channel(false);
        let poll_loop = PollLoop::new(link, publisher.clone(), settings.poll_interval);
        let mut poll_handle = tokio::spawn(poll_loop.run(stop_rx));
        metrics().set_state(BridgeState::Running);
        info!("Bridge running");

        let exit = tokio::select! {
            _ = &mut shutdown => Exit::Interrupted,
            joined = &mut poll_handle => Exit::PollLoopEnded(match joined {
                Ok(()) => "poll loop exited unexpectedly".to_string(),
                Err(e) => e.to_string(),
            }),
            reason = Self::watch_session(publisher.as_ref()) => Exit::SessionLost(reason),
        };

        metrics().set_state(BridgeState::Stopping);
        let result = match exit {
            Exit::Interrupted => {
                info!("Shutdown signal received, stopping bridge");
                Self::stop_poll_loop(&stop_tx, poll_handle, settings.poll_stop_timeout).await;
                Ok(())
            }
            Exit::PollLoopEnded(reason) => {
                error!(reason = %reason, "Poll loop crashed");
                Err(SupervisorError::PollLoopCrashed(reason))
            }
            Exit::SessionLost(reason) => {
                error!(reason = %reason, "Publisher session lost for good");
                Self::stop_poll_loop(&stop_tx, poll_handle, settings.poll_stop_timeout).await;
                Err(SupervisorError::SessionLost(reason))
            }
        };

        Self::retract_presence(publisher.as_ref())
            .instrument(lifecycle_span!(phase = "shutdown"))
            .await;

        metrics().set_state(if result.is_ok() {
            BridgeState::Stopped
        } else {
            BridgeState::Failed
        });
        let snapshot = metrics().snapshot();
        info!(
            metrics = %serde_json::to_string(&snapshot).unwrap_or_default(),
            "Bridge stopped"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::{PRIMARY_BLOCK_ADDRESS, SECONDARY_BLOCK_ADDRESS};
    use crate::testing::mocks::{MockDevice, MockPublisher, PublisherEvent};

    fn settings(connect_attempts: u32) -> SupervisorSettings {
        SupervisorSettings {
            poll_interval: Duration::from_millis(20),
            connect_attempts,
            connect_retry_delay: Duration::from_millis(5),
            poll_stop_timeout: Duration::from_millis(500),
        }
    }

    fn device() -> MockDevice {
        let device = MockDevice::new();
        device.set_registers(PRIMARY_BLOCK_ADDRESS, &[1000, 50, 0, 1250, 20, 0, 1200, 30, 0]);
        device.set_registers(SECONDARY_BLOCK_ADDRESS, &[2500, 3000, 80, 1, 2]);
        device
    }

    fn supervisor(
        device: &MockDevice,
        publisher: &MockPublisher,
        connect_attempts: u32,
    ) -> BridgeSupervisor<MockDevice, MockPublisher> {
        let link = DeviceLink::new(device.clone(), 1, Duration::from_millis(200));
        BridgeSupervisor::new(link, publisher.clone(), settings(connect_attempts))
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_without_publishing() {
        let device = device();
        let publisher = MockPublisher::new();
        publisher.fail_connects(10);

        let result = supervisor(&device, &publisher, 3)
            .run(std::future::pending())
            .await;

        assert_eq!(
            result,
            Err(SupervisorError::SessionUnavailable { attempts: 3 })
        );
        assert_eq!(publisher.connect_attempts(), 3);
        assert!(publisher.field_publishes().is_empty());
        assert_eq!(device.connections(), 0);
    }

    #[tokio::test]
    async fn test_connect_succeeds_after_retries() {
        let device = device();
        let publisher = MockPublisher::new();
        publisher.fail_connects(2);

        let result = supervisor(&device, &publisher, 3)
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert!(result.is_ok());
        assert_eq!(publisher.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_retracts_presence() {
        let device = device();
        let publisher = MockPublisher::new();

        let result = supervisor(&device, &publisher, 1)
            .run(tokio::time::sleep(Duration::from_millis(100)))
            .await;

        assert!(result.is_ok());
        assert!(publisher.field_publishes().len() >= 14);
        assert_eq!(publisher.statuses(), vec!["online", "offline"]);

        let events = publisher.events();
        assert_eq!(events.last(), Some(&PublisherEvent::Disconnected));
        assert_eq!(
            events[events.len() - 2],
            PublisherEvent::Status("offline".to_string())
        );
    }

    #[tokio::test]
    async fn test_lost_session_is_fatal() {
        let device = device();
        let publisher = MockPublisher::new();
        let handle = publisher.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            handle.set_session_state(SessionState::PermanentlyOffline(
                "Max reconnection attempts (3) exceeded".to_string(),
            ));
        });

        let result = supervisor(&device, &publisher, 1)
            .run(std::future::pending())
            .await;

        assert!(matches!(result, Err(SupervisorError::SessionLost(_))));
        assert_eq!(publisher.events().last(), Some(&PublisherEvent::Disconnected));
    }

    #[tokio::test]
    async fn test_shutdown_during_connect_retries() {
        let device = device();
        let publisher = MockPublisher::new();
        publisher.fail_connects(100);
        let mut slow = settings(100);
        slow.connect_retry_delay = Duration::from_secs(10);
        let link = DeviceLink::new(device.clone(), 1, Duration::from_millis(200));

        let result = BridgeSupervisor::new(link, publisher.clone(), slow)
            .run(tokio::time::sleep(Duration::from_millis(30)))
            .await;

        assert!(result.is_ok());
        assert_eq!(publisher.connect_attempts(), 1);
        assert!(publisher.field_publishes().is_empty());
    }

    #[test]
    fn test_settings_from_config() {
        let config = BridgeConfig::test_config();
        let settings = SupervisorSettings::from_config(&config);

        assert_eq!(settings.poll_interval, Duration::from_secs(10));
        assert_eq!(settings.connect_attempts, 5);
        assert_eq!(settings.connect_retry_delay, Duration::from_millis(5000));
        assert_eq!(settings.poll_stop_timeout, Duration::from_millis(9000));
    }
}
