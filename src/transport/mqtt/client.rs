//! Impure I/O for the MQTT publisher
//!
//! Owns the rumqttc client and the background task that drives its event
//! loop. The handshake runs inline in [`MqttPublisher::connect`] so a failed
//! attempt never leaves a task behind; once ConnAck arrives the event loop is
//! handed to a spawned task which owns keep-alive, inbound messages and
//! bounded reconnection.
//!
//! The event loop task never waits on the request channel it drains: work it
//! queues itself (presence and the command subscription after a reconnect)
//! is handed to a short-lived task.

use super::connection::{
    configure_mqtt_options, resolve_client_id, MqttError, ReconnectConfig, SessionState,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{EventRoute, MessageHandler};
use crate::config::MqttSection;
use crate::mqtt_span;
use crate::observability::metrics::metrics;
use crate::protocol::topics::{TopicBuilder, STATUS_OFFLINE, STATUS_ONLINE};
use crate::transport::Publisher;
use async_trait::async_trait;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Request channel capacity between the client handle and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// How long a graceful disconnect waits for the event loop to drain
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// How long a publish may wait for room in a full request channel
const PUBLISH_QUEUE_TIMEOUT: Duration = Duration::from_secs(5);

/// rumqttc-backed publisher
pub struct MqttPublisher {
    config: MqttSection,
    client_id: String,
    topics: TopicBuilder,
    reconnect_config: ReconnectConfig,
    client: Option<AsyncClient>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<SessionState>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
}

/// Everything the background task needs, moved into it once
struct EventLoopContext {
    client: AsyncClient,
    topics: TopicBuilder,
    reconnect_config: ReconnectConfig,
    state_tx: watch::Sender<SessionState>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
}

impl MqttPublisher {
    pub fn new(config: MqttSection) -> Self {
        let (state_tx, state_rx) = watch::channel(SessionState::Offline);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            client_id: resolve_client_id(&config),
            topics: TopicBuilder::new(&config.base_topic),
            reconnect_config: config.reconnect_config(),
            config,
            client: None,
            event_loop_handle: Mutex::new(None),
            state_tx,
            state_rx,
            shutdown_tx,
            closing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    /// Poll a fresh event loop until the broker acknowledges the session
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        connect_timeout: Duration,
    ) -> Result<(), MqttError> {
        let handshake = async {
            loop {
                match event_loop.poll().await {
                    Ok(event) => {
                        if MessageHandler::route_mqtt_event(&event)
                            == EventRoute::ConnectionAcknowledged
                        {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(MqttError::ConnectionFailed(Box::new(e))),
                }
            }
        };

        tokio::time::timeout(connect_timeout, handshake)
            .await
            .map_err(|_| MqttError::ConnectTimeout(connect_timeout))?
    }

    /// Perform interruptible sleep with shutdown monitoring
    /// Returns true if sleep completed, false if shutdown requested
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay_ms: u64) -> bool {
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
        }
    }

    /// Drive the event loop until shutdown, a graceful close, or an exhausted
    /// reconnection budget
    async fn run_event_loop(mut event_loop: EventLoop, ctx: EventLoopContext) {
        let mut shutdown_rx = ctx.shutdown_rx.clone();
        let mut reconnect_attempts = 0u32;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping MQTT event loop");
                        break;
                    }
                }
                polled = event_loop.poll() => {
                    let keep_running = match polled {
                        Ok(event) => {
                            Self::process_event_route(
                                MessageHandler::route_mqtt_event(&event),
                                &ctx,
                                &mut reconnect_attempts,
                            )
                            .await
                        }
                        Err(e) if ctx.closing.load(Ordering::SeqCst) => {
                            debug!(error = %e, "MQTT event loop closed after disconnect");
                            false
                        }
                        Err(e) => {
                            Self::handle_session_loss(
                                ConnectionEvent::NetworkError(e.to_string()),
                                &ctx,
                                &mut reconnect_attempts,
                            )
                            .await
                        }
                    };
                    if !keep_running {
                        break;
                    }
                }
            }
        }

        if ctx.closing.load(Ordering::SeqCst) {
            let _ = ctx
                .state_tx
                .send(HealthMonitor::determine_next_state(ConnectionEvent::ClosedByClient));
        }
        info!("MQTT event loop stopped");
    }

    /// Returns true to keep polling
    async fn process_event_route(
        route: EventRoute,
        ctx: &EventLoopContext,
        reconnect_attempts: &mut u32,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                if *reconnect_attempts > 0 {
                    info!(
                        attempt = *reconnect_attempts,
                        "MQTT session re-established, restoring presence"
                    );
                    Self::restore_session(&ctx.client, &ctx.topics);
                    metrics().record_reconnect();
                }
                *reconnect_attempts = 0;
                let _ = ctx
                    .state_tx
                    .send(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));
                true
            }
            EventRoute::MessageReceived {
                topic,
                payload,
                retain,
            } => {
                info!(
                    topic = %topic,
                    payload = %MessageHandler::describe_payload(&payload),
                    retain = retain,
                    "Received MQTT message"
                );
                true
            }
            EventRoute::Disconnected => {
                if ctx.closing.load(Ordering::SeqCst) {
                    return false;
                }
                Self::handle_session_loss(
                    ConnectionEvent::DisconnectedByBroker,
                    ctx,
                    reconnect_attempts,
                )
                .await
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Mark the session offline and wait out the next backoff step
    /// Returns true to resume polling (rumqttc reconnects on the next poll)
    async fn handle_session_loss(
        event: ConnectionEvent,
        ctx: &EventLoopContext,
        reconnect_attempts: &mut u32,
    ) -> bool {
        let _ = ctx.state_tx.send(HealthMonitor::determine_next_state(event));

        let decision = HealthMonitor::should_attempt_reconnection(
            *reconnect_attempts,
            &ctx.reconnect_config,
            *ctx.shutdown_rx.borrow(),
        );

        match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => {
                *reconnect_attempts = attempt;
                let _ = ctx.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::ReconnectionStarted(attempt),
                ));

                let max_display = ctx
                    .reconnect_config
                    .max_attempts
                    .map_or("unlimited".to_string(), |max| max.to_string());
                warn!(
                    attempt = attempt,
                    max_attempts = %max_display,
                    delay_ms = delay_ms,
                    "Scheduling MQTT reconnection"
                );

                Self::interruptible_sleep(ctx.shutdown_rx.clone(), delay_ms).await
            }
            ReconnectionDecision::AbortShutdownRequested => false,
            ReconnectionDecision::AbortMaxAttemptsExceeded { max_attempts } => {
                let reason = format!("Max reconnection attempts ({max_attempts}) exceeded");
                let _ = ctx.state_tx.send(HealthMonitor::determine_next_state(
                    ConnectionEvent::PermanentFailure(reason),
                ));
                false
            }
        }
    }

    /// Republish presence and restore the command subscription
    ///
    /// Called from the event loop task. The requests are queued from a
    /// separate task because a full request channel only drains while the
    /// event loop keeps polling.
    fn restore_session(client: &AsyncClient, topics: &TopicBuilder) {
        let client = client.clone();
        let status_topic = topics.status_topic();
        let command_topic = topics.command_topic();

        tokio::spawn(async move {
            if let Err(e) = client
                .publish(status_topic, QoS::AtLeastOnce, true, STATUS_ONLINE)
                .await
            {
                error!(error = %e, "Failed to republish online status");
            }
            if let Err(e) = client.subscribe(command_topic, QoS::AtLeastOnce).await {
                error!(error = %e, "Failed to restore command subscription");
            }
        });
    }

    fn check_connection_state(&self) -> Result<&AsyncClient, MqttError> {
        let state = self.state_rx.borrow().clone();
        match &self.client {
            Some(client) if HealthMonitor::can_publish(&state) => Ok(client),
            _ => Err(MqttError::NotConnected { state }),
        }
    }

    async fn publish_retained(
        client: &AsyncClient,
        topic: String,
        payload: &str,
    ) -> Result<(), MqttError> {
        let queued = client.publish(topic, QoS::AtLeastOnce, true, payload.to_string());
        tokio::time::timeout(PUBLISH_QUEUE_TIMEOUT, queued)
            .await
            .map_err(|_| MqttError::PublishTimeout(PUBLISH_QUEUE_TIMEOUT))?
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    /// Establish a session: handshake, presence, command subscription
    pub async fn connect(&mut self) -> Result<(), MqttError> {
        let _ = self.state_tx.send(SessionState::Connecting);
        self.closing.store(false, Ordering::SeqCst);

        let options = configure_mqtt_options(&self.client_id, &self.config, &self.topics);
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.client_id,
            "Connecting to MQTT broker"
        );

        let handshake = Self::wait_for_connack(&mut event_loop, self.config.connect_timeout())
            .instrument(mqtt_span!(operation = "connect", client_id = %self.client_id));
        if let Err(e) = handshake.await {
            let _ = self.state_tx.send(SessionState::Offline);
            return Err(e);
        }

        // Queued ahead of the event loop task; flushed on its first polls
        let queued = async {
            client
                .publish(self.topics.status_topic(), QoS::AtLeastOnce, true, STATUS_ONLINE)
                .await
                .map_err(|e| MqttError::PublishFailed(Box::new(e)))?;
            client
                .subscribe(self.topics.command_topic(), QoS::AtLeastOnce)
                .await
                .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
        };
        if let Err(e) = queued.await {
            let _ = self.state_tx.send(SessionState::Offline);
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;

        // Online before the task starts, so a loss it reports is never overwritten
        let _ = self
            .state_tx
            .send(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));

        let ctx = EventLoopContext {
            client: client.clone(),
            topics: self.topics.clone(),
            reconnect_config: self.reconnect_config.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx,
            closing: self.closing.clone(),
        };
        let handle = tokio::spawn(Self::run_event_loop(event_loop, ctx));

        *self.event_loop_handle.lock().await = Some(handle);
        self.client = Some(client);

        info!(
            status_topic = %self.topics.status_topic(),
            command_topic = %self.topics.command_topic(),
            "MQTT session online"
        );
        Ok(())
    }

    /// Close the session after flushing queued publishes
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let Some(handle) = self.event_loop_handle.lock().await.take() else {
            let _ = self.state_tx.send(SessionState::Offline);
            return Ok(());
        };

        self.closing.store(true, Ordering::SeqCst);

        let requested = match &self.client {
            Some(client) => {
                match tokio::time::timeout(DISCONNECT_GRACE, client.disconnect()).await {
                    Ok(sent) => sent.map_err(|e| MqttError::ConnectionFailed(Box::new(e))),
                    Err(_) => {
                        warn!("MQTT request queue full, skipping DISCONNECT packet");
                        Ok(())
                    }
                }
            }
            None => Ok(()),
        };

        let mut handle = handle;
        if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
            .await
            .is_err()
        {
            warn!("MQTT event loop did not stop in time, forcing shutdown");
            let _ = self.shutdown_tx.send(true);
            if tokio::time::timeout(DISCONNECT_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
            }
        }

        let _ = self.state_tx.send(SessionState::Offline);
        info!("MQTT client disconnected");
        requested
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    type Error = MqttError;

    async fn connect(&mut self) -> Result<(), Self::Error> {
        MqttPublisher::connect(self).await
    }

    async fn publish_field(&self, name: &str, payload: &str) -> Result<(), Self::Error> {
        let client = self.check_connection_state()?;
        let topic = self.topics.field_topic(name);
        Self::publish_retained(client, topic, payload).await
    }

    async fn announce_offline(&self) -> Result<(), Self::Error> {
        let client = self.check_connection_state()?;
        Self::publish_retained(client, self.topics.status_topic(), STATUS_OFFLINE).await?;
        debug!(topic = %self.topics.status_topic(), "Published offline status");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        MqttPublisher::disconnect(self).await
    }

    fn session_state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        // Background task cleanup only; disconnect() is the graceful path
        let _ = self.shutdown_tx.send(true);
        if let Ok(mut guard) = self.event_loop_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
