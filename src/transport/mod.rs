//! Publish side of the bridge
//!
//! The poll loop and supervisor only see the [`Publisher`] capability, so the
//! rumqttc session can be swapped for a recording double in tests.

pub mod mqtt;

pub use mqtt::SessionState;

/// Messaging-transport capability
///
/// Implementations serialize outbound operations internally; `publish_field`
/// may be called from the poll task while the transport's own event loop
/// runs concurrently.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Establish the session, register the last will, announce `online`
    async fn connect(&mut self) -> Result<(), Self::Error>;

    /// Publish one field to `<base>/<name>`, retained
    async fn publish_field(&self, name: &str, payload: &str) -> Result<(), Self::Error>;

    /// Best-effort retained `offline` on `<base>/status`
    async fn announce_offline(&self) -> Result<(), Self::Error>;

    /// Close the session
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Current session state
    fn session_state(&self) -> SessionState;

    /// Check if the session was given up for good
    fn is_permanently_disconnected(&self) -> bool {
        matches!(self.session_state(), SessionState::PermanentlyOffline(_))
    }
}

/// Type alias for the production publisher
pub type MqttTransport = mqtt::MqttPublisher;
