//! Pure routing of MQTT events

use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the handling branch of the event loop
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.to_vec(),
                    retain: publish.retain,
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Payload as loggable text
    pub fn describe_payload(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Handshake completed (initial or after reconnect)
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
        retain: bool,
    },
    /// Broker closed the session
    Disconnected,
    /// PingResp, PubAck, SubAck and the like
    InfrastructureEvent(String),
    /// Outgoing event (handled by rumqttc)
    OutgoingEvent,
}
