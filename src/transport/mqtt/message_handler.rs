//! Pure message routing logic for MQTT events
//!
//! [`MessageHandler`] classifies rumqttc events; [`MessageDispatcher`] hands
//! inbound publishes to the registered [`MessageSink`].

use crate::transport::{MessageReceived, MessageSink};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                    // Copy out of the client's buffer before anything downstream sees it
                    payload: Bytes::copy_from_slice(&publish.payload),
                    qos: publish.qos,
                    retain: publish.retain,
                }),
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    return_codes: suback
                        .return_codes
                        .iter()
                        .map(|code| format!("{code:?}"))
                        .collect(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Return codes in a SubAck that denote a refused subscription
    pub fn rejected_return_codes(return_codes: &[String]) -> Vec<&str> {
        return_codes
            .iter()
            .map(String::as_str)
            .filter(|code| !code.starts_with("Success"))
            .collect()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived(MessageReceived),
    /// MQTT broker disconnected us, with its reason code
    Disconnected(String),
    /// Subscription confirmed with return codes
    SubscriptionConfirmed {
        packet_id: u16,
        return_codes: Vec<String>,
    },
    /// Infrastructure event (PingResp, PubAck, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

/// Delivers inbound messages to the current sink
#[derive(Default)]
pub struct MessageDispatcher {
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        let mut guard = self.sink.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some(sink);
    }

    pub fn has_sink(&self) -> bool {
        self.sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Returns false when no sink is registered and the message was dropped
    pub fn dispatch(&self, message: MessageReceived) -> bool {
        let sink = self
            .sink
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        match sink {
            Some(sink) => {
                debug!(target: "mqtt_transport", topic = %message.topic, "Dispatching inbound message");
                sink.deliver(message);
                true
            }
            None => {
                warn!(topic = %message.topic, "Received MQTT message but no sink registered - message dropped");
                false
            }
        }
    }
}
