//! Pure routing of rumqttc events
//!
//! The bridge only publishes, so incoming PUBLISH packets are treated like any
//! other infrastructure traffic.

use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet};

/// Routing decision for one event loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    ConnectionAcknowledged,
    ConnectionRefused(ConnectReturnCode),
    PingSent,
    PingResponse,
    DisconnectSent,
    DisconnectedByBroker,
    InfrastructureEvent,
}

pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to the driver's handling (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(Packet::ConnAck(connack)) => match connack.code {
                ConnectReturnCode::Success => EventRoute::ConnectionAcknowledged,
                code => EventRoute::ConnectionRefused(code),
            },
            Event::Incoming(Packet::PingResp) => EventRoute::PingResponse,
            Event::Incoming(Packet::Disconnect) => EventRoute::DisconnectedByBroker,
            Event::Outgoing(Outgoing::PingReq) => EventRoute::PingSent,
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            _ => EventRoute::InfrastructureEvent,
        }
    }
}
