//! Broker transport layer
//!
//! [`Transport`] is the seam between the [`BrokerClient`](crate::broker::BrokerClient)
//! state machine and the wire protocol. The MQTT implementation lives in
//! [`mqtt`]; tests substitute [`MockTransport`](crate::testing::MockTransport).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// Broker link errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Broker rejected credentials: {0}")]
    AuthRejected(String),
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Invalid session options: {0}")]
    InvalidSession(String),
}

/// Everything a transport needs to open one broker session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Longest wait for a PINGRESP before the link is declared lost
    pub ping_timeout: Duration,
    /// Longest wait for CONNACK
    pub connect_timeout: Duration,
}

impl SessionOptions {
    pub fn server(&self) -> String {
        format!("tcp://{}:{}", self.host, self.port)
    }
}

/// Transport trait for the broker session
///
/// Implementations must tolerate `send` being called concurrently from
/// several tasks and must never block inside it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session; resolves once the broker acknowledged it
    async fn open(&self, session: &SessionOptions) -> Result<(), BrokerError>;

    /// Publish one message and wait until it was handed to the network
    async fn probe(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;

    /// Fire-and-forget publish
    fn send(&self, topic: &str, payload: String) -> Result<(), BrokerError>;

    /// Close the session, allowing up to `linger` for in-flight messages
    async fn close(&self, linger: Duration) -> Result<(), BrokerError>;

    /// False once the link failed or was closed
    fn is_link_up(&self) -> bool;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
