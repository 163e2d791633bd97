//! Pure connection state management for the MQTT transport
//!
//! This module contains pure functions for building client options and
//! classifying how a session ended.

use crate::transport::{BrokerError, SessionOptions};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions};
use std::time::Duration;
use tracing::warn;

/// Capacity of the request channel between `AsyncClient` and its event loop
pub const REQUEST_CAPACITY: usize = 64;

/// Link state published by the event loop driver
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Waiting for CONNACK
    Connecting,
    /// CONNACK received; publishing allowed
    Connected,
    /// Broker refused the credentials
    Rejected(String),
    /// Network failure, refusal for another reason, or ping timeout
    Lost(String),
    /// Closed by our own DISCONNECT
    Closed,
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// Map a terminal state reached before CONNACK to a connect error
    pub fn into_connect_error(self) -> Option<BrokerError> {
        match self {
            LinkState::Connecting | LinkState::Connected => None,
            LinkState::Rejected(reason) => Some(BrokerError::AuthRejected(reason)),
            LinkState::Lost(reason) => Some(BrokerError::Unreachable(reason)),
            LinkState::Closed => Some(BrokerError::Unreachable(
                "session closed before CONNACK".to_string(),
            )),
        }
    }
}

/// Build rumqttc options for one session
pub fn configure_mqtt_options(session: &SessionOptions) -> Result<MqttOptions, BrokerError> {
    if session.client_id.is_empty() {
        return Err(BrokerError::InvalidSession(
            "client ID must not be empty".to_string(),
        ));
    }
    if session.host.is_empty() {
        return Err(BrokerError::InvalidSession(
            "broker host must not be empty".to_string(),
        ));
    }
    // rumqttc panics on sub-second keep-alive intervals
    if session.keep_alive < Duration::from_secs(1) {
        return Err(BrokerError::InvalidSession(format!(
            "keep-alive {:?} is shorter than one second",
            session.keep_alive
        )));
    }

    let mut mqtt_options = MqttOptions::new(&session.client_id, &session.host, session.port);
    mqtt_options.set_keep_alive(session.keep_alive);
    mqtt_options.set_clean_session(true);

    match (&session.username, &session.password) {
        (Some(username), password) => {
            mqtt_options.set_credentials(username, password.clone().unwrap_or_default());
        }
        (None, Some(_)) => {
            warn!("MQTT password configured without a username, ignoring it");
        }
        (None, None) => {}
    }

    Ok(mqtt_options)
}

/// Classify a CONNACK return code that is not `Success`
pub fn classify_refusal(code: ConnectReturnCode) -> LinkState {
    match code {
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
            LinkState::Rejected(format!("{code:?}"))
        }
        other => LinkState::Lost(format!("connection refused: {other:?}")),
    }
}

/// Classify an event loop error into the terminal link state
pub fn classify_connection_error(error: &ConnectionError) -> LinkState {
    match error {
        ConnectionError::ConnectionRefused(code) => classify_refusal(*code),
        other => LinkState::Lost(other.to_string()),
    }
}
