//! Broker client: the single outbound telemetry session
//!
//! [`BrokerClient`] enforces the `Disconnected -> Connecting -> Connected`
//! state machine on top of a [`Transport`]. It never reconnects: once the
//! link is lost every further publish is dropped until an explicit
//! [`connect`](BrokerClient::connect).

pub mod topics;

use crate::config::MqttSection;
use crate::observability::BridgeMetrics;
use crate::reading::Reading;
use crate::transport::{BrokerError, SessionOptions, Transport};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

pub use topics::{format_value, Measurement, TopicBuilder};

/// Payload of the liveness probe published after CONNACK
pub const PROBE_PAYLOAD: &str = "test value";

/// Broker client state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Why a sample was not handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotConnected,
    LinkLost,
    SendFailed,
}

/// Result of [`BrokerClient::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    Dropped(DropReason),
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published)
    }
}

#[derive(Debug)]
struct Session {
    state: ClientState,
    client_id: Option<String>,
    topics: Option<TopicBuilder>,
    // A transport session exists and must be closed
    open: bool,
}

/// Shared broker client
pub struct BrokerClient<T: Transport> {
    config: MqttSection,
    transport: T,
    session: Mutex<Session>,
    // Serializes connect and disconnect
    transition: tokio::sync::Mutex<()>,
    metrics: Arc<BridgeMetrics>,
}

impl<T: Transport> BrokerClient<T> {
    pub fn new(config: MqttSection, transport: T, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            config,
            transport,
            session: Mutex::new(Session {
                state: ClientState::Disconnected,
                client_id: None,
                topics: None,
                open: false,
            }),
            transition: tokio::sync::Mutex::new(()),
            metrics,
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Session options for `client_id` derived from the broker section
    pub fn session_options(&self, client_id: &str) -> SessionOptions {
        SessionOptions {
            client_id: client_id.to_string(),
            host: self.config.host.clone(),
            port: self.config.port,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            keep_alive: self.config.keep_alive(),
            ping_timeout: self.config.ping_timeout(),
            connect_timeout: self.config.connect_timeout(),
        }
    }

    /// Open the broker session and publish the liveness probe
    pub async fn connect(&self, client_id: &str) -> Result<(), BrokerError> {
        let _transition = self.transition.lock().await;

        {
            let mut session = self.lock_session();
            if session.state == ClientState::Connected {
                info!(client_id = %client_id, "MQTT client already connected");
                return Ok(());
            }
            session.state = ClientState::Connecting;
        }

        let options = self.session_options(client_id);
        info!(
            client_id = %client_id,
            server = %options.server(),
            "Connecting to MQTT broker"
        );

        if let Err(e) = self.transport.open(&options).await {
            self.lock_session().state = ClientState::Disconnected;
            self.metrics.broker_connect_failed();
            error!(client_id = %client_id, error = %e, "Failed to connect to MQTT broker");
            return Err(e);
        }
        self.lock_session().open = true;

        let probe = tokio::time::timeout(
            self.config.connect_timeout(),
            self.transport.probe(&self.config.probe_topic, PROBE_PAYLOAD),
        )
        .await;
        match probe {
            Ok(Ok(())) => debug!(topic = %self.config.probe_topic, "Liveness probe published"),
            Ok(Err(e)) => {
                warn!(topic = %self.config.probe_topic, error = %e, "Liveness probe failed")
            }
            Err(_) => warn!(topic = %self.config.probe_topic, "Liveness probe timed out"),
        }

        {
            let mut session = self.lock_session();
            session.state = ClientState::Connected;
            session.client_id = Some(client_id.to_string());
            session.topics = Some(TopicBuilder::new(&self.config.namespace, client_id));
        }
        self.metrics.set_broker_connected(true);
        info!(client_id = %client_id, "Connected to MQTT broker");
        Ok(())
    }

    /// Publish both measurements of `reading` for `device`
    ///
    /// Never blocks. Anything that prevents publishing is logged and reported
    /// as [`PublishOutcome::Dropped`].
    pub fn publish(&self, device: &str, reading: &Reading) -> PublishOutcome {
        let mut session = self.lock_session();

        if session.state != ClientState::Connected {
            self.metrics.sample_dropped();
            debug!(
                device = %device,
                state = ?session.state,
                "Broker not connected, dropping sample"
            );
            return PublishOutcome::Dropped(DropReason::NotConnected);
        }

        if !self.transport.is_link_up() {
            session.state = ClientState::Disconnected;
            self.metrics.set_broker_connected(false);
            self.metrics.sample_dropped();
            warn!(device = %device, "MQTT link lost, dropping sample");
            return PublishOutcome::Dropped(DropReason::LinkLost);
        }

        let Some(topics) = session.topics.as_ref() else {
            self.metrics.sample_dropped();
            return PublishOutcome::Dropped(DropReason::NotConnected);
        };

        let mut failed = false;
        for (topic, payload) in topics.build_messages(device, reading) {
            if let Err(e) = self.transport.send(&topic, payload) {
                self.metrics.publish_failed();
                warn!(device = %device, topic = %topic, error = %e, "Publish failed");
                failed = true;
            }
        }

        if failed {
            self.metrics.sample_dropped();
            PublishOutcome::Dropped(DropReason::SendFailed)
        } else {
            self.metrics.sample_published();
            debug!(device = %device, reading = %reading, "Sample published");
            PublishOutcome::Published
        }
    }

    /// Close the session, lingering briefly for in-flight publishes
    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        let _transition = self.transition.lock().await;

        let was_open = {
            let mut session = self.lock_session();
            session.state = ClientState::Disconnected;
            std::mem::replace(&mut session.open, false)
        };
        self.metrics.set_broker_connected(false);

        if !was_open {
            debug!("MQTT client already disconnected");
            return Ok(());
        }

        let linger = self.config.disconnect_linger();
        match self.transport.close(linger).await {
            Ok(()) => {
                info!(linger_ms = linger.as_millis() as u64, "Disconnected from MQTT broker");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "MQTT disconnect did not complete cleanly");
                Err(e)
            }
        }
    }

    pub fn state(&self) -> ClientState {
        self.lock_session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Client identifier of the current or last session
    pub fn client_id(&self) -> Option<String> {
        self.lock_session().client_id.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::testing::MockTransport;

    fn client(transport: MockTransport) -> BrokerClient<MockTransport> {
        BrokerClient::new(
            BridgeConfig::test_config().mqtt,
            transport,
            Arc::new(BridgeMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_connect_publishes_probe() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());

        broker.connect("host1").await.unwrap();

        assert_eq!(broker.state(), ClientState::Connected);
        assert_eq!(broker.client_id().as_deref(), Some("host1"));
        assert_eq!(
            transport.probes(),
            vec![("testTopic".to_string(), "test value".to_string())]
        );
        assert_eq!(transport.opened_sessions()[0].client_id, "host1");
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());

        broker.connect("host1").await.unwrap();
        broker.connect("host1").await.unwrap();

        assert_eq!(transport.opened_sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let transport = MockTransport::failing(BrokerError::Unreachable("refused".to_string()));
        let broker = client(transport);

        let result = broker.connect("host1").await;

        assert_eq!(result, Err(BrokerError::Unreachable("refused".to_string())));
        assert_eq!(broker.state(), ClientState::Disconnected);
        assert_eq!(broker.metrics.snapshot().broker_connect_failures, 1);
    }

    #[tokio::test]
    async fn test_connect_auth_rejected() {
        let transport =
            MockTransport::failing(BrokerError::AuthRejected("NotAuthorized".to_string()));
        let broker = client(transport);

        assert!(matches!(
            broker.connect("host1").await,
            Err(BrokerError::AuthRejected(_))
        ));
        assert_eq!(broker.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_probe_still_connects() {
        let transport = MockTransport::new();
        transport.fail_probe(true);
        let broker = client(transport.clone());

        assert!(broker.connect("host1").await.is_ok());
        assert_eq!(broker.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_publish_sends_both_topics() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());
        broker.connect("host1").await.unwrap();

        let outcome = broker.publish("sensor-a", &Reading::new(21.5, 40.25));

        assert_eq!(outcome, PublishOutcome::Published);
        assert_eq!(
            transport.sent(),
            vec![
                (
                    "prometheus/job/host1/node/sensor-a/temperature".to_string(),
                    "21.500000".to_string()
                ),
                (
                    "prometheus/job/host1/node/sensor-a/humidity".to_string(),
                    "40.250000".to_string()
                ),
            ]
        );
    }

    #[test]
    fn test_publish_while_disconnected_drops() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());

        let outcome = broker.publish("sensor-a", &Reading::new(21.5, 40.25));

        assert_eq!(outcome, PublishOutcome::Dropped(DropReason::NotConnected));
        assert!(transport.sent().is_empty());
        assert_eq!(broker.metrics.snapshot().samples_dropped, 1);
    }

    #[tokio::test]
    async fn test_link_loss_moves_to_disconnected() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());
        broker.connect("host1").await.unwrap();

        transport.set_link_up(false);
        let outcome = broker.publish("sensor-a", &Reading::new(21.5, 40.25));

        assert_eq!(outcome, PublishOutcome::Dropped(DropReason::LinkLost));
        assert_eq!(broker.state(), ClientState::Disconnected);
        assert!(transport.sent().is_empty());

        // Later samples are dropped without consulting the link again
        assert_eq!(
            broker.publish("sensor-a", &Reading::new(21.0, 40.0)),
            PublishOutcome::Dropped(DropReason::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_send_failure_is_counted() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());
        broker.connect("host1").await.unwrap();

        transport.fail_send(true);
        let outcome = broker.publish("sensor-a", &Reading::new(21.5, 40.25));

        assert_eq!(outcome, PublishOutcome::Dropped(DropReason::SendFailed));
        assert_eq!(broker.metrics.snapshot().publish_failures, 2);
        assert_eq!(broker.state(), ClientState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());
        broker.connect("host1").await.unwrap();

        assert!(broker.disconnect().await.is_ok());
        assert!(broker.disconnect().await.is_ok());

        assert_eq!(broker.state(), ClientState::Disconnected);
        assert_eq!(transport.close_calls(), 1);
        assert_eq!(
            broker.publish("sensor-a", &Reading::new(21.5, 40.25)),
            PublishOutcome::Dropped(DropReason::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_disconnect_never_connected() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());

        assert!(broker.disconnect().await.is_ok());
        assert_eq!(transport.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_after_link_loss_still_closes() {
        let transport = MockTransport::new();
        let broker = client(transport.clone());
        broker.connect("host1").await.unwrap();
        transport.set_link_up(false);
        broker.publish("sensor-a", &Reading::new(21.5, 40.25));

        assert!(broker.disconnect().await.is_ok());
        assert_eq!(transport.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_publish() {
        let transport = MockTransport::new();
        let broker = Arc::new(client(transport.clone()));
        broker.connect("host1").await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let broker = broker.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        broker.publish(&format!("sensor-{i}"), &Reading::new(20.0, 50.0));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(transport.sent().len(), 200);
        assert_eq!(broker.metrics.snapshot().samples_published, 100);
    }
}
