//! BrokerClient state machine tests against the mock transport

use ble_mqtt_bridge::broker::{BrokerClient, ClientState, DropReason, PublishOutcome};
use ble_mqtt_bridge::config::BridgeConfig;
use ble_mqtt_bridge::observability::BridgeMetrics;
use ble_mqtt_bridge::testing::MockTransport;
use ble_mqtt_bridge::transport::BrokerError;
use ble_mqtt_bridge::Reading;
use std::sync::Arc;
use std::time::Duration;

fn broker(transport: MockTransport) -> (BrokerClient<MockTransport>, Arc<BridgeMetrics>) {
    let config = BridgeConfig::from_toml_str(
        r#"
[mqtt]
host = "broker.local"
port = 1884
username = "u"
password = "p"
keep_alive_secs = 20
ping_timeout_secs = 4
"#,
    )
    .unwrap();
    let metrics = Arc::new(BridgeMetrics::new());
    (
        BrokerClient::new(config.mqtt, transport, metrics.clone()),
        metrics,
    )
}

#[tokio::test]
async fn test_session_options_follow_config() {
    let transport = MockTransport::new();
    let (broker, _) = broker(transport.clone());

    broker.connect("raspberrypi").await.unwrap();

    let session = &transport.opened_sessions()[0];
    assert_eq!(session.client_id, "raspberrypi");
    assert_eq!(session.server(), "tcp://broker.local:1884");
    assert_eq!(session.username.as_deref(), Some("u"));
    assert_eq!(session.password.as_deref(), Some("p"));
    assert_eq!(session.keep_alive, Duration::from_secs(20));
    assert_eq!(session.ping_timeout, Duration::from_secs(4));
}

#[test]
fn test_publish_on_disconnected_client_never_blocks() {
    let transport = MockTransport::new();
    let (broker, metrics) = broker(transport.clone());

    assert_eq!(broker.state(), ClientState::Disconnected);
    for _ in 0..1000 {
        assert_eq!(
            broker.publish("sensor-a", &Reading::new(21.5, 40.25)),
            PublishOutcome::Dropped(DropReason::NotConnected)
        );
    }

    assert!(transport.sent().is_empty());
    assert_eq!(metrics.snapshot().samples_dropped, 1000);
}

#[tokio::test]
async fn test_disconnect_twice_leaves_disconnected() {
    let transport = MockTransport::new();
    let (broker, metrics) = broker(transport.clone());
    broker.connect("host1").await.unwrap();
    assert!(metrics.snapshot().broker_connected);

    assert!(broker.disconnect().await.is_ok());
    assert!(broker.disconnect().await.is_ok());

    assert_eq!(broker.state(), ClientState::Disconnected);
    assert!(!metrics.snapshot().broker_connected);
    assert_eq!(transport.close_calls(), 1);
}

#[tokio::test]
async fn test_reconnect_after_explicit_disconnect() {
    let transport = MockTransport::new();
    let (broker, _) = broker(transport.clone());

    broker.connect("host1").await.unwrap();
    broker.disconnect().await.unwrap();
    broker.connect("host1").await.unwrap();

    assert_eq!(broker.state(), ClientState::Connected);
    assert_eq!(transport.opened_sessions().len(), 2);
}

#[tokio::test]
async fn test_auth_rejection_is_reported() {
    let transport =
        MockTransport::failing(BrokerError::AuthRejected("BadUserNamePassword".to_string()));
    let (broker, metrics) = broker(transport);

    let result = broker.connect("host1").await;

    assert_eq!(
        result,
        Err(BrokerError::AuthRejected("BadUserNamePassword".to_string()))
    );
    assert_eq!(broker.state(), ClientState::Disconnected);
    assert_eq!(metrics.snapshot().broker_connect_failures, 1);
    assert!(broker.disconnect().await.is_ok());
}
