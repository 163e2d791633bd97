//! BLE to MQTT telemetry bridge
//!
//! Connects to a fixed set of Bluetooth LE temperature/humidity sensors and
//! republishes every notification to an MQTT broker under Prometheus-style
//! topics:
//!
//! ```text
//! <namespace>/job/<clientID>/node/<deviceName>/temperature
//! <namespace>/job/<clientID>/node/<deviceName>/humidity
//! ```
//!
//! # Overview
//!
//! - [`broker::BrokerClient`] owns the single outbound session
//! - [`transport`] is the seam beneath it; [`transport::mqtt`] speaks MQTT 3.1.1
//! - [`peripheral`] abstracts the radio; the `ble` feature enables the btleplug host
//! - [`bridge`] holds the device registry and the lifecycle orchestrator
//!
//! # Quick Start
//!
//! ```rust
//! use ble_mqtt_bridge::broker::TopicBuilder;
//! use ble_mqtt_bridge::Reading;
//!
//! let topics = TopicBuilder::new("prometheus", "raspberrypi");
//! let messages = topics.build_messages("kitchen", &Reading::new(21.5, 40.25));
//!
//! assert_eq!(messages[0].0, "prometheus/job/raspberrypi/node/kitchen/temperature");
//! assert_eq!(messages[0].1, "21.500000");
//! ```

pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod observability;
pub mod peripheral;
pub mod reading;
pub mod testing;
pub mod transport;

pub use bridge::{BridgeLifecycle, ShutdownReport, StartupReport};
pub use broker::{BrokerClient, ClientState, PublishOutcome};
pub use config::*;
pub use error::{BridgeError, BridgeResult};
pub use reading::Reading;
pub use transport::mqtt::MqttTransport;
