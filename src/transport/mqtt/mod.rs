//! MQTT 3.1.1 transport for the bridge
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - Pure option building and error classification
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - Ping watchdog and link state transitions
//! - [`client`] - Impure I/O operations and the event loop driver
//!
//! # Usage
//!
//! ```rust,no_run
//! use ble_mqtt_bridge::transport::{mqtt::MqttTransport, SessionOptions, Transport};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let session = SessionOptions {
//!     client_id: "raspberrypi".to_string(),
//!     host: "localhost".to_string(),
//!     port: 1883,
//!     username: None,
//!     password: None,
//!     keep_alive: Duration::from_secs(30),
//!     ping_timeout: Duration::from_secs(10),
//!     connect_timeout: Duration::from_secs(30),
//! };
//!
//! let transport = MqttTransport::new();
//! transport.open(&session).await?;
//! transport.send("prometheus/job/raspberrypi/node/kitchen/temperature", "21.500000".to_string())?;
//! transport.close(Duration::from_millis(250)).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

// Re-export public types for convenience
pub use client::MqttTransport;
pub use connection::{configure_mqtt_options, LinkState};
pub use health_monitor::{HealthMonitor, LinkEvent, PingWatchdog};
pub use message_handler::{EventRoute, MessageHandler};
