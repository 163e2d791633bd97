//! Peripheral host abstraction
//!
//! The bridge never talks to a radio directly. It dials addresses through a
//! [`PeripheralHost`] and receives readings from each [`PeripheralConnection`]
//! through the [`ReadingSink`] it registers there. The sink is the message
//! passing boundary between a driver's own notification task and the
//! per-device publish task owned by the registry.

use crate::observability::metrics::BridgeMetrics;
use crate::reading::Reading;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[cfg(feature = "ble")]
pub mod ble;
pub mod codec;

/// Peripheral transport errors
#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("Peripheral {addr} not found")]
    NotFound { addr: String },
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },
    #[error("Failed to disconnect: {0}")]
    DisconnectFailed(String),
    #[error("Failed to subscribe to notifications: {0}")]
    Subscribe(String),
    #[error("Peripheral host initialization failed: {0}")]
    HostInit(String),
    #[error("Invalid peripheral address: {0}")]
    InvalidAddress(String),
}

/// Capability to dial peripherals by address
#[async_trait]
pub trait PeripheralHost: Send + Sync {
    /// Establish a connection to the peripheral at `addr`
    async fn dial(&self, addr: &str) -> Result<Box<dyn PeripheralConnection>, PeripheralError>;

    /// Release host-wide resources at process end
    async fn stop(&self) -> Result<(), PeripheralError>;
}

/// One connected peripheral
#[async_trait]
pub trait PeripheralConnection: Send + Sync {
    /// Install the sink that receives this peripheral's readings.
    /// Replaces any previously registered sink.
    fn register_handler(&mut self, sink: ReadingSink);

    async fn disconnect(&mut self) -> Result<(), PeripheralError>;
}

/// Outcome of handing a reading to the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Channel full; the sample was dropped
    Dropped,
    /// The bridge task is gone
    Closed,
}

/// Non-blocking producer half of a device's reading channel
#[derive(Debug, Clone)]
pub struct ReadingSink {
    device: Arc<str>,
    tx: mpsc::Sender<Reading>,
    metrics: Arc<BridgeMetrics>,
}

impl ReadingSink {
    pub fn new(device: Arc<str>, tx: mpsc::Sender<Reading>, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            device,
            tx,
            metrics,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Queue a reading without ever waiting on the consumer
    pub fn deliver(&self, reading: Reading) -> Delivery {
        self.metrics.reading_received();
        match self.tx.try_send(reading) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(reading)) => {
                self.metrics.sample_dropped();
                warn!(
                    device = %self.device,
                    reading = %reading,
                    "Reading channel full, dropping sample"
                );
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(device = %self.device, "Reading channel closed");
                Delivery::Closed
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
