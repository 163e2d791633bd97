//! Bridge lifecycle management
//!
//! Startup connects the broker, then every device, then wires each connected
//! device to the broker. Shutdown runs in reverse: devices first, so that no
//! notification can publish once the broker link begins closing.

use super::registry::{ConnectResult, DeviceRegistry, DisconnectResult, ReadingHandler};
use crate::broker::BrokerClient;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::lifecycle_span;
use crate::observability::{BridgeMetrics, MetricsSnapshot};
use crate::peripheral::PeripheralHost;
use crate::reading::Reading;
use crate::transport::Transport;
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn, Instrument};

/// What happened during [`BridgeLifecycle::start`]
#[derive(Debug)]
pub struct StartupReport {
    pub client_id: String,
    pub broker: Result<(), BridgeError>,
    pub devices: Vec<ConnectResult>,
    pub handlers_registered: usize,
}

impl StartupReport {
    pub fn broker_connected(&self) -> bool {
        self.broker.is_ok()
    }

    pub fn connected_devices(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|r| r.result.is_ok())
            .map(|r| r.device.as_str())
            .collect()
    }

    pub fn failed_devices(&self) -> Vec<&str> {
        self.devices
            .iter()
            .filter(|r| r.result.is_err())
            .map(|r| r.device.as_str())
            .collect()
    }
}

/// What happened during [`BridgeLifecycle::shutdown`]
#[derive(Debug)]
pub struct ShutdownReport {
    pub devices: Vec<DisconnectResult>,
    pub broker: Result<(), BridgeError>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    Stopped,
}

/// Owns the broker client, the device registry and the peripheral host
pub struct BridgeLifecycle<T>
where
    T: Transport + 'static,
{
    config: BridgeConfig,
    client_id: String,
    host: Box<dyn PeripheralHost>,
    broker: Arc<BrokerClient<T>>,
    registry: DeviceRegistry,
    metrics: Arc<BridgeMetrics>,
    phase: Phase,
}

impl<T> BridgeLifecycle<T>
where
    T: Transport + 'static,
{
    /// Create a lifecycle manager with injected dependencies
    pub fn new(
        config: BridgeConfig,
        client_id: impl Into<String>,
        host: Box<dyn PeripheralHost>,
        transport: T,
    ) -> Result<Self, BridgeError> {
        let metrics = Arc::new(BridgeMetrics::new());
        let registry = DeviceRegistry::new(
            config.devices.clone(),
            config.bridge.reading_buffer,
            metrics.clone(),
        )?;
        let broker = Arc::new(BrokerClient::new(
            config.mqtt.clone(),
            transport,
            metrics.clone(),
        ));

        Ok(Self {
            config,
            client_id: client_id.into(),
            host,
            broker,
            registry,
            metrics,
            phase: Phase::Created,
        })
    }

    /// Connect the broker and every device, then register publish handlers
    ///
    /// Only the first call does anything. Later calls connect nothing and
    /// report no devices.
    pub async fn start(&mut self) -> StartupReport {
        if self.phase != Phase::Created {
            info!(phase = ?self.phase, "Bridge already started");
            let broker = if self.broker.is_connected() {
                Ok(())
            } else {
                Err(BridgeError::BrokerUnreachable {
                    reason: "broker client is not connected".to_string(),
                })
            };
            return StartupReport {
                client_id: self.client_id.clone(),
                broker,
                devices: Vec::new(),
                handlers_registered: 0,
            };
        }

        let span = lifecycle_span!(phase = "startup", client_id = %self.client_id);
        let report = async {
            info!(devices = self.registry.len(), "Starting bridge");

            let broker = match self.broker.connect(&self.client_id).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    error!(error = %e, "Broker connection failed, continuing without broker");
                    Err(BridgeError::from(e))
                }
            };

            let devices = self.registry.connect_all(self.host.as_ref()).await;
            let handlers_registered = self
                .registry
                .register_all(Self::publish_handler(self.broker.clone()));

            StartupReport {
                client_id: self.client_id.clone(),
                broker,
                devices,
                handlers_registered,
            }
        }
        .instrument(span)
        .await;

        self.phase = Phase::Running;
        info!(
            broker_connected = report.broker_connected(),
            connected = ?report.connected_devices(),
            failed = ?report.failed_devices(),
            "Bridge started"
        );
        report
    }

    /// Handler bridging a device's readings to the broker
    fn publish_handler(broker: Arc<BrokerClient<T>>) -> ReadingHandler {
        // Drops are logged and counted by the broker client
        Arc::new(move |device: &str, reading: &Reading| {
            broker.publish(device, reading);
        })
    }

    /// Disconnect devices, drain bridges, close the broker, stop the host
    ///
    /// A second call only reports the current counters.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        if self.phase == Phase::Stopped {
            info!("Bridge already shut down");
            return ShutdownReport {
                devices: Vec::new(),
                broker: Ok(()),
                metrics: self.metrics.snapshot(),
            };
        }
        self.phase = Phase::Stopped;

        let span = lifecycle_span!(phase = "shutdown", client_id = %self.client_id);
        let drain = self.config.bridge.drain_timeout();
        let (devices, broker) = async {
            info!("Shutting down bridge");

            let devices = self.registry.disconnect_all(drain).await;
            let broker = self.broker.disconnect().await.map_err(BridgeError::from);

            if let Err(e) = self.host.stop().await {
                warn!(error = %e, "Peripheral host did not stop cleanly");
            }
            (devices, broker)
        }
        .instrument(span)
        .await;

        let metrics = self.metrics.snapshot();
        info!(
            readings_received = metrics.readings_received,
            samples_published = metrics.samples_published,
            samples_dropped = metrics.samples_dropped,
            publish_failures = metrics.publish_failures,
            uptime_secs = metrics.uptime_secs,
            "Bridge shutdown complete"
        );

        ShutdownReport {
            devices,
            broker,
            metrics,
        }
    }

    /// Start, wait for `termination`, then shut down
    pub async fn run<F>(&mut self, termination: F) -> (StartupReport, ShutdownReport)
    where
        F: Future<Output = ()>,
    {
        let startup = self.start().await;
        info!("Bridge running, waiting for termination signal");
        termination.await;
        let shutdown = self.shutdown().await;
        (startup, shutdown)
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker(&self) -> &Arc<BrokerClient<T>> {
        &self.broker
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }
}

/// Future completing on the first SIGINT or SIGTERM
///
/// The signal handlers are installed before this returns, so a signal that
/// arrives during startup still ends the run.
pub fn termination_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    })
}
