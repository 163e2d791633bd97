//! Device registry
//!
//! Ordered collection of configured peripherals, their connections and the
//! per-device bridge tasks that drain readings into the publish handler.

use crate::config::DeviceDescriptor;
use crate::device_span;
use crate::error::BridgeError;
use crate::observability::BridgeMetrics;
use crate::peripheral::{PeripheralConnection, PeripheralHost, ReadingSink};
use crate::reading::Reading;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Callback invoked by a bridge task for every reading, in arrival order
pub type ReadingHandler = Arc<dyn Fn(&str, &Reading) + Send + Sync>;

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Duplicate device name: {0}")]
    DuplicateDevice(String),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Device {0} is not connected")]
    NotConnected(String),
}

/// Per-device connection state; there is no transition back to `Connected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Unconnected,
    Connected,
    Disconnected,
}

/// Outcome of dialling one device
#[derive(Debug)]
pub struct ConnectResult {
    pub device: String,
    pub result: Result<(), BridgeError>,
}

/// Outcome of disconnecting one device
#[derive(Debug)]
pub struct DisconnectResult {
    pub device: String,
    pub result: Result<(), BridgeError>,
}

struct DeviceEntry {
    descriptor: DeviceDescriptor,
    name: Arc<str>,
    state: DeviceState,
    /// Set once the device has been dialled; never cleared
    dialled: bool,
    connection: Option<Box<dyn PeripheralConnection>>,
    bridge: Option<JoinHandle<()>>,
    /// Replaced bridges still delivering what their channel held
    retired: Vec<JoinHandle<()>>,
}

pub struct DeviceRegistry {
    entries: Vec<DeviceEntry>,
    reading_buffer: usize,
    metrics: Arc<BridgeMetrics>,
}

impl DeviceRegistry {
    pub fn new(
        devices: Vec<DeviceDescriptor>,
        reading_buffer: usize,
        metrics: Arc<BridgeMetrics>,
    ) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for device in &devices {
            if !seen.insert(device.name.clone()) {
                return Err(RegistryError::DuplicateDevice(device.name.clone()));
            }
        }

        let entries = devices
            .into_iter()
            .map(|descriptor| DeviceEntry {
                name: Arc::from(descriptor.name.as_str()),
                descriptor,
                state: DeviceState::Unconnected,
                dialled: false,
                connection: None,
                bridge: None,
                retired: Vec::new(),
            })
            .collect();

        Ok(Self {
            entries,
            // tokio channels cannot have zero capacity
            reading_buffer: reading_buffer.max(1),
            metrics,
        })
    }

    /// Dial every device not yet dialled, in declaration order
    ///
    /// Each device is dialled at most once per registry. A device whose dial
    /// failed stays `Unconnected` and later calls skip it.
    pub async fn connect_all(&mut self, host: &dyn PeripheralHost) -> Vec<ConnectResult> {
        let mut results = Vec::with_capacity(self.entries.len());

        for entry in &mut self.entries {
            if entry.dialled {
                debug!(device = %entry.descriptor.name, "Device already dialled, skipping");
                continue;
            }
            entry.dialled = true;
            let descriptor = &entry.descriptor;
            let span = device_span!(device = %descriptor.name, addr = %descriptor.addr);

            let result = async {
                info!("Connecting to device");
                host.dial(&descriptor.addr).await
            }
            .instrument(span)
            .await;

            let result = match result {
                Ok(connection) => {
                    entry.connection = Some(connection);
                    entry.state = DeviceState::Connected;
                    self.metrics.device_connected();
                    info!(device = %descriptor.name, "Device connected");
                    Ok(())
                }
                Err(e) => {
                    self.metrics.device_connect_failed();
                    warn!(
                        device = %descriptor.name,
                        addr = %descriptor.addr,
                        error = %e,
                        "Device connection failed, skipping"
                    );
                    Err(BridgeError::device_connect_failed(&descriptor.name, &e))
                }
            };

            results.push(ConnectResult {
                device: descriptor.name.clone(),
                result,
            });
        }

        results
    }

    /// Bridge `name`'s readings into `handler`, replacing any previous bridge
    pub fn register_handler(
        &mut self,
        name: &str,
        handler: ReadingHandler,
    ) -> Result<(), RegistryError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.descriptor.name == name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))?;

        let connection = match (entry.state, entry.connection.as_mut()) {
            (DeviceState::Connected, Some(connection)) => connection,
            _ => return Err(RegistryError::NotConnected(name.to_string())),
        };

        // The connection drops the old sink below, so the old bridge ends
        // once its queue is empty
        if let Some(previous) = entry.bridge.take() {
            debug!(device = %name, "Replacing bridge task");
            entry.retired.push(previous);
        }

        let (tx, rx) = mpsc::channel(self.reading_buffer);
        connection.register_handler(ReadingSink::new(
            entry.name.clone(),
            tx,
            self.metrics.clone(),
        ));

        let span = device_span!(device = %name);
        entry.bridge = Some(tokio::spawn(
            run_bridge(entry.name.clone(), rx, handler).instrument(span),
        ));
        info!(device = %name, "Publish handler registered");
        Ok(())
    }

    /// Register `handler` on every connected device; returns how many accepted it
    pub fn register_all(&mut self, handler: ReadingHandler) -> usize {
        let mut registered = 0;
        for name in self.connected_names() {
            match self.register_handler(&name, handler.clone()) {
                Ok(()) => registered += 1,
                Err(e) => warn!(device = %name, error = %e, "Handler registration failed"),
            }
        }
        registered
    }

    /// Disconnect every connected device in declaration order, then drain bridges
    pub async fn disconnect_all(&mut self, drain: Duration) -> Vec<DisconnectResult> {
        let mut results = Vec::new();

        for entry in &mut self.entries {
            if entry.state != DeviceState::Connected {
                continue;
            }
            entry.state = DeviceState::Disconnected;
            let Some(mut connection) = entry.connection.take() else {
                continue;
            };

            let name = entry.descriptor.name.clone();
            let result = match connection.disconnect().await {
                Ok(()) => {
                    info!(device = %name, "Device disconnected");
                    Ok(())
                }
                Err(e) => {
                    self.metrics.device_disconnect_failed();
                    warn!(device = %name, error = %e, "Device disconnect failed");
                    Err(BridgeError::device_disconnect_failed(&name, &e))
                }
            };
            self.metrics.device_disconnected();
            // Dropping the connection releases the producer half of its channel
            drop(connection);

            results.push(DisconnectResult {
                device: name,
                result,
            });
        }

        self.drain_bridges(drain).await;
        results
    }

    /// Wait for bridge tasks to publish what was already queued
    async fn drain_bridges(&mut self, drain: Duration) {
        let deadline = tokio::time::Instant::now() + drain;

        for entry in &mut self.entries {
            let bridges = entry.retired.drain(..).chain(entry.bridge.take());
            for mut bridge in bridges.collect::<Vec<_>>() {
                if tokio::time::timeout_at(deadline, &mut bridge).await.is_err() {
                    warn!(
                        device = %entry.descriptor.name,
                        drain_ms = drain.as_millis() as u64,
                        "Bridge did not drain in time, aborting"
                    );
                    bridge.abort();
                }
            }
        }
    }

    pub fn state(&self, name: &str) -> Option<DeviceState> {
        self.entries
            .iter()
            .find(|entry| entry.descriptor.name == name)
            .map(|entry| entry.state)
    }

    /// Names of connected devices in declaration order
    pub fn connected_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.state == DeviceState::Connected)
            .map(|entry| entry.descriptor.name.clone())
            .collect()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.entries.iter().map(|entry| &entry.descriptor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for entry in &mut self.entries {
            for bridge in entry.retired.drain(..).chain(entry.bridge.take()) {
                bridge.abort();
            }
        }
    }
}

async fn run_bridge(
    device: Arc<str>,
    mut readings: mpsc::Receiver<Reading>,
    handler: ReadingHandler,
) {
    while let Some(reading) = readings.recv().await {
        handler(&device, &reading);
    }
    debug!(device = %device, "Reading channel closed, bridge finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockHost;
    use std::sync::Mutex;

    fn devices() -> Vec<DeviceDescriptor> {
        vec![
            DeviceDescriptor::new("a", "addr-a"),
            DeviceDescriptor::new("b", "addr-b"),
            DeviceDescriptor::new("c", "addr-c"),
        ]
    }

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(devices(), 8, Arc::new(BridgeMetrics::new())).unwrap()
    }

    fn recording_handler() -> (ReadingHandler, Arc<Mutex<Vec<(String, Reading)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: ReadingHandler = Arc::new(move |device: &str, reading: &Reading| {
            sink.lock().unwrap().push((device.to_string(), *reading));
        });
        (handler, seen)
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = DeviceRegistry::new(
            vec![
                DeviceDescriptor::new("a", "addr-1"),
                DeviceDescriptor::new("a", "addr-2"),
            ],
            8,
            Arc::new(BridgeMetrics::new()),
        );
        assert!(matches!(result, Err(RegistryError::DuplicateDevice(name)) if name == "a"));
    }

    #[tokio::test]
    async fn test_connect_all_dials_each_device_once() {
        let host = MockHost::new().with_unreachable("addr-b");
        let mut registry = registry();

        let results = registry.connect_all(&host).await;

        assert_eq!(host.dial_count(), 3);
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.result.is_ok()).count(), 2);
        assert!(matches!(
            &results[1].result,
            Err(BridgeError::DeviceConnectFailed { device, .. }) if device == "b"
        ));
        assert_eq!(registry.state("a"), Some(DeviceState::Connected));
        assert_eq!(registry.state("b"), Some(DeviceState::Unconnected));
        assert_eq!(registry.connected_names(), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_connect_all_never_redials_failed_device() {
        let host = MockHost::new().with_unreachable("addr-b");
        let mut registry = registry();

        registry.connect_all(&host).await;
        let second = registry.connect_all(&host).await;

        assert!(second.is_empty());
        assert_eq!(host.dial_count(), 3);
        assert_eq!(registry.state("b"), Some(DeviceState::Unconnected));
    }

    #[tokio::test]
    async fn test_register_handler_requires_connection() {
        let host = MockHost::new().with_unreachable("addr-b");
        let mut registry = registry();
        registry.connect_all(&host).await;
        let (handler, _) = recording_handler();

        assert_eq!(
            registry.register_handler("b", handler.clone()),
            Err(RegistryError::NotConnected("b".to_string()))
        );
        assert_eq!(
            registry.register_handler("zzz", handler.clone()),
            Err(RegistryError::UnknownDevice("zzz".to_string()))
        );
        assert_eq!(registry.register_all(handler), 2);
    }

    #[tokio::test]
    async fn test_readings_reach_handler_in_order() {
        let host = MockHost::new();
        let mut registry = registry();
        registry.connect_all(&host).await;
        let (handler, seen) = recording_handler();
        registry.register_handler("a", handler).unwrap();

        let peripheral = host.peripheral("addr-a").unwrap();
        for i in 0..5 {
            peripheral.notify(Reading::new(20.0 + f64::from(i), 50.0));
        }
        registry.disconnect_all(Duration::from_secs(1)).await;

        let temperatures: Vec<f64> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reading)| reading.temperature)
            .collect();
        assert_eq!(temperatures, vec![20.0, 21.0, 22.0, 23.0, 24.0]);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_sink() {
        let host = MockHost::new();
        let mut registry = registry();
        registry.connect_all(&host).await;

        let (first, first_seen) = recording_handler();
        let (second, second_seen) = recording_handler();
        registry.register_handler("a", first).unwrap();
        registry.register_handler("a", second).unwrap();

        let peripheral = host.peripheral("addr-a").unwrap();
        assert_eq!(peripheral.registrations(), 2);
        peripheral.notify(Reading::new(21.0, 45.0));
        registry.disconnect_all(Duration::from_secs(1)).await;

        assert!(first_seen.lock().unwrap().is_empty());
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reregistration_keeps_queued_readings() {
        let host = MockHost::new();
        let mut registry = registry();
        registry.connect_all(&host).await;

        let (first, first_seen) = recording_handler();
        let (second, second_seen) = recording_handler();
        registry.register_handler("a", first).unwrap();
        let peripheral = host.peripheral("addr-a").unwrap();
        // Queued before the first bridge task has had a chance to run
        peripheral.notify(Reading::new(21.5, 40.25));
        registry.register_handler("a", second).unwrap();
        peripheral.notify(Reading::new(22.0, 41.0));

        registry.disconnect_all(Duration::from_secs(1)).await;

        let first_seen = first_seen.lock().unwrap();
        assert_eq!(first_seen.len(), 1);
        assert_eq!(first_seen[0].1, Reading::new(21.5, 40.25));
        assert_eq!(second_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_all_continues_after_failure() {
        let host = MockHost::new()
            .with_unreachable("addr-c")
            .with_failing_disconnect("addr-a");
        let mut registry = registry();
        registry.connect_all(&host).await;

        let results = registry.disconnect_all(Duration::from_millis(100)).await;

        // c never connected, so only a and b are disconnected
        let devices: Vec<&str> = results.iter().map(|r| r.device.as_str()).collect();
        assert_eq!(devices, vec!["a", "b"]);
        assert!(results[0].result.is_err());
        assert!(results[1].result.is_ok());
        assert_eq!(registry.state("a"), Some(DeviceState::Disconnected));
        assert_eq!(registry.state("c"), Some(DeviceState::Unconnected));
        assert!(registry.connected_names().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_all_aborts_stuck_bridge() {
        let host = MockHost::new();
        let mut registry = registry();
        registry.connect_all(&host).await;

        let handler: ReadingHandler = Arc::new(|_: &str, _: &Reading| {
            std::thread::sleep(Duration::from_millis(50));
        });
        registry.register_handler("a", handler).unwrap();
        let peripheral = host.peripheral("addr-a").unwrap();
        for _ in 0..8 {
            peripheral.notify(Reading::new(20.0, 50.0));
        }

        let started = std::time::Instant::now();
        registry.disconnect_all(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let metrics = Arc::new(BridgeMetrics::new());
        let mut registry =
            DeviceRegistry::new(vec![DeviceDescriptor::new("a", "addr-a")], 1, metrics.clone())
                .unwrap();
        let host = MockHost::new();
        registry.connect_all(&host).await;
        let (handler, seen) = recording_handler();
        registry.register_handler("a", handler).unwrap();

        // The bridge task cannot run until this test yields
        let peripheral = host.peripheral("addr-a").unwrap();
        for _ in 0..10 {
            peripheral.notify(Reading::new(20.0, 50.0));
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.readings_received, 10);
        assert_eq!(snapshot.samples_dropped, 9);

        registry.disconnect_all(Duration::from_secs(1)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
