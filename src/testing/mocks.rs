//! Mock implementations for testing
//!
//! Provides mock Transport and PeripheralHost implementations so the bridge
//! can be exercised without a broker or a radio. All mocks can share one
//! [`EventLog`] to assert ordering across components.

use crate::peripheral::{
    Delivery, PeripheralConnection, PeripheralError, PeripheralHost, ReadingSink,
};
use crate::reading::Reading;
use crate::transport::{BrokerError, SessionOptions, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Ordered record of side effects shared between mocks
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    /// Index of the first entry equal to `entry`
    pub fn position(&self, entry: &str) -> Option<usize> {
        lock(&self.entries).iter().position(|e| e == entry)
    }

    /// Entries starting with `prefix`, in order
    pub fn matching(&self, prefix: &str) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Default)]
struct MockTransportState {
    open_error: Mutex<Option<BrokerError>>,
    probe_fails: AtomicBool,
    send_fails: AtomicBool,
    link_up: AtomicBool,
    opened: Mutex<Vec<SessionOptions>>,
    probes: Mutex<Vec<(String, String)>>,
    sent: Mutex<Vec<(String, String)>>,
    close_calls: AtomicUsize,
}

/// Mock transport for testing; clones share state
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<MockTransportState>,
    events: EventLog,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose every `open` fails with `error`
    pub fn failing(error: BrokerError) -> Self {
        let transport = Self::default();
        *lock(&transport.state.open_error) = Some(error);
        transport
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn fail_probe(&self, fail: bool) {
        self.state.probe_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.state.send_fails.store(fail, Ordering::SeqCst);
    }

    /// Simulate a lost (or restored) link
    pub fn set_link_up(&self, up: bool) {
        self.state.link_up.store(up, Ordering::SeqCst);
    }

    pub fn opened_sessions(&self) -> Vec<SessionOptions> {
        lock(&self.state.opened).clone()
    }

    pub fn probes(&self) -> Vec<(String, String)> {
        lock(&self.state.probes).clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.state.sent).clone()
    }

    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, session: &SessionOptions) -> Result<(), BrokerError> {
        self.events.record(format!("broker:open:{}", session.client_id));
        if let Some(error) = lock(&self.state.open_error).clone() {
            return Err(error);
        }
        lock(&self.state.opened).push(session.clone());
        self.set_link_up(true);
        Ok(())
    }

    async fn probe(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        if self.state.probe_fails.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed("mock probe failure".to_string()));
        }
        lock(&self.state.probes).push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn send(&self, topic: &str, payload: String) -> Result<(), BrokerError> {
        if !self.is_link_up() {
            return Err(BrokerError::NotConnected);
        }
        if self.state.send_fails.load(Ordering::SeqCst) {
            return Err(BrokerError::PublishFailed("mock send failure".to_string()));
        }
        self.events.record(format!("broker:send:{topic}"));
        lock(&self.state.sent).push((topic.to_string(), payload));
        Ok(())
    }

    async fn close(&self, _linger: Duration) -> Result<(), BrokerError> {
        self.events.record("broker:close");
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_link_up(false);
        Ok(())
    }

    fn is_link_up(&self) -> bool {
        self.state.link_up.load(Ordering::SeqCst)
    }
}

/// Test-side handle to a peripheral dialled through [`MockHost`]
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    addr: String,
    sink: Arc<Mutex<Option<ReadingSink>>>,
    registrations: Arc<AtomicUsize>,
}

impl MockPeripheral {
    /// Emit a notification the way a radio driver would
    pub fn notify(&self, reading: Reading) -> Option<Delivery> {
        lock(&self.sink).as_ref().map(|sink| sink.deliver(reading))
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn has_handler(&self) -> bool {
        lock(&self.sink).is_some()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }
}

/// Mock connection produced by [`MockHost::dial`]
pub struct MockConnection {
    peripheral: MockPeripheral,
    fail_disconnect: bool,
    events: EventLog,
}

#[async_trait]
impl PeripheralConnection for MockConnection {
    fn register_handler(&mut self, sink: ReadingSink) {
        self.peripheral.registrations.fetch_add(1, Ordering::SeqCst);
        *lock(&self.peripheral.sink) = Some(sink);
    }

    async fn disconnect(&mut self) -> Result<(), PeripheralError> {
        self.events
            .record(format!("device:disconnect:{}", self.peripheral.addr));
        // The driver stops notifying once disconnected
        lock(&self.peripheral.sink).take();
        if self.fail_disconnect {
            return Err(PeripheralError::DisconnectFailed(format!(
                "mock disconnect failure for {}",
                self.peripheral.addr
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MockHostState {
    unreachable: Mutex<HashSet<String>>,
    failing_disconnect: Mutex<HashSet<String>>,
    peripherals: Mutex<HashMap<String, MockPeripheral>>,
    dials: AtomicUsize,
    stops: AtomicUsize,
}

/// Mock peripheral host; every address is reachable unless marked otherwise
#[derive(Debug, Clone, Default)]
pub struct MockHost {
    state: Arc<MockHostState>,
    events: EventLog,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn with_unreachable(self, addr: impl Into<String>) -> Self {
        lock(&self.state.unreachable).insert(addr.into());
        self
    }

    pub fn with_failing_disconnect(self, addr: impl Into<String>) -> Self {
        lock(&self.state.failing_disconnect).insert(addr.into());
        self
    }

    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.state.stops.load(Ordering::SeqCst)
    }

    /// Handle to the peripheral last dialled at `addr`
    pub fn peripheral(&self, addr: &str) -> Option<MockPeripheral> {
        lock(&self.state.peripherals).get(addr).cloned()
    }
}

#[async_trait]
impl PeripheralHost for MockHost {
    async fn dial(&self, addr: &str) -> Result<Box<dyn PeripheralConnection>, PeripheralError> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        self.events.record(format!("device:dial:{addr}"));

        if lock(&self.state.unreachable).contains(addr) {
            return Err(PeripheralError::ConnectFailed {
                addr: addr.to_string(),
                reason: "mock peripheral unreachable".to_string(),
            });
        }

        let peripheral = MockPeripheral {
            addr: addr.to_string(),
            sink: Arc::new(Mutex::new(None)),
            registrations: Arc::new(AtomicUsize::new(0)),
        };
        lock(&self.state.peripherals).insert(addr.to_string(), peripheral.clone());

        Ok(Box::new(MockConnection {
            peripheral,
            fail_disconnect: lock(&self.state.failing_disconnect).contains(addr),
            events: self.events.clone(),
        }))
    }

    async fn stop(&self) -> Result<(), PeripheralError> {
        self.state.stops.fetch_add(1, Ordering::SeqCst);
        self.events.record("host:stop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::BridgeMetrics;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mock_host_records_dials() {
        let events = EventLog::new();
        let host = MockHost::new()
            .with_event_log(events.clone())
            .with_unreachable("bad");

        assert!(host.dial("good").await.is_ok());
        assert!(host.dial("bad").await.is_err());

        assert_eq!(host.dial_count(), 2);
        assert_eq!(events.matching("device:dial:"), vec!["device:dial:good", "device:dial:bad"]);
        assert!(host.peripheral("bad").is_none());
    }

    #[tokio::test]
    async fn test_mock_peripheral_notify() {
        let host = MockHost::new();
        let mut connection = host.dial("addr-1").await.unwrap();
        let peripheral = host.peripheral("addr-1").unwrap();
        assert_eq!(peripheral.notify(Reading::new(1.0, 2.0)), None);

        let (tx, mut rx) = mpsc::channel(4);
        connection.register_handler(ReadingSink::new(
            Arc::from("a"),
            tx,
            Arc::new(BridgeMetrics::new()),
        ));

        assert_eq!(peripheral.notify(Reading::new(1.0, 2.0)), Some(Delivery::Queued));
        assert_eq!(rx.recv().await, Some(Reading::new(1.0, 2.0)));

        connection.disconnect().await.unwrap();
        assert!(!peripheral.has_handler());
    }

    #[tokio::test]
    async fn test_mock_transport_link() {
        let transport = MockTransport::new();
        assert_eq!(
            transport.send("t", "1".to_string()),
            Err(BrokerError::NotConnected)
        );

        transport
            .open(&SessionOptions {
                client_id: "host1".to_string(),
                host: "localhost".to_string(),
                port: 1883,
                username: None,
                password: None,
                keep_alive: Duration::from_secs(30),
                ping_timeout: Duration::from_secs(10),
                connect_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        assert!(transport.send("t", "1".to_string()).is_ok());

        transport.close(Duration::ZERO).await.unwrap();
        assert!(!transport.is_link_up());
        assert_eq!(transport.sent(), vec![("t".to_string(), "1".to_string())]);
    }
}
