//! Thread-safe bridge counters
//!
//! One [`BridgeMetrics`] instance is owned by the lifecycle context and shared
//! by reference with the broker client, the registry and every reading sink.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters for peripheral, bridge and broker activity
#[derive(Debug)]
pub struct BridgeMetrics {
    // Peripheral metrics
    devices_connected: AtomicU64,
    device_connect_failures: AtomicU64,
    device_disconnect_failures: AtomicU64,

    // Notification pipeline metrics (atomic for high frequency)
    readings_received: AtomicU64,
    samples_published: AtomicU64,
    samples_dropped: AtomicU64,
    publish_failures: AtomicU64,

    // Broker metrics
    broker_connected: AtomicBool,
    broker_connect_failures: AtomicU64,

    started: Instant,
}

/// Point-in-time copy of [`BridgeMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub devices_connected: u64,
    pub device_connect_failures: u64,
    pub device_disconnect_failures: u64,
    pub readings_received: u64,
    pub samples_published: u64,
    pub samples_dropped: u64,
    pub publish_failures: u64,
    pub broker_connected: bool,
    pub broker_connect_failures: u64,
    pub uptime_secs: u64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            devices_connected: AtomicU64::new(0),
            device_connect_failures: AtomicU64::new(0),
            device_disconnect_failures: AtomicU64::new(0),
            readings_received: AtomicU64::new(0),
            samples_published: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            broker_connect_failures: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn device_connected(&self) {
        self.devices_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_connect_failed(&self) {
        self.device_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_disconnected(&self) {
        // Saturating: a device is only counted down once it was counted up
        let _ = self
            .devices_connected
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn device_disconnect_failed(&self) {
        self.device_disconnect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_received(&self) {
        self.readings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_published(&self) {
        self.samples_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sample_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn broker_connect_failed(&self) {
        self.broker_connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            devices_connected: self.devices_connected.load(Ordering::Relaxed),
            device_connect_failures: self.device_connect_failures.load(Ordering::Relaxed),
            device_disconnect_failures: self.device_disconnect_failures.load(Ordering::Relaxed),
            readings_received: self.readings_received.load(Ordering::Relaxed),
            samples_published: self.samples_published.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            broker_connected: self.broker_connected.load(Ordering::Relaxed),
            broker_connect_failures: self.broker_connect_failures.load(Ordering::Relaxed),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}
