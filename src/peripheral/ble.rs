//! Bluetooth LE peripheral host backed by btleplug
//!
//! The host keeps one adapter scanning for the process lifetime. Dialling an
//! address waits for the peripheral to be discovered, connects, subscribes to
//! the notify characteristic and spawns a driver task that decodes every
//! notification into the registered [`ReadingSink`].

use super::codec::{self, PayloadFormat};
use super::{PeripheralConnection, PeripheralError, PeripheralHost, ReadingSink};
use crate::config::BleSection;
use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, ValueNotification,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// LYWSD03MMC temperature/humidity notify characteristic
pub const LYWSD03_CHARACTERISTIC: Uuid = Uuid::from_u128(0xebe0ccc1_7a0a_4b0c_8a1a_6ff2997da3a6);

/// MJ_HT_V1 ASCII notify characteristic
pub const MIJIA_CHARACTERISTIC: Uuid = Uuid::from_u128(0x226caa55_6476_4566_7562_66734470666d);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

type SharedSink = Arc<Mutex<Option<ReadingSink>>>;

fn lock_sink(sink: &SharedSink) -> MutexGuard<'_, Option<ReadingSink>> {
    sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Notify characteristic implied by a payload format
pub fn default_characteristic(format: PayloadFormat) -> Uuid {
    match format {
        PayloadFormat::Lywsd03 => LYWSD03_CHARACTERISTIC,
        PayloadFormat::MijiaAscii => MIJIA_CHARACTERISTIC,
    }
}

pub struct BleHost {
    adapter: Adapter,
    format: PayloadFormat,
    characteristic: Uuid,
    scan_timeout: Duration,
}

impl BleHost {
    /// Open the configured adapter and start scanning
    pub async fn new(section: &BleSection) -> Result<Self, PeripheralError> {
        let characteristic = match &section.characteristic {
            Some(raw) => Uuid::parse_str(raw).map_err(|e| {
                PeripheralError::HostInit(format!("invalid characteristic UUID '{raw}': {e}"))
            })?,
            None => default_characteristic(section.format),
        };

        let manager = Manager::new()
            .await
            .map_err(|e| PeripheralError::HostInit(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| PeripheralError::HostInit(e.to_string()))?
            .into_iter()
            .nth(section.adapter)
            .ok_or_else(|| {
                let adapter = section.adapter;
                PeripheralError::HostInit(format!("Bluetooth adapter {adapter} not found"))
            })?;

        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| PeripheralError::HostInit(format!("failed to start scan: {e}")))?;

        info!(
            adapter = section.adapter,
            format = ?section.format,
            characteristic = %characteristic,
            "Bluetooth LE host started"
        );

        Ok(Self {
            adapter,
            format: section.format,
            characteristic,
            scan_timeout: Duration::from_secs(section.scan_timeout_secs),
        })
    }

    /// Wait until the scan has discovered `target`
    async fn find_peripheral(
        &self,
        addr: &str,
        target: BDAddr,
    ) -> Result<Peripheral, PeripheralError> {
        match tokio::time::timeout(self.scan_timeout, self.poll_discovered(target)).await {
            Ok(Ok(peripheral)) => Ok(peripheral),
            Ok(Err(e)) => Err(PeripheralError::ConnectFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(PeripheralError::NotFound {
                addr: addr.to_string(),
            }),
        }
    }

    async fn poll_discovered(&self, target: BDAddr) -> Result<Peripheral, btleplug::Error> {
        loop {
            let peripherals = self.adapter.peripherals().await?;
            if let Some(found) = peripherals.into_iter().find(|p| p.address() == target) {
                return Ok(found);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    async fn subscribe(
        &self,
        addr: &str,
        peripheral: &Peripheral,
    ) -> Result<Uuid, PeripheralError> {
        peripheral
            .discover_services()
            .await
            .map_err(|e| PeripheralError::Subscribe(format!("{addr}: {e}")))?;

        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == self.characteristic && c.properties.contains(CharPropFlags::NOTIFY))
            .ok_or_else(|| {
                PeripheralError::Subscribe(format!(
                    "{addr}: notify characteristic {} not found",
                    self.characteristic
                ))
            })?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| PeripheralError::Subscribe(format!("{addr}: {e}")))?;
        Ok(characteristic.uuid)
    }
}

#[async_trait]
impl PeripheralHost for BleHost {
    async fn dial(&self, addr: &str) -> Result<Box<dyn PeripheralConnection>, PeripheralError> {
        let target: BDAddr = addr
            .parse()
            .map_err(|_| PeripheralError::InvalidAddress(addr.to_string()))?;
        let peripheral = self.find_peripheral(addr, target).await?;

        let connected = peripheral.is_connected().await.unwrap_or(false);
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|e| PeripheralError::ConnectFailed {
                    addr: addr.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let characteristic = match self.subscribe(addr, &peripheral).await {
            Ok(uuid) => uuid,
            Err(e) => {
                release_peripheral(addr, &peripheral).await;
                return Err(e);
            }
        };

        let notifications = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                release_peripheral(addr, &peripheral).await;
                return Err(PeripheralError::Subscribe(format!("{addr}: {e}")));
            }
        };

        let sink: SharedSink = Arc::new(Mutex::new(None));
        let driver = tokio::spawn(drive_notifications(
            addr.to_string(),
            self.format,
            characteristic,
            notifications,
            sink.clone(),
        ));

        debug!(addr = %addr, characteristic = %characteristic, "Subscribed to notifications");
        Ok(Box::new(BleConnection {
            addr: addr.to_string(),
            peripheral,
            driver: Some(driver),
            sink,
        }))
    }

    async fn stop(&self) -> Result<(), PeripheralError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| PeripheralError::DisconnectFailed(format!("failed to stop scan: {e}")))?;
        info!("Bluetooth LE host stopped");
        Ok(())
    }
}

struct BleConnection {
    addr: String,
    peripheral: Peripheral,
    driver: Option<JoinHandle<()>>,
    sink: SharedSink,
}

#[async_trait]
impl PeripheralConnection for BleConnection {
    fn register_handler(&mut self, sink: ReadingSink) {
        *lock_sink(&self.sink) = Some(sink);
    }

    async fn disconnect(&mut self) -> Result<(), PeripheralError> {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        lock_sink(&self.sink).take();

        self.peripheral
            .disconnect()
            .await
            .map_err(|e| PeripheralError::DisconnectFailed(format!("{}: {e}", self.addr)))
    }
}

impl Drop for BleConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Best-effort disconnect after a failed dial
async fn release_peripheral(addr: &str, peripheral: &Peripheral) {
    if let Err(e) = peripheral.disconnect().await {
        warn!(addr = %addr, error = %e, "Failed to release peripheral after dial error");
    }
}

/// Decode notifications until the stream ends or the task is aborted
async fn drive_notifications<S>(
    addr: String,
    format: PayloadFormat,
    characteristic: Uuid,
    mut notifications: S,
    sink: SharedSink,
) where
    S: Stream<Item = ValueNotification> + Unpin + Send,
{
    while let Some(notification) = notifications.next().await {
        if notification.uuid != characteristic {
            continue;
        }

        let reading = match codec::decode(format, &notification.value) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(addr = %addr, error = %e, "Discarding malformed notification");
                continue;
            }
        };

        let delivered = {
            let guard = lock_sink(&sink);
            guard.as_ref().map(|sink| sink.deliver(reading))
        };
        if delivered.is_none() {
            trace!(addr = %addr, reading = %reading, "No handler registered, discarding");
        }
    }
    warn!(addr = %addr, "Notification stream ended");
}
