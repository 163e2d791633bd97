//! Top-level error taxonomy for the bridge
//!
//! Per-module errors ([`BrokerError`], [`PeripheralError`], [`RegistryError`],
//! [`ConfigError`]) are contained where they happen. [`BridgeError`] is what
//! reports and `main` see.

use crate::bridge::registry::RegistryError;
use crate::config::ConfigError;
use crate::peripheral::PeripheralError;
use crate::transport::BrokerError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker unreachable: {reason}")]
    BrokerUnreachable { reason: String },

    #[error("Broker rejected credentials: {reason}")]
    AuthRejected { reason: String },

    #[error("Device {device} failed to connect: {reason}")]
    DeviceConnectFailed { device: String, reason: String },

    #[error("Device {device} failed to disconnect: {reason}")]
    DeviceDisconnectFailed { device: String, reason: String },

    #[error("Sample from {device} dropped")]
    PublishDropped { device: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Peripheral host initialization failed: {0}")]
    HostInit(String),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl BridgeError {
    /// Fatal errors stop the process before any connection is attempted
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::Config(_) | BridgeError::HostInit(_))
    }

    pub fn device_connect_failed(device: impl Into<String>, error: &PeripheralError) -> Self {
        Self::DeviceConnectFailed {
            device: device.into(),
            reason: error.to_string(),
        }
    }

    /// The peripheral host could not be opened
    pub fn host_init(error: &PeripheralError) -> Self {
        match error {
            PeripheralError::HostInit(reason) => Self::HostInit(reason.clone()),
            other => Self::HostInit(other.to_string()),
        }
    }

    pub fn device_disconnect_failed(device: impl Into<String>, error: &PeripheralError) -> Self {
        Self::DeviceDisconnectFailed {
            device: device.into(),
            reason: error.to_string(),
        }
    }
}

impl From<BrokerError> for BridgeError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::AuthRejected(reason) => BridgeError::AuthRejected { reason },
            other => BridgeError::BrokerUnreachable {
                reason: other.to_string(),
            },
        }
    }
}

/// Result type alias for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
