//! Bridging peripherals to the broker

pub mod lifecycle;
pub mod registry;

pub use lifecycle::{termination_signal, BridgeLifecycle, ShutdownReport, StartupReport};
pub use registry::{
    ConnectResult, DeviceRegistry, DeviceState, DisconnectResult, ReadingHandler, RegistryError,
};
