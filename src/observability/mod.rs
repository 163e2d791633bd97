//! Observability for the bridge: structured logging and counters

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{BridgeMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{device_span, lifecycle_span, mqtt_span};
