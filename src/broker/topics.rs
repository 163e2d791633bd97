//! Telemetry topic naming and value formatting
//!
//! Topics follow the Prometheus push-gateway layout consumed downstream:
//! `{namespace}/job/{client_id}/node/{device}/{measurement}`.

use crate::reading::Reading;

/// Measurement leaf of a telemetry topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    Temperature,
    Humidity,
}

impl Measurement {
    pub const ALL: [Measurement; 2] = [Measurement::Temperature, Measurement::Humidity];

    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::Temperature => "temperature",
            Measurement::Humidity => "humidity",
        }
    }

    /// Select this measurement's value from a reading
    pub fn value(&self, reading: &Reading) -> f64 {
        match self {
            Measurement::Temperature => reading.temperature,
            Measurement::Humidity => reading.humidity,
        }
    }
}

/// Builds telemetry topics for one broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBuilder {
    prefix: String,
}

impl TopicBuilder {
    pub fn new(namespace: &str, client_id: &str) -> Self {
        Self {
            prefix: format!("{namespace}/job/{client_id}/node"),
        }
    }

    /// Build a measurement topic: `{namespace}/job/{client_id}/node/{device}/{measurement}`
    pub fn build_measurement_topic(&self, device: &str, measurement: Measurement) -> String {
        format!("{}/{}/{}", self.prefix, device, measurement.as_str())
    }

    /// Topic and payload pairs for one reading, temperature first
    pub fn build_messages(&self, device: &str, reading: &Reading) -> [(String, String); 2] {
        Measurement::ALL.map(|measurement| {
            (
                self.build_measurement_topic(device, measurement),
                format_value(measurement.value(reading)),
            )
        })
    }
}

/// Fixed six-digit fractional rendering expected by existing consumers
pub fn format_value(value: f64) -> String {
    format!("{value:.6}")
}
