//! Decoded sensor samples

use std::fmt;

/// One temperature/humidity sample produced by a peripheral driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Relative humidity in percent
    pub humidity: f64,
}

impl Reading {
    pub fn new(temperature: f64, humidity: f64) -> Self {
        Self {
            temperature,
            humidity,
        }
    }

    /// Both values are finite numbers
    pub fn is_finite(&self) -> bool {
        self.temperature.is_finite() && self.humidity.is_finite()
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Temperature: {:.2}°C, Humidity: {:.2}%",
            self.temperature, self.humidity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_display() {
        let reading = Reading::new(21.5, 40.25);
        assert_eq!(reading.to_string(), "Temperature: 21.50°C, Humidity: 40.25%");
    }

    #[test]
    fn test_reading_display_negative_temperature() {
        let reading = Reading::new(-3.456, 99.0);
        assert_eq!(reading.to_string(), "Temperature: -3.46°C, Humidity: 99.00%");
    }

    #[test]
    fn test_reading_is_finite() {
        assert!(Reading::new(0.0, 0.0).is_finite());
        assert!(!Reading::new(f64::NAN, 10.0).is_finite());
        assert!(!Reading::new(10.0, f64::INFINITY).is_finite());
    }
}
