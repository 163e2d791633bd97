//! Notification payload decoding for supported thermometers

use crate::reading::Reading;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire format of the notify characteristic
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    /// LYWSD03MMC: i16 LE centi-degrees, u8 humidity, optional u16 LE millivolts
    #[default]
    Lywsd03,
    /// MJ_HT_V1: ASCII `T=21.5 H=40.2`, usually NUL-terminated
    MijiaAscii,
}

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("Payload too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("Payload is not ASCII: {0}")]
    NotAscii(String),
    #[error("Missing field '{0}' in payload")]
    MissingField(&'static str),
    #[error("Invalid value for '{field}': {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Decode a raw notification into a [`Reading`]
pub fn decode(format: PayloadFormat, payload: &[u8]) -> Result<Reading, CodecError> {
    let reading = match format {
        PayloadFormat::Lywsd03 => decode_lywsd03(payload)?,
        PayloadFormat::MijiaAscii => decode_mijia_ascii(payload)?,
    };

    if !reading.is_finite() {
        return Err(CodecError::InvalidValue {
            field: "reading",
            value: format!("{reading:?}"),
        });
    }
    Ok(reading)
}

fn decode_lywsd03(payload: &[u8]) -> Result<Reading, CodecError> {
    if payload.len() < 3 {
        return Err(CodecError::TooShort {
            len: payload.len(),
            min: 3,
        });
    }
    let centi = i16::from_le_bytes([payload[0], payload[1]]);
    Ok(Reading::new(f64::from(centi) / 100.0, f64::from(payload[2])))
}

fn decode_mijia_ascii(payload: &[u8]) -> Result<Reading, CodecError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| CodecError::NotAscii(e.to_string()))?
        .trim_end_matches('\0')
        .trim();

    let mut temperature = None;
    let mut humidity = None;
    for token in text.split_whitespace() {
        if let Some(value) = token.strip_prefix("T=") {
            temperature = Some(parse_field("T", value)?);
        } else if let Some(value) = token.strip_prefix("H=") {
            humidity = Some(parse_field("H", value)?);
        }
    }

    Ok(Reading::new(
        temperature.ok_or(CodecError::MissingField("T"))?,
        humidity.ok_or(CodecError::MissingField("H"))?,
    ))
}

fn parse_field(field: &'static str, value: &str) -> Result<f64, CodecError> {
    value.parse().map_err(|_| CodecError::InvalidValue {
        field,
        value: value.to_string(),
    })
}
