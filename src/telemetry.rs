//! Telemetry line grammar and the persisted sample record.
//!
//! A SmellInspector streams several kinds of `;`-delimited ASCII lines on the
//! same channel. A line is telemetry iff it splits into exactly
//! [`TELEMETRY_FIELD_COUNT`] fields:
//!
//! | field | content |
//! |---|---|
//! | 0 | index/header, ignored |
//! | 1..=64 | channel readings, kept as opaque text |
//! | 65 | temperature |
//! | 66 | humidity |
//!
//! Anything else is not an error, it is simply not a sample.

use chrono::{DateTime, Local};
use serde::Serialize;

/// Number of `;`-delimited fields in a telemetry line.
pub const TELEMETRY_FIELD_COUNT: usize = 67;

/// Number of sensor channel readings per telemetry line.
pub const CHANNEL_COUNT: usize = 64;

/// Field separator used by every device frame.
pub const FIELD_DELIMITER: char = ';';

/// One telemetry line split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    /// Channel readings in device order
    pub channels: Vec<String>,
    /// Temperature field, verbatim
    pub temperature: String,
    /// Humidity field, verbatim
    pub humidity: String,
}

impl TelemetryFrame {
    /// Parse a raw line, returning `None` if it is not a telemetry frame.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split(FIELD_DELIMITER).collect();
        if fields.len() != TELEMETRY_FIELD_COUNT {
            return None;
        }
        Some(Self {
            channels: fields[1..=CHANNEL_COUNT]
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
            temperature: fields[CHANNEL_COUNT + 1].to_string(),
            humidity: fields[CHANNEL_COUNT + 2].to_string(),
        })
    }
}

/// One captured reading, attributed to a test, device and substance.
///
/// Samples are immutable once built; the store only ever appends them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Name of the test the sample belongs to
    #[serde(rename = "test name")]
    pub test_name: String,
    /// Hardware (MAC) address of the capturing device
    #[serde(rename = "mac address")]
    pub hardware_address: String,
    /// Substance in effect at capture time
    #[serde(rename = "substance")]
    pub substance_id: String,
    /// Wall-clock capture time
    #[serde(rename = "captured at")]
    pub captured_at: DateTime<Local>,
    /// The 64 channel readings
    #[serde(rename = "data")]
    pub channels: Vec<String>,
    /// Temperature reading
    pub temperature: String,
    /// Humidity reading
    pub humidity: String,
}

impl Sample {
    /// Attribute a parsed frame to a test.
    pub fn from_frame(
        frame: TelemetryFrame,
        test_name: &str,
        hardware_address: &str,
        substance_id: &str,
        captured_at: DateTime<Local>,
    ) -> Self {
        Self {
            test_name: test_name.to_string(),
            hardware_address: hardware_address.to_string(),
            substance_id: substance_id.to_string(),
            captured_at,
            channels: frame.channels,
            temperature: frame.temperature,
            humidity: frame.humidity,
        }
    }

    /// Channel readings joined back into their wire form.
    pub fn joined_channels(&self) -> String {
        self.channels.join(&FIELD_DELIMITER.to_string())
    }
}
