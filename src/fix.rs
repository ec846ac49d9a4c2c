//! GNSS position fix as handed over by the positioning collaborator.

use std::fmt;

/// Capacity of a preformatted timestamp
pub const TIMESTAMP_CAPACITY: usize = 32;

pub type Timestamp = heapless::String<TIMESTAMP_CAPACITY>;

/// One position report.
///
/// `timestamp` is already URL-safe (`YYYY-MM-DD%20HH:MM:SS`) and never
/// contains the record separators `,` or `\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: Timestamp,
}

/// Why a fix was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixError {
    NonFinite,
    OutOfRange,
    TimestampTooLong,
    TimestampSeparator,
}

impl fmt::Display for FixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FixError::NonFinite => "coordinate is not a finite number",
            FixError::OutOfRange => "coordinate outside WGS84 range",
            FixError::TimestampTooLong => "timestamp too long",
            FixError::TimestampSeparator => "timestamp contains ',' or newline",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for FixError {}

impl Fix {
    pub fn new(latitude: f64, longitude: f64, timestamp: &str) -> Result<Self, FixError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(FixError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(FixError::OutOfRange);
        }
        if timestamp.contains([',', '\n', '\r']) {
            return Err(FixError::TimestampSeparator);
        }
        let timestamp = Timestamp::try_from(timestamp).map_err(|_| FixError::TimestampTooLong)?;
        Ok(Self {
            latitude,
            longitude,
            timestamp,
        })
    }

    /// Fix stamped with the given UTC time in report format
    pub fn at(latitude: f64, longitude: f64, time: chrono::DateTime<chrono::Utc>) -> Result<Self, FixError> {
        let stamp = time.format("%Y-%m-%d%%20%H:%M:%S").to_string();
        Self::new(latitude, longitude, &stamp)
    }
}
