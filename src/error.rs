//! # Error Types
//!
//! Custom error types for Trackteur using `thiserror`.

use thiserror::Error;

/// Main error type for Trackteur
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Serial link errors
    #[error("Serial error: {0}")]
    Serial(String),

    /// No serial device could be opened
    #[error("No modem serial device found (tried: {0})")]
    SerialPortNotFound(String),

    /// Block storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Trackteur
pub type Result<T> = std::result::Result<T, TrackerError>;
