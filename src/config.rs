//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{Result, TrackerError};
use crate::modem::dialect::RadioProfile;
use crate::modem::ByteFilter;
use crate::telemetry::ServerEndpoint;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub modem: ModemConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub beacon: Option<BeaconConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

/// Operator and radio parameters
#[derive(Debug, Deserialize, Clone)]
pub struct ModemConfig {
    #[serde(default = "default_apn")]
    pub apn: String,

    #[serde(default = "default_cat_m_bands")]
    pub cat_m_bands: String,

    #[serde(default = "default_sim7070_bands")]
    pub sim7070_bands: String,

    #[serde(default = "default_dns_primary")]
    pub dns_primary: String,

    #[serde(default = "default_dns_secondary")]
    pub dns_secondary: String,

    /// Power the integrated GNSS engine once online
    #[serde(default = "default_gnss")]
    pub gnss: bool,

    /// Reply bytes kept by the reader: `control_only` or `printable_only`
    #[serde(default)]
    pub response_filter: ByteFilter,
}

/// Report server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    pub device_id: String,

    #[serde(default = "default_true")]
    pub connection_close: bool,

    #[serde(default = "default_true")]
    pub await_response: bool,

    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Reconnect and failure policy
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    #[serde(default = "default_net_fail_threshold")]
    pub net_fail_threshold: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Persistent log
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_storage_path")]
    pub path: String,

    #[serde(default = "default_max_sectors")]
    pub max_sectors: u32,
}

/// Fixed position reported by the host binary
#[derive(Debug, Deserialize, Clone)]
pub struct BeaconConfig {
    pub latitude: f64,
    pub longitude: f64,
}

/// Optional log file output
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub dir: Option<String>,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 9600 }

fn default_apn() -> String { "onomondo".to_string() }
fn default_cat_m_bands() -> String { "1,2,3,4,5,8,12,13,18,19,20,26,28,39".to_string() }
fn default_sim7070_bands() -> String { "1,2,3,4,5,8,12,13,18,19,20,25,26,28,66,71,85".to_string() }
fn default_dns_primary() -> String { "8.8.8.8".to_string() }
fn default_dns_secondary() -> String { "1.1.1.1".to_string() }
fn default_gnss() -> bool { true }

fn default_server_port() -> u16 { 80 }
fn default_true() -> bool { true }
fn default_response_timeout_ms() -> u64 { 5000 }

fn default_reconnect_interval_ms() -> u64 { 60000 }
fn default_net_fail_threshold() -> u32 { 5 }
fn default_poll_interval_ms() -> u64 { 10000 }

fn default_storage_path() -> String { "GPS_LOG.CSV".to_string() }
fn default_max_sectors() -> u32 { 1000 }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
        }
    }
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            apn: default_apn(),
            cat_m_bands: default_cat_m_bands(),
            sim7070_bands: default_sim7070_bands(),
            dns_primary: default_dns_primary(),
            dns_secondary: default_dns_secondary(),
            gnss: default_gnss(),
            response_filter: ByteFilter::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: default_reconnect_interval_ms(),
            net_fail_threshold: default_net_fail_threshold(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_storage_path(),
            max_sectors: default_max_sectors(),
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> TrackerError {
    TrackerError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trackteur::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if ![9600, 19200, 38400, 57600, 115200].contains(&self.serial.baud_rate) {
            return Err(invalid("baud_rate must be one of: 9600, 19200, 38400, 57600, 115200"));
        }

        if self.modem.apn.is_empty() {
            return Err(invalid("apn cannot be empty"));
        }

        // Band lists are pasted into AT commands verbatim
        for (name, bands) in [
            ("cat_m_bands", &self.modem.cat_m_bands),
            ("sim7070_bands", &self.modem.sim7070_bands),
        ] {
            let valid = !bands.is_empty()
                && bands
                    .split(',')
                    .all(|b| !b.is_empty() && b.bytes().all(|c| c.is_ascii_digit()));
            if !valid {
                return Err(invalid(format!("{} must be a comma-separated list of band numbers", name)));
            }
        }

        for (name, value) in [
            ("apn", &self.modem.apn),
            ("dns_primary", &self.modem.dns_primary),
            ("dns_secondary", &self.modem.dns_secondary),
            ("server host", &self.server.host),
        ] {
            if value.contains('"') || value.contains('\r') || value.contains('\n') {
                return Err(invalid(format!("{} contains a quote or line break", name)));
            }
        }

        if self.server.host.is_empty() {
            return Err(invalid("server host cannot be empty"));
        }

        if self.server.device_id.is_empty() {
            return Err(invalid("device_id cannot be empty"));
        }

        if self.server.port == 0 {
            return Err(invalid("server port must be greater than 0"));
        }

        if self.server.response_timeout_ms > 60000 {
            return Err(invalid("response_timeout_ms must be at most 60000"));
        }

        if self.network.reconnect_interval_ms == 0 {
            return Err(invalid("reconnect_interval_ms must be greater than 0"));
        }

        if self.network.net_fail_threshold == 0 {
            return Err(invalid("net_fail_threshold must be greater than 0"));
        }

        if self.network.poll_interval_ms == 0 || self.network.poll_interval_ms > 3_600_000 {
            return Err(invalid("poll_interval_ms must be between 1 and 3600000"));
        }

        if self.storage.enabled && self.storage.path.is_empty() {
            return Err(invalid("storage path cannot be empty when enabled"));
        }

        if !(1..=1_000_000).contains(&self.storage.max_sectors) {
            return Err(invalid("max_sectors must be between 1 and 1000000"));
        }

        if let Some(beacon) = &self.beacon {
            if !(-90.0..=90.0).contains(&beacon.latitude) || !(-180.0..=180.0).contains(&beacon.longitude) {
                return Err(invalid("beacon position out of range"));
            }
        }

        Ok(())
    }

    pub fn radio_profile(&self) -> RadioProfile {
        RadioProfile {
            apn: self.modem.apn.clone(),
            cat_m_bands: self.modem.cat_m_bands.clone(),
            sim7070_bands: self.modem.sim7070_bands.clone(),
            dns_primary: self.modem.dns_primary.clone(),
            dns_secondary: self.modem.dns_secondary.clone(),
        }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint {
            host: self.server.host.clone(),
            port: self.server.port,
            device_id: self.server.device_id.clone(),
            connection_close: self.server.connection_close,
            await_response: self.server.await_response,
            response_timeout_ms: self.server.response_timeout_ms,
        }
    }
}
