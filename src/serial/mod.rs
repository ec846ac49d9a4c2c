//! # Serial Communication Module
//!
//! Handles the serial link to the cellular modem.
//!
//! This module handles:
//! - Opening the modem port (8N1, no flow control)
//! - Non-blocking reads of whatever the modem has sent
//! - Writing AT command lines and raw TCP payloads

pub mod port_trait;

pub use port_trait::SerialLink;

use crate::error::{Result, TrackerError};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default modem baud rate (SIM7000 / A7670 factory setting)
pub const MODEM_BAUD_RATE: u32 = 9600;

/// Read timeout applied to the OS port; reads never wait on it since only
/// already-buffered bytes are requested
const PORT_TIMEOUT_MS: u64 = 10;

/// Modem Serial Port Handler
///
/// Owns the OS serial device connected to the modem's UART.
pub struct ModemSerial {
    /// Serial port handle
    port: Box<dyn tokio_serial::SerialPort>,
    /// Device path (e.g., /dev/ttyUSB0)
    device_path: String,
}

impl std::fmt::Debug for ModemSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModemSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl ModemSerial {
    /// Open the first usable device among `paths`
    ///
    /// # Arguments
    ///
    /// * `paths` - Device paths to try (e.g., &["/dev/ttyUSB0"])
    /// * `baud_rate` - Line speed
    ///
    /// # Errors
    ///
    /// Returns [`TrackerError::SerialPortNotFound`] listing every path tried
    /// when none can be opened.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use trackteur::serial::{ModemSerial, MODEM_BAUD_RATE};
    ///
    /// let serial = ModemSerial::open_with_paths(&["/dev/ttyUSB0"], MODEM_BAUD_RATE)?;
    /// println!("Connected to: {}", serial.device_path());
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened modem serial port {} at {} baud", path, baud_rate);
                    return Ok(Self {
                        port,
                        device_path: path.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(TrackerError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port with modem UART settings
    fn open_port(path: &str, baud_rate: u32) -> Result<Box<dyn tokio_serial::SerialPort>> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(Duration::from_millis(PORT_TIMEOUT_MS))
            .open()
            .map_err(|e| TrackerError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Get the device path of the opened serial port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

impl SerialLink for ModemSerial {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pending = self.port.bytes_to_read().map_err(io::Error::from)? as usize;
        if pending == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = pending.min(buf.len());
        match self.port.read(&mut buf[..want]) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }
}
