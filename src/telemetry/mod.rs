//! # Telemetry Module
//!
//! Sends OsmAnd-style position reports over a one-shot TCP session.
//!
//! This module handles:
//! - Formatting the fixed-shape HTTP GET request
//! - Opening, sending and always closing the TCP session
//! - Counting consecutive send failures toward a modem reset
//!
//! ```text
//! GET /?id=<id>&lat=<lat>&lon=<lon>&timestamp=<ts> HTTP/1.1\r\n
//! Host: <host>\r\n
//! [Connection: close\r\n]
//! \r\n
//! ```

use crate::board::{Clock, PowerKey, Watchdog};
use crate::fix::Fix;
use crate::modem::{Modem, PATTERN_SLICE_MS};
use crate::serial::SerialLink;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::fmt::Write as _;
use tracing::{debug, info, warn};

/// Capacity of one formatted request
pub const REQUEST_CAPACITY: usize = 256;

pub type Request = heapless::String<REQUEST_CAPACITY>;

const HTTP_STATUS: &str = "HTTP/1.";

/// Characters left unescaped in the device id (RFC 3986 unreserved)
const DEVICE_ID: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Where and how reports are delivered
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    /// Add `Connection: close`
    pub connection_close: bool,
    /// Wait briefly for an HTTP status line after sending
    pub await_response: bool,
    pub response_timeout_ms: u64,
}

/// Build the GET request for `fix`; `None` when it would not fit
pub fn build_request(endpoint: &ServerEndpoint, fix: &Fix) -> Option<Request> {
    let mut req = Request::new();
    write!(
        req,
        "GET /?id={}&lat={:.6}&lon={:.6}&timestamp={} HTTP/1.1\r\nHost: {}\r\n",
        utf8_percent_encode(&endpoint.device_id, DEVICE_ID),
        fix.latitude,
        fix.longitude,
        fix.timestamp,
        endpoint.host
    )
    .ok()?;
    if endpoint.connection_close {
        req.push_str("Connection: close\r\n").ok()?;
    }
    req.push_str("\r\n").ok()?;
    Some(req)
}

impl<S, C, W, P> Modem<S, C, W, P>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
{
    /// Deliver one report.
    ///
    /// True only when both the open and the send succeeded; the optional
    /// response wait never changes the result.
    pub fn send_report(&mut self, endpoint: &ServerEndpoint, fix: &Fix) -> bool {
        let Some(request) = build_request(endpoint, fix) else {
            warn!("Report request does not fit in {} bytes", REQUEST_CAPACITY);
            return false;
        };

        if !self.tcp_open(&endpoint.host, endpoint.port) {
            return false;
        }

        let sent = self.tcp_send(request.as_bytes());
        if sent && endpoint.await_response {
            // The status line may share the read slice of the send confirmation
            let replied = self.response().contains(HTTP_STATUS)
                || self.wait_for_pattern(HTTP_STATUS, endpoint.response_timeout_ms, PATTERN_SLICE_MS);
            if replied {
                debug!("Server replied: {:?}", self.response().text());
            } else {
                debug!("No HTTP status line from server");
            }
        }

        self.tcp_close();
        if sent {
            info!("Report sent ({:.6}, {:.6})", fix.latitude, fix.longitude);
        }
        sent
    }
}

/// Report delivery seen from the store-and-forward log
#[cfg_attr(test, mockall::automock)]
pub trait Uplink {
    fn send_report(&mut self, fix: &Fix) -> bool;

    /// Destructive recovery after too many consecutive failures
    fn force_recovery(&mut self);
}

/// [`Uplink`] over a live modem
pub struct TelemetryLink<'a, S, C, W, P> {
    modem: &'a mut Modem<S, C, W, P>,
    endpoint: &'a ServerEndpoint,
}

impl<'a, S, C, W, P> TelemetryLink<'a, S, C, W, P> {
    pub fn new(modem: &'a mut Modem<S, C, W, P>, endpoint: &'a ServerEndpoint) -> Self {
        Self { modem, endpoint }
    }
}

impl<S, C, W, P> Uplink for TelemetryLink<'_, S, C, W, P>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
{
    fn send_report(&mut self, fix: &Fix) -> bool {
        self.modem.send_report(self.endpoint, fix)
    }

    fn force_recovery(&mut self) {
        self.modem.power_cycle();
    }
}

/// Consecutive send failures
#[derive(Debug, Clone)]
pub struct NetFailCounter {
    threshold: u32,
    count: u32,
}

impl NetFailCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Count a failure; true exactly when the threshold is reached, which
    /// also resets the counter
    pub fn record_failure(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.threshold {
            warn!("{} consecutive send failures", self.count);
            self.count = 0;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}
