//! # Modem Protocol Engine
//!
//! Drives a SIMCom-style cellular modem over AT commands.
//!
//! This module handles:
//! - Reading replies into a bounded [`ResponseBuffer`] (transport reader)
//! - Sending commands with bounded retries (command dispatcher)
//! - Power sequencing and hard resets through the power key
//! - Model detection and per-model command tables ([`dialect`])
//! - Network bring-up ([`network`]) and the TCP session layer ([`tcp`])
//!
//! Every wait blocks the caller for its full window and feeds the
//! watchdog at least every [`MAX_SLEEP_SLICE_MS`].

pub mod dialect;
pub mod network;
pub mod response;
pub mod tcp;

pub use dialect::{Dialect, ModemVariant};
pub use response::{ByteFilter, ResponseBuffer};

use crate::board::{Clock, PowerKey, Watchdog, MAX_SLEEP_SLICE_MS};
use crate::serial::SerialLink;
use std::fmt::{self, Write as _};
use tracing::{debug, info, trace, warn};

/// Capacity of a single formatted command line
pub const COMMAND_CAPACITY: usize = 160;

/// Formatted AT command line
pub type CommandLine = heapless::String<COMMAND_CAPACITY>;

/// Idle sleep between serial polls inside a read window
const READ_POLL_MS: u64 = 5;

/// Fixed backoff between command retries
pub const RETRY_BACKOFF_MS: u64 = 500;

/// Read slice used by pattern waits
pub const PATTERN_SLICE_MS: u64 = 200;

/// How the last reply relates to what the caller expected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Matched,
    /// Explicit `ERROR` / `+CME ERROR` reply
    Error,
    /// Nothing, or something unrelated
    Silent,
}

/// Format a command line into a fixed-capacity buffer.
///
/// Returns `None` when the result would not fit.
pub fn format_line(args: fmt::Arguments<'_>) -> Option<CommandLine> {
    let mut line = CommandLine::new();
    line.write_fmt(args).ok()?;
    Some(line)
}

/// Session with one modem: link, timing, power key, reply buffer and the
/// model resolved at power-up.
pub struct Modem<S, C, W, P> {
    serial: S,
    clock: C,
    watchdog: W,
    power: P,
    buffer: ResponseBuffer,
    filter: ByteFilter,
    variant: ModemVariant,
    resolved: bool,
}

impl<S, C, W, P> fmt::Debug for Modem<S, C, W, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Modem")
            .field("variant", &self.variant)
            .field("resolved", &self.resolved)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl<S, C, W, P> Modem<S, C, W, P>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
{
    pub fn new(serial: S, clock: C, watchdog: W, power: P) -> Self {
        Self {
            serial,
            clock,
            watchdog,
            power,
            buffer: ResponseBuffer::new(),
            filter: ByteFilter::default(),
            variant: ModemVariant::default(),
            resolved: false,
        }
    }

    /// Select which reply bytes the reader keeps
    pub fn with_filter(mut self, filter: ByteFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn variant(&self) -> ModemVariant {
        self.variant
    }

    pub fn dialect(&self) -> &'static Dialect {
        self.variant.dialect()
    }

    /// Reply received during the last read window
    pub fn response(&self) -> &ResponseBuffer {
        &self.buffer
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Sleep `ms`, feeding the watchdog between slices
    pub fn pause(&mut self, ms: u64) {
        let mut left = ms;
        while left > 0 {
            self.watchdog.feed();
            let step = left.min(MAX_SLEEP_SLICE_MS);
            self.clock.delay_ms(step);
            left -= step;
        }
        self.watchdog.feed();
    }

    /// Discard every byte already waiting on the link and empty the buffer
    pub fn clear_input(&mut self) {
        let mut scratch = [0u8; 64];
        loop {
            self.watchdog.feed();
            match self.serial.read_available(&mut scratch) {
                Ok(0) => break,
                Ok(n) => trace!("Discarded {} stale bytes", n),
                Err(e) => {
                    warn!("Serial read failed while clearing input: {}", e);
                    break;
                }
            }
        }
        self.buffer.clear();
    }

    /// Write raw bytes (no terminator)
    pub fn write_raw(&mut self, data: &[u8]) -> bool {
        let result = self
            .serial
            .write_all(data)
            .and_then(|_| self.serial.flush());
        if let Err(e) = result {
            warn!("Serial write failed: {}", e);
            return false;
        }
        true
    }

    /// Write one command followed by CR LF
    pub fn write_line(&mut self, command: &str) -> bool {
        debug!("→ {}", command);
        self.write_raw(command.as_bytes()) && self.write_raw(b"\r\n")
    }

    /// Collect replies for exactly `max_wait_ms`.
    ///
    /// Clears the buffer first, drops filtered bytes and anything past
    /// capacity, and returns the number of bytes kept.
    pub fn read_response(&mut self, max_wait_ms: u64) -> usize {
        self.buffer.clear();
        let start = self.clock.now_ms();
        let mut chunk = [0u8; 64];
        let mut overflow_reported = false;

        while self.clock.now_ms().saturating_sub(start) < max_wait_ms {
            self.watchdog.feed();
            let n = match self.serial.read_available(&mut chunk) {
                Ok(n) => n,
                Err(e) => {
                    warn!("Serial read failed: {}", e);
                    0
                }
            };
            for &byte in &chunk[..n] {
                if self.filter.accepts(byte) && !self.buffer.push(byte) && !overflow_reported {
                    warn!("Response buffer overflow, discarding input until window ends");
                    overflow_reported = true;
                }
            }
            if n == 0 {
                self.clock.delay_ms(READ_POLL_MS);
            }
        }

        if !self.buffer.is_empty() {
            debug!("← {:?}", self.buffer.text());
        }
        self.buffer.len()
    }

    /// Classify the current buffer against the expected patterns
    pub fn reply_status(&self, expected: &[&str]) -> ReplyStatus {
        if self.buffer.contains_any(expected) {
            ReplyStatus::Matched
        } else if self.buffer.is_error() {
            ReplyStatus::Error
        } else {
            ReplyStatus::Silent
        }
    }

    /// Send `command` up to `retries` times until the reply contains
    /// `expected`.
    pub fn send_command(&mut self, command: &str, expected: &str, timeout_ms: u64, retries: u8) -> bool {
        self.send_command_any(command, &[expected], timeout_ms, retries)
    }

    /// Like [`Modem::send_command`], accepting any of several patterns
    pub fn send_command_any(
        &mut self,
        command: &str,
        expected: &[&str],
        timeout_ms: u64,
        retries: u8,
    ) -> bool {
        for attempt in 1..=retries {
            self.watchdog.feed();
            debug!("Send [{}/{}]: {}", attempt, retries, command);
            if self.write_line(command) {
                self.read_response(timeout_ms);
                match self.reply_status(expected) {
                    ReplyStatus::Matched => return true,
                    ReplyStatus::Error => debug!("ERROR reply to {}", command),
                    ReplyStatus::Silent => debug!("No or unexpected reply to {}", command),
                }
            }
            if attempt < retries {
                self.pause(RETRY_BACKOFF_MS);
            }
        }
        debug!("{} failed after {} attempts", command, retries);
        false
    }

    /// Poll in `slice_ms` windows until `pattern` shows up, an error reply
    /// arrives, or `total_ms` elapses
    pub fn wait_for_pattern(&mut self, pattern: &str, total_ms: u64, slice_ms: u64) -> bool {
        self.wait_for_any(&[pattern], total_ms, slice_ms)
    }

    pub fn wait_for_any(&mut self, patterns: &[&str], total_ms: u64, slice_ms: u64) -> bool {
        let start = self.clock.now_ms();
        while self.clock.now_ms().saturating_sub(start) < total_ms {
            self.read_response(slice_ms);
            match self.reply_status(patterns) {
                ReplyStatus::Matched => return true,
                ReplyStatus::Error => {
                    debug!("Error reply while waiting for {:?}", patterns);
                    return false;
                }
                ReplyStatus::Silent => {}
            }
        }
        debug!("Timeout waiting for {:?}", patterns);
        false
    }

    /// Probe with plain `AT` until the modem answers `OK`
    pub fn handshake(&mut self, max_tries: u8) -> bool {
        for attempt in 1..=max_tries {
            self.write_line("AT");
            self.read_response(1000);
            if self.buffer.contains("OK") {
                debug!("Handshake OK on try {}", attempt);
                return true;
            }
            self.pause(RETRY_BACKOFF_MS);
        }
        false
    }

    /// Power-key start sequence followed by model detection
    pub fn power_on(&mut self) -> ModemVariant {
        info!("Turning modem on");
        self.power.set_high(false);
        self.pause(1200);
        self.power.set_high(true);
        self.pause(300);
        self.power.set_high(false);
        self.pause(5000);
        self.resolve_variant()
    }

    /// Destructive recovery: cut power, restore it, and re-establish the
    /// command channel. The resolved model is kept.
    pub fn power_cycle(&mut self) -> bool {
        warn!("Power-cycling modem");
        self.power.set_high(false);
        self.pause(2000);
        self.clear_input();
        self.power.set_high(true);
        self.pause(5000);

        if !self.handshake(10) {
            warn!("Modem still unresponsive after power cycle");
            return false;
        }
        self.send_command("ATE0", "OK", 1000, 2);
        self.send_command("AT+CMEE=2", "OK", 1000, 2);
        info!("Modem back online after power cycle");
        true
    }
}


#[cfg(test)]
mod tests {
    use super::mocks::*;
    use super::*;

    #[test]
    fn test_read_response_consumes_full_window() {
        let (mut modem, rig) = sim_modem();
        rig.script.inject(0, "OK\r\n");
        let start = rig.clock.now_ms();
        let n = modem.read_response(1000);
        assert_eq!(n, 4);
        assert!(rig.clock.now_ms() - start >= 1000);
        assert!(modem.response().contains("OK"));
    }

    #[test]
    fn test_read_response_filters_nul_and_del() {
        let (mut modem, rig) = sim_modem();
        rig.script.inject(0, "O\u{0}K\u{7f}");
        modem.read_response(50);
        assert_eq!(modem.response().text(), "OK");
    }

    #[test]
    fn test_printable_filter_drops_escape_bytes() {
        let (modem, rig) = sim_modem();
        let mut modem = modem.with_filter(ByteFilter::PrintableOnly);
        rig.script.inject(0, "\u{1b}[0mOK\r\n");
        modem.read_response(50);
        assert_eq!(modem.response().text(), "[0mOK\r\n");
    }

    #[test]
    fn test_read_response_overflow_keeps_bounds() {
        let (mut modem, rig) = sim_modem();
        let flood = "X".repeat(response::RESPONSE_BUFFER_SIZE + 100);
        rig.script.inject(0, &flood);
        rig.script.inject(10, "OK");
        let n = modem.read_response(100);
        assert_eq!(n, response::RESPONSE_BUFFER_SIZE);
        assert!(modem.response().overflowed());
        assert!(!modem.response().contains("OK"));
    }

    #[test]
    fn test_read_response_clears_previous_reply() {
        let (mut modem, rig) = sim_modem();
        rig.script.inject(0, "STALE");
        modem.read_response(20);
        modem.read_response(20);
        assert!(modem.response().is_empty());
    }

    #[test]
    fn test_send_command_matches_first_try() {
        let (mut modem, rig) = sim_modem();
        rig.script.respond("AT+CSQ", "+CSQ: 20,99\r\nOK\r\n");
        assert!(modem.send_command("AT+CSQ", "+CSQ", 500, 3));
        assert_eq!(rig.script.count("AT+CSQ"), 1);
    }

    #[test]
    fn test_send_command_retries_with_fixed_backoff() {
        let (mut modem, rig) = sim_modem();
        rig.script.respond_seq("AT+CPIN?", &["ERROR\r\n", "", "+CPIN: READY\r\n"]);
        let start = rig.clock.now_ms();
        assert!(modem.send_command("AT+CPIN?", "READY", 1000, 3));
        assert_eq!(rig.script.count("AT+CPIN?"), 3);
        // Three read windows and two backoffs
        assert_eq!(rig.clock.now_ms() - start, 3 * 1000 + 2 * RETRY_BACKOFF_MS);
    }

    #[test]
    fn test_send_command_exhausts_retries() {
        let (mut modem, rig) = sim_modem();
        assert!(!modem.send_command("AT+CIICR", "OK", 200, 2));
        assert_eq!(rig.script.count("AT+CIICR"), 2);
        assert!(!modem.send_command("AT+CIICR", "OK", 200, 0));
        assert_eq!(rig.script.count("AT+CIICR"), 2);
    }

    #[test]
    fn test_reply_status_distinguishes_error() {
        let (mut modem, rig) = sim_modem();
        rig.script.inject(0, "+CME ERROR: SIM not inserted\r\n");
        modem.read_response(20);
        assert_eq!(modem.reply_status(&["READY"]), ReplyStatus::Error);
        modem.read_response(20);
        assert_eq!(modem.reply_status(&["READY"]), ReplyStatus::Silent);
    }

    #[test]
    fn test_wait_for_pattern_stops_on_error() {
        let (mut modem, rig) = sim_modem();
        rig.script.inject(300, "ERROR\r\n");
        rig.script.inject(600, "CONNECT OK\r\n");
        let start = rig.clock.now_ms();
        assert!(!modem.wait_for_pattern("CONNECT OK", 10_000, PATTERN_SLICE_MS));
        assert!(rig.clock.now_ms() - start < 1000);
    }

    #[test]
    fn test_wait_for_any_accepts_second_pattern() {
        let (mut modem, rig) = sim_modem();
        rig.script.inject(450, "+CIPSEND: 0,10,10\r\n");
        assert!(modem.wait_for_any(&["SEND OK", "+CIPSEND:"], 5000, PATTERN_SLICE_MS));
    }

    #[test]
    fn test_handshake_gives_up() {
        let (mut modem, rig) = sim_modem();
        assert!(!modem.handshake(3));
        assert_eq!(rig.script.count("AT"), 3);
        rig.script.respond("AT", "OK\r\n");
        assert!(modem.handshake(3));
    }

    #[test]
    fn test_pause_feeds_watchdog() {
        let (mut modem, rig) = sim_modem();
        modem.pause(5000);
        assert!(rig.watchdog.max_gap_ms() <= MAX_SLEEP_SLICE_MS);
        assert_eq!(rig.clock.now_ms(), 5000);
    }

    #[test]
    fn test_power_on_sequence_and_resolution() {
        let (mut modem, rig) = sim_modem();
        rig.script.respond("AT+CGMM", "A7670E-LASE\r\nOK\r\n");
        assert_eq!(modem.power_on(), ModemVariant::A7670);
        assert_eq!(rig.power.levels(), vec![false, true, false]);
        assert!(rig.watchdog.max_gap_ms() <= MAX_SLEEP_SLICE_MS);
    }

    #[test]
    fn test_power_cycle_reestablishes_channel() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7070);
        rig.script.respond("AT", "OK\r\n");
        rig.script.inject(0, "garbage before reset");
        assert!(modem.power_cycle());
        assert_eq!(rig.power.levels(), vec![false, true]);
        assert_eq!(rig.script.count("ATE0"), 1);
        assert_eq!(rig.script.count("AT+CMEE=2"), 1);
        assert_eq!(modem.variant(), ModemVariant::Sim7070);
    }

    #[test]
    fn test_format_line_rejects_oversized() {
        let host = "h".repeat(COMMAND_CAPACITY);
        assert!(format_line(format_args!("AT+CIPSTART=\"TCP\",\"{}\",80", host)).is_none());
        let line = format_line(format_args!("AT+CIPSEND={}", 42)).unwrap();
        assert_eq!(line.as_str(), "AT+CIPSEND=42");
    }
}
