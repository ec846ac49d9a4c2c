//! Single TCP socket on top of the active data context.
//!
//! One socket exists at a time; open, send and close use the command set of
//! the resolved [`Dialect`](super::Dialect).

use super::{format_line, Modem, PATTERN_SLICE_MS};
use crate::board::{Clock, PowerKey, Watchdog};
use crate::serial::SerialLink;
use tracing::{debug, info, warn};

/// Time allowed for the `>` prompt after a send command
const PROMPT_TIMEOUT_MS: u64 = 8000;
/// Time allowed for the send confirmation
const SEND_CONFIRM_MS: u64 = 10_000;
/// First read after a SIM7000-style open
const TENTATIVE_READ_MS: u64 = 2000;
/// Settle time after a close before the next open
const CLOSE_SETTLE_MS: u64 = 2000;

impl<S, C, W, P> Modem<S, C, W, P>
where
    S: SerialLink,
    C: Clock,
    W: Watchdog,
    P: PowerKey,
{
    /// Open a TCP connection to `host:port`
    pub fn tcp_open(&mut self, host: &str, port: u16) -> bool {
        let dialect = self.dialect();
        let Some(command) = format_line(format_args!(
            "{}\"{}\",{}",
            dialect.tcp_open_prefix, host, port
        )) else {
            warn!("TCP open command for {}:{} too long", host, port);
            return false;
        };

        info!("Opening TCP connection to {}:{}", host, port);
        self.clear_input();
        if !self.write_line(&command) {
            return false;
        }

        let connected = if dialect.tcp_open_tentative_ok {
            self.pause(500);
            self.read_response(TENTATIVE_READ_MS);
            if self.buffer.contains(dialect.tcp_open_ok) {
                true
            } else if self.buffer.is_error() {
                false
            } else if self.buffer.contains("OK") && !self.buffer.contains("CONNECT") {
                // Command accepted, connect still pending
                self.wait_for_pattern(dialect.tcp_open_ok, dialect.tcp_open_timeout_ms, PATTERN_SLICE_MS)
            } else {
                false
            }
        } else {
            self.wait_for_pattern(dialect.tcp_open_ok, dialect.tcp_open_timeout_ms, PATTERN_SLICE_MS)
        };

        if connected {
            info!("TCP connected");
        } else {
            warn!("TCP open failed: {:?}", self.buffer.text());
        }
        connected
    }

    /// Send `payload` over the open socket
    pub fn tcp_send(&mut self, payload: &[u8]) -> bool {
        let dialect = self.dialect();
        let Some(command) = format_line(format_args!("{}{}", dialect.tcp_send_prefix, payload.len()))
        else {
            return false;
        };

        self.clear_input();
        if !self.write_line(&command) {
            return false;
        }
        if !self.wait_for_pattern(dialect.send_prompt, PROMPT_TIMEOUT_MS, PATTERN_SLICE_MS) {
            warn!("No send prompt from modem");
            return false;
        }

        debug!("Sending {} bytes", payload.len());
        if !self.write_raw(payload) {
            return false;
        }
        let sent = self.wait_for_any(&dialect.send_ok, SEND_CONFIRM_MS, PATTERN_SLICE_MS);
        if !sent {
            warn!("Send not confirmed");
        }
        sent
    }

    /// Close the socket, forcing it down when the graceful close is not
    /// confirmed. Always waits for the modem to settle.
    pub fn tcp_close(&mut self) -> bool {
        let dialect = self.dialect();
        self.clear_input();
        let mut closed = self.send_command(dialect.tcp_close, dialect.tcp_close_ok, 3000, 1);
        if !closed {
            if let Some(step) = dialect.force_close {
                debug!("Graceful close unconfirmed, forcing {}", step.command);
                closed = self.send_command_any(step.command, step.expect, step.timeout_ms, step.retries);
            }
        }
        if !closed {
            warn!("TCP close not confirmed");
        }
        self.pause(CLOSE_SETTLE_MS);
        closed
    }
}

#[cfg(test)]
mod tests {
    use crate::board::Clock;
    use crate::modem::mocks::*;
    use crate::modem::ModemVariant;

    const HOST: &str = "tracker.example.net";

    #[test]
    fn test_open_formats_family_command() {
        let cases = [
            (ModemVariant::Sim7000, "AT+CIPSTART=\"TCP\",\"tracker.example.net\",80", "CONNECT OK"),
            (ModemVariant::A7670, "AT+CIPOPEN=0,\"TCP\",\"tracker.example.net\",80", "+CIPOPEN: 0,0"),
            (ModemVariant::Sim7070, "AT+CAOPEN=0,0,\"TCP\",\"tracker.example.net\",80", "+CAOPEN: 0,0"),
        ];
        for (variant, command, ok) in cases {
            let (mut modem, rig) = resolved_modem(variant);
            rig.script.respond_chunks("AT+C", &[(100, "\r\nOK\r\n"), (300, ok)]);
            assert!(modem.tcp_open(HOST, 80), "{:?}", variant);
            assert_eq!(rig.script.count(command), 1, "{:?}", variant);
        }
    }

    #[test]
    fn test_open_rejects_other_family_confirmation() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        rig.script.respond("AT+CIPOPEN", "\r\nOK\r\n\r\nCONNECT OK\r\n");
        assert!(!modem.tcp_open(HOST, 80));

        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7070);
        rig.script.respond("AT+CAOPEN", "\r\n+CIPOPEN: 0,0\r\n");
        assert!(!modem.tcp_open(HOST, 80));
    }

    #[test]
    fn test_open_error_fails_fast() {
        for variant in [ModemVariant::Sim7000, ModemVariant::A7670, ModemVariant::Sim7070] {
            let (mut modem, rig) = resolved_modem(variant);
            rig.script.respond("AT+C", "\r\nERROR\r\n");
            let start = rig.clock.now_ms();
            assert!(!modem.tcp_open(HOST, 80));
            assert!(rig.clock.now_ms() - start < 5000);
        }
    }

    #[test]
    fn test_sim7000_immediate_connect() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script.respond("AT+CIPSTART", "\r\nOK\r\n\r\nCONNECT OK\r\n");
        assert!(modem.tcp_open(HOST, 80));
    }

    #[test]
    fn test_sim7000_tentative_ok_then_connect() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script
            .respond_chunks("AT+CIPSTART", &[(0, "\r\nOK\r\n"), (6000, "\r\nCONNECT OK\r\n")]);
        assert!(modem.tcp_open(HOST, 80));
    }

    #[test]
    fn test_sim7000_connect_fail_reply() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script.respond("AT+CIPSTART", "\r\nOK\r\n\r\nCONNECT FAIL\r\n");
        assert!(!modem.tcp_open(HOST, 80));
    }

    #[test]
    fn test_send_waits_for_prompt_then_confirmation() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script.respond("AT+CIPSEND=5", "\r\n> ");
        assert!(!modem.tcp_send(b"hello"));

        // Payload carries no terminator, so confirm it as unsolicited output
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script
            .respond_chunks("AT+CIPSEND=5", &[(0, "\r\n> "), (900, "\r\nSEND OK\r\n")]);
        assert!(modem.tcp_send(b"hello"));
        assert!(rig.script.written().ends_with(b"hello"));
    }

    #[test]
    fn test_send_without_prompt_fails() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        rig.script.respond("AT+CIPSEND=0,3", "\r\nERROR\r\n");
        assert!(!modem.tcp_send(b"abc"));
        assert!(!rig.script.written().ends_with(b"abc"));
    }

    #[test]
    fn test_sim7070_send_accepts_casend_report() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7070);
        rig.script
            .respond_chunks("AT+CASEND=0,2", &[(0, "\r\n>"), (700, "\r\n+CASEND: 0,0,2\r\n")]);
        assert!(modem.tcp_send(b"hi"));
    }

    #[test]
    fn test_close_falls_back_to_force() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script.respond("AT+CIPCLOSE", "\r\nERROR\r\n");
        rig.script.respond("AT+CIPSHUT", "\r\nSHUT OK\r\n");
        assert!(modem.tcp_close());
        assert_eq!(rig.script.count("AT+CIPSHUT"), 1);
    }

    #[test]
    fn test_close_a7670_has_no_fallback() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        let start = rig.clock.now_ms();
        assert!(!modem.tcp_close());
        assert_eq!(rig.script.count("AT+CIPCLOSE=0"), 1);
        assert!(rig.clock.now_ms() - start >= 2000);
    }

    #[test]
    fn test_close_ignores_stale_reply_bytes() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7070);
        rig.script.inject(0, "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nOK\r\n");
        rig.script.respond("AT+CACLOSE=0", "\r\nERROR\r\n");
        assert!(!modem.tcp_close());
        // Graceful close plus both forced attempts
        assert_eq!(rig.script.count("AT+CACLOSE=0"), 3);
    }

    #[test]
    fn test_sim7000_bare_ok_without_connect_times_out() {
        let (mut modem, rig) = resolved_modem(ModemVariant::Sim7000);
        rig.script.respond("AT+CIPSTART", "\r\nOK\r\n");
        let start = rig.clock.now_ms();
        assert!(!modem.tcp_open(HOST, 80));
        let elapsed = rig.clock.now_ms() - start;
        assert!(elapsed >= 500 + 2000 + 10_000, "gave up after {} ms", elapsed);
    }

    #[test]
    fn test_close_graceful() {
        let (mut modem, rig) = resolved_modem(ModemVariant::A7670);
        rig.script.respond("AT+CIPCLOSE=0", "\r\nOK\r\n\r\n+CIPCLOSE: 0,0\r\n");
        assert!(modem.tcp_close());
    }
}
