//! Trait abstraction for the modem serial link to enable testing

use std::io;

/// Byte-level access to the point-to-point modem link
pub trait SerialLink {
    /// Write all data to the link
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Flush the output buffer
    fn flush(&mut self) -> io::Result<()>;

    /// Copy already-received bytes into `buf` without blocking.
    ///
    /// Returns `Ok(0)` when nothing is pending.
    fn read_available(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}


#[cfg(test)]
mod tests {
    use super::mocks::ScriptedModem;
    use super::*;
    use crate::board::mocks::SimClock;

    #[test]
    fn test_longest_trigger_wins() {
        let clock = SimClock::new();
        let mut modem = ScriptedModem::new(clock.clone());
        modem.respond("AT", "OK\r\n");
        modem.respond("AT+CPIN?", "+CPIN: READY\r\n");

        modem.write_all(b"AT+CPIN?\r\n").unwrap();
        let mut buf = [0u8; 64];
        let n = modem.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"+CPIN: READY\r\n");

        modem.write_all(b"ATE0\r\n").unwrap();
        let n = modem.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK\r\n");
    }

    #[test]
    fn test_delayed_chunk_waits_for_clock() {
        let clock = SimClock::new();
        let mut modem = ScriptedModem::new(clock.clone());
        modem.respond_chunks("AT+X", &[(0, "OK\r\n"), (500, "DONE\r\n")]);
        modem.write_all(b"AT+X\r\n").unwrap();

        let mut buf = [0u8; 64];
        let n = modem.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"OK\r\n");
        assert_eq!(modem.read_available(&mut buf).unwrap(), 0);

        clock.advance(500);
        let n = modem.read_available(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"DONE\r\n");
    }

    #[test]
    fn test_sequence_repeats_last_reply() {
        let clock = SimClock::new();
        let mut modem = ScriptedModem::new(clock);
        modem.respond_seq("AT+CPIN?", &["ERROR\r\n", "+CPIN: READY\r\n"]);
        let mut buf = [0u8; 64];
        for expected in ["ERROR\r\n", "+CPIN: READY\r\n", "+CPIN: READY\r\n"] {
            modem.write_all(b"AT+CPIN?\r\n").unwrap();
            let n = modem.read_available(&mut buf).unwrap();
            assert_eq!(&buf[..n], expected.as_bytes());
        }
        assert_eq!(modem.count("AT+CPIN?"), 3);
    }

    #[test]
    fn test_partial_read_keeps_remainder() {
        let clock = SimClock::new();
        let mut modem = ScriptedModem::new(clock);
        modem.inject(0, "ABCDEF");
        let mut buf = [0u8; 4];
        assert_eq!(modem.read_available(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"ABCD");
        assert_eq!(modem.read_available(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"EF");
    }
}
