//! Fixed-capacity response buffer filled by the transport reader.

use serde::Deserialize;

/// Capacity of the modem response buffer in bytes
pub const RESPONSE_BUFFER_SIZE: usize = 256;

/// Which received bytes the reader keeps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteFilter {
    /// Drop NUL and DEL only
    #[default]
    ControlOnly,
    /// Keep printable ASCII plus CR and LF
    PrintableOnly,
}

impl ByteFilter {
    pub fn accepts(self, byte: u8) -> bool {
        match self {
            ByteFilter::ControlOnly => byte != 0 && byte != 0x7F,
            ByteFilter::PrintableOnly => {
                byte == b'\r' || byte == b'\n' || (0x20..0x7F).contains(&byte)
            }
        }
    }
}

/// Bytes received during the last read window.
///
/// Pushes past capacity are dropped and flagged; the valid view is always
/// `0..len`.
#[derive(Clone)]
pub struct ResponseBuffer {
    bytes: [u8; RESPONSE_BUFFER_SIZE],
    len: usize,
    overflowed: bool,
}

impl ResponseBuffer {
    pub const fn new() -> Self {
        Self {
            bytes: [0; RESPONSE_BUFFER_SIZE],
            len: 0,
            overflowed: false,
        }
    }

    pub fn clear(&mut self) {
        self.bytes = [0; RESPONSE_BUFFER_SIZE];
        self.len = 0;
        self.overflowed = false;
    }

    /// Append one byte; returns `false` and marks overflow when full
    pub fn push(&mut self, byte: u8) -> bool {
        if self.len == RESPONSE_BUFFER_SIZE {
            self.overflowed = true;
            return false;
        }
        self.bytes[self.len] = byte;
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Longest UTF-8 prefix of the received bytes
    pub fn text(&self) -> &str {
        let bytes = self.as_bytes();
        match std::str::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => std::str::from_utf8(&bytes[..e.valid_up_to()]).unwrap_or_default(),
        }
    }

    /// Substring test over the raw bytes; an empty pattern always matches
    pub fn contains(&self, pattern: &str) -> bool {
        let needle = pattern.as_bytes();
        if needle.is_empty() {
            return true;
        }
        self.as_bytes().windows(needle.len()).any(|w| w == needle)
    }

    pub fn contains_any(&self, patterns: &[&str]) -> bool {
        patterns.iter().any(|p| self.contains(p))
    }

    /// True when the modem answered with a generic or extended error
    pub fn is_error(&self) -> bool {
        self.contains("ERROR")
    }
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBuffer")
            .field("text", &self.text())
            .field("overflowed", &self.overflowed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(text: &str) -> ResponseBuffer {
        let mut buf = ResponseBuffer::new();
        for b in text.bytes() {
            buf.push(b);
        }
        buf
    }

    #[test]
    fn test_contains_and_error() {
        let buf = filled("\r\n+CME ERROR: 10\r\n");
        assert!(buf.contains("+CME"));
        assert!(buf.is_error());
        assert!(!buf.contains("OK"));
        assert!(buf.contains(""));
    }

    #[test]
    fn test_overflow_is_bounded() {
        let mut buf = ResponseBuffer::new();
        for _ in 0..RESPONSE_BUFFER_SIZE {
            assert!(buf.push(b'A'));
        }
        assert!(!buf.push(b'B'));
        assert!(buf.overflowed());
        assert_eq!(buf.len(), RESPONSE_BUFFER_SIZE);
        assert!(!buf.contains("B"));
    }

    #[test]
    fn test_clear_resets_state() {
        let mut buf = filled("OK");
        buf.clear();
        assert!(buf.is_empty());
        assert!(!buf.overflowed());
        assert_eq!(buf.text(), "");
    }

    #[test]
    fn test_text_stops_at_invalid_utf8() {
        let mut buf = filled("OK");
        buf.push(0xC3);
        assert_eq!(buf.text(), "OK");
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_filters() {
        assert!(!ByteFilter::ControlOnly.accepts(0));
        assert!(!ByteFilter::ControlOnly.accepts(0x7F));
        assert!(ByteFilter::ControlOnly.accepts(0x1B));
        assert!(!ByteFilter::PrintableOnly.accepts(0x1B));
        assert!(ByteFilter::PrintableOnly.accepts(b'\n'));
        assert!(ByteFilter::PrintableOnly.accepts(b'>'));
        assert!(!ByteFilter::PrintableOnly.accepts(0xC3));
    }
}
