//! On-card layout of the metadata sector and of report records.
//!
//! ```text
//! sector 0:   u32 LE next-write index | "LOGDATA" | 0x00 | u32 LE high-water mark
//! sector 1..: marker ('!' pending, '#' sent) | timestamp,lat,lon\n | zeros
//! ```

use super::block::SECTOR_SIZE;
use crate::fix::Fix;
use std::fmt::Write as _;

pub const PENDING_MARKER: u8 = b'!';
pub const SENT_MARKER: u8 = b'#';

pub const METADATA_MAGIC: &[u8; 7] = b"LOGDATA";
/// Header shared with cards that predate the stored high-water mark
const METADATA_HEADER_LEN: usize = 12;
pub const METADATA_LEN: usize = METADATA_HEADER_LEN + 4;

/// Capacity of one formatted record line, marker included
pub const RECORD_CAPACITY: usize = 64;

pub type RecordLine = heapless::String<RECORD_CAPACITY>;

/// State of a record sector, decided by its first byte alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Pending,
    Sent,
    Empty,
}

impl Marker {
    pub fn of(sector: &[u8]) -> Self {
        match sector.first() {
            Some(&PENDING_MARKER) => Marker::Pending,
            Some(&SENT_MARKER) => Marker::Sent,
            _ => Marker::Empty,
        }
    }

    /// Sent or never written: safe to overwrite
    pub fn is_reclaimable(self) -> bool {
        self != Marker::Pending
    }
}

/// Contents of the metadata sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub next_write: u32,
    /// Zero on cards written before the mark was stored
    pub high_water: u32,
}

pub fn encode_metadata(meta: &Metadata) -> [u8; METADATA_LEN] {
    let mut out = [0u8; METADATA_LEN];
    out[..4].copy_from_slice(&meta.next_write.to_le_bytes());
    out[4..11].copy_from_slice(METADATA_MAGIC);
    out[METADATA_HEADER_LEN..].copy_from_slice(&meta.high_water.to_le_bytes());
    out
}

/// `None` when the signature does not match
pub fn decode_metadata(sector: &[u8]) -> Option<Metadata> {
    let raw = sector.get(..METADATA_LEN)?;
    if &raw[4..11] != METADATA_MAGIC {
        return None;
    }
    Some(Metadata {
        next_write: u32::from_le_bytes(raw[..4].try_into().ok()?),
        high_water: u32::from_le_bytes(raw[METADATA_HEADER_LEN..].try_into().ok()?),
    })
}

/// `!timestamp,lat,lon\n` with 6-decimal coordinates
pub fn format_record(fix: &Fix) -> Option<RecordLine> {
    let mut line = RecordLine::new();
    write!(
        line,
        "{}{},{:.6},{:.6}\n",
        PENDING_MARKER as char, fix.timestamp, fix.latitude, fix.longitude
    )
    .ok()?;
    Some(line)
}

/// Full sector image of a record: line followed by zero padding
pub fn record_sector(line: &RecordLine) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];
    sector[..line.len()].copy_from_slice(line.as_bytes());
    sector
}

/// Parse the line after the marker; nothing past its terminator is read
pub fn parse_record(sector: &[u8]) -> Option<Fix> {
    let body = sector.get(1..)?;
    let end = body.iter().position(|&b| b == b'\n')?;
    let line = std::str::from_utf8(&body[..end]).ok()?;

    let mut fields = line.split(',');
    let timestamp = fields.next()?;
    let lat: f64 = fields.next()?.parse().ok()?;
    let lon: f64 = fields.next()?.parse().ok()?;
    if fields.next().is_some() || timestamp.is_empty() {
        return None;
    }
    Fix::new(lat, lon, timestamp).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix() -> Fix {
        Fix::new(45.5, -73.6, "2025-01-01%2012:00:00").unwrap()
    }

    #[test]
    fn test_metadata_layout() {
        let meta = Metadata {
            next_write: 0x0102_0304,
            high_water: 0x0A0B,
        };
        let raw = encode_metadata(&meta);
        assert_eq!(&raw, b"\x04\x03\x02\x01LOGDATA\0\x0B\x0A\0\0");
        assert_eq!(decode_metadata(&raw), Some(meta));
    }

    #[test]
    fn test_metadata_without_stored_mark_reads_zero() {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..12].copy_from_slice(b"\x07\0\0\0LOGDATA\0");
        assert_eq!(
            decode_metadata(&sector),
            Some(Metadata {
                next_write: 7,
                high_water: 0
            })
        );
    }

    #[test]
    fn test_metadata_bad_signature() {
        let mut raw = encode_metadata(&Metadata {
            next_write: 5,
            high_water: 4,
        });
        raw[6] = b'X';
        assert_eq!(decode_metadata(&raw), None);
        assert_eq!(decode_metadata(&[0u8; 4]), None);
    }

    #[test]
    fn test_record_format() {
        let line = format_record(&fix()).unwrap();
        assert_eq!(line.as_str(), "!2025-01-01%2012:00:00,45.500000,-73.600000\n");
    }

    #[test]
    fn test_record_round_trip_keeps_six_decimals() {
        let original = Fix::new(-33.8688197, 151.2092953, "2025-06-30%2023:59:59").unwrap();
        let sector = record_sector(&format_record(&original).unwrap());
        let parsed = parse_record(&sector).unwrap();
        assert_eq!(parsed.timestamp, original.timestamp);
        assert!((parsed.latitude - original.latitude).abs() < 5e-7);
        assert!((parsed.longitude - original.longitude).abs() < 5e-7);
        assert_eq!(format!("{:.6}", parsed.latitude), "-33.868820");
    }

    #[test]
    fn test_longest_record_fits() {
        let stamp = "9".repeat(crate::fix::TIMESTAMP_CAPACITY);
        let worst = Fix::new(-89.999999, -179.999999, &stamp).unwrap();
        assert!(format_record(&worst).is_some());
    }

    #[test]
    fn test_parse_ignores_bytes_past_terminator() {
        let mut sector = record_sector(&format_record(&fix()).unwrap());
        let tail = sector.iter().position(|&b| b == b'\n').unwrap() + 1;
        sector[tail..tail + 6].copy_from_slice(b",junk\n");
        sector[0] = SENT_MARKER;
        assert_eq!(parse_record(&sector), Some(fix()));
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert_eq!(parse_record(b"!2025,45.5\n"), None);
        assert_eq!(parse_record(b"!2025,abc,1.0\n"), None);
        assert_eq!(parse_record(b"!2025,1.0,2.0,3.0\n"), None);
        assert_eq!(parse_record(b"!2025,1.0,2.0"), None);
        assert_eq!(parse_record(b"!,1.0,2.0\n"), None);
        assert_eq!(parse_record(b"!t,NaN,2.0\n"), None);
        assert_eq!(parse_record(b""), None);
    }

    #[test]
    fn test_marker_classification() {
        assert_eq!(Marker::of(b"!x"), Marker::Pending);
        assert_eq!(Marker::of(b"#x"), Marker::Sent);
        assert_eq!(Marker::of(&[0u8; 4]), Marker::Empty);
        assert_eq!(Marker::of(b""), Marker::Empty);
        assert!(Marker::Sent.is_reclaimable());
        assert!(!Marker::Pending.is_reclaimable());
    }
}
