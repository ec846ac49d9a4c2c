//! Store-and-forward report log over block storage.
//!
//! Every report is written to its own sector as pending and flipped to
//! sent by a one-byte marker write once the server accepted it. Sent
//! sectors are reclaimed by later appends.
//!
//! The sector just past the high-water mark is kept free of stale
//! records, so after a crash it can only hold the append that was
//! interrupted before its metadata update.

use super::block::{BlockDevice, Sector, SECTOR_SIZE};
use super::record::{
    decode_metadata, encode_metadata, format_record, parse_record, record_sector, Marker,
    Metadata, SENT_MARKER,
};
use crate::board::Watchdog;
use crate::error::Result;
use crate::fix::Fix;
use crate::telemetry::{NetFailCounter, Uplink};
use tracing::{debug, error, info, warn};

const METADATA_SECTOR: u32 = 0;

/// First byte of a sector that holds no record
const CLEARED_MARKER: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Written { sector: u32 },
    /// No reclaimable sector left; the report is dropped
    Full,
    /// Storage is not usable this session
    Unavailable,
    /// The fix does not format into a record
    Invalid,
    StorageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResendOutcome {
    Unavailable,
    /// Nothing pending
    Idle,
    Sent { sector: u32 },
    /// Unparseable record retired without sending
    Discarded { sector: u32 },
    Failed { sector: u32, consecutive: u32 },
    /// Failure threshold crossed and recovery performed
    Escalated { sector: u32 },
    StorageError,
}

/// Persistent log state: the card plus the write cursor and the highest
/// sector ever written.
///
/// Sector scans feed `watchdog` once per sector read.
pub struct PersistentLog<B, W> {
    device: Option<B>,
    watchdog: W,
    max_sectors: u32,
    next_write: u32,
    high_water: u32,
}

impl<B, W> std::fmt::Debug for PersistentLog<B, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentLog")
            .field("available", &self.device.is_some())
            .field("max_sectors", &self.max_sectors)
            .field("next_write", &self.next_write)
            .field("high_water", &self.high_water)
            .finish()
    }
}

impl<B: BlockDevice, W: Watchdog> PersistentLog<B, W> {
    /// Log that skips every operation
    pub fn unavailable(watchdog: W, max_sectors: u32) -> Self {
        Self {
            device: None,
            watchdog,
            max_sectors: max_sectors.max(1),
            next_write: 1,
            high_water: 0,
        }
    }

    /// Boot-time recovery from the metadata sector.
    ///
    /// A bad signature, an out-of-range index or an unreadable sector resets
    /// the log to empty and discards whatever was pending. If even the reset
    /// cannot be written the log is unavailable for this session.
    pub fn recover(mut device: B, mut watchdog: W, max_sectors: u32) -> Self {
        let max_sectors = max_sectors.max(1);
        let mut sector = [0u8; SECTOR_SIZE];
        watchdog.feed();
        let stored = match device.read(METADATA_SECTOR, &mut sector) {
            Ok(()) => decode_metadata(&sector).filter(|m| {
                (1..=max_sectors).contains(&m.next_write) && m.high_water <= max_sectors
            }),
            Err(e) => {
                warn!("Log metadata unreadable: {}", e);
                None
            }
        };

        let mut log = Self {
            device: Some(device),
            watchdog,
            max_sectors,
            next_write: 1,
            high_water: 0,
        };

        match stored {
            Some(meta) => {
                log.next_write = meta.next_write;
                // Cards without a stored mark only know the cursor
                log.high_water = meta.high_water.max(meta.next_write - 1);
                log.recover_interrupted_append();
                info!(
                    "Log recovered: next write {}, high-water mark {}",
                    log.next_write, log.high_water
                );
            }
            None => {
                warn!("Log metadata invalid, starting with an empty log");
                if let Err(e) = log.reset() {
                    error!("Cannot reset log metadata, disabling log: {}", e);
                    log.device = None;
                }
            }
        }
        log
    }

    pub fn is_available(&self) -> bool {
        self.device.is_some()
    }

    pub fn next_write(&self) -> u32 {
        self.next_write
    }

    pub fn high_water_mark(&self) -> u32 {
        self.high_water
    }

    /// Store `fix` as a pending record
    pub fn append(&mut self, fix: &Fix) -> AppendOutcome {
        if self.device.is_none() {
            return AppendOutcome::Unavailable;
        }
        let Some(line) = format_record(fix) else {
            return AppendOutcome::Invalid;
        };

        let target = match self.select_target() {
            Ok(Some(sector)) => sector,
            Ok(None) => {
                warn!("Log full, dropping report");
                return AppendOutcome::Full;
            }
            Err(e) => {
                warn!("Log scan failed: {}", e);
                return AppendOutcome::StorageError;
            }
        };

        match self.write_record(target, &record_sector(&line)) {
            Ok(()) => {
                debug!("Report logged in sector {}", target);
                AppendOutcome::Written { sector: target }
            }
            Err(e) => {
                warn!("Log write to sector {} failed: {}", target, e);
                AppendOutcome::StorageError
            }
        }
    }

    /// Retry the oldest pending record through `uplink`.
    ///
    /// The scan runs forward from the write cursor up to the high-water
    /// mark, then from sector 1 up to the cursor.
    pub fn resend_oldest_pending<U: Uplink + ?Sized>(
        &mut self,
        uplink: &mut U,
        failures: &mut NetFailCounter,
    ) -> ResendOutcome {
        if self.device.is_none() {
            return ResendOutcome::Unavailable;
        }

        let mut sector = [0u8; SECTOR_SIZE];
        let found = match self.find_pending(&mut sector) {
            Ok(found) => found,
            Err(e) => {
                warn!("Log scan failed: {}", e);
                return ResendOutcome::StorageError;
            }
        };
        let Some(index) = found else {
            return ResendOutcome::Idle;
        };

        let Some(fix) = parse_record(&sector) else {
            warn!("Sector {} holds a malformed record, retiring it", index);
            return match self.mark_sent(index) {
                Ok(()) => ResendOutcome::Discarded { sector: index },
                Err(_) => ResendOutcome::StorageError,
            };
        };

        debug!("Resending sector {}", index);
        if uplink.send_report(&fix) {
            failures.record_success();
            if let Err(e) = self.mark_sent(index).and_then(|_| self.save_metadata()) {
                warn!("Cannot mark sector {} sent: {}", index, e);
                return ResendOutcome::StorageError;
            }
            info!("Pending report in sector {} delivered", index);
            return ResendOutcome::Sent { sector: index };
        }

        if failures.record_failure() {
            warn!("Send failure threshold reached, forcing modem recovery");
            uplink.force_recovery();
            return ResendOutcome::Escalated { sector: index };
        }
        ResendOutcome::Failed {
            sector: index,
            consecutive: failures.count(),
        }
    }

    fn device(&mut self) -> Result<&mut B> {
        self.device
            .as_mut()
            .ok_or_else(|| crate::error::TrackerError::Storage("log unavailable".into()))
    }

    fn read_sector(&mut self, index: u32, buf: &mut Sector) -> Result<()> {
        self.watchdog.feed();
        self.device()?.read(index, buf)
    }

    fn marker(&mut self, index: u32, buf: &mut Sector) -> Result<Marker> {
        self.read_sector(index, buf)?;
        Ok(Marker::of(buf))
    }

    fn wrap(&self, index: u32) -> u32 {
        if index >= self.max_sectors {
            1
        } else {
            index + 1
        }
    }

    /// Adopt a well-formed pending record just past the high-water mark:
    /// an append that reached the card but not the metadata
    fn recover_interrupted_append(&mut self) {
        if self.high_water >= self.max_sectors {
            return;
        }
        let candidate = self.high_water + 1;
        let mut buf = [0u8; SECTOR_SIZE];
        let interrupted = match self.marker(candidate, &mut buf) {
            Ok(Marker::Pending) => parse_record(&buf).is_some(),
            Ok(_) => false,
            Err(e) => {
                warn!("Cannot inspect sector {}: {}", candidate, e);
                false
            }
        };
        if !interrupted {
            return;
        }

        info!("Recovered report in sector {} written before power loss", candidate);
        self.high_water = candidate;
        self.next_write = self.wrap(candidate);
        if let Err(e) = self.save_metadata() {
            warn!("Cannot persist recovered log state: {}", e);
        }
    }

    /// Empty log: sector 1 loses any stale record, then metadata restarts
    fn reset(&mut self) -> Result<()> {
        self.next_write = 1;
        self.high_water = 0;
        self.clear_marker(1)?;
        self.save_metadata()
    }

    fn select_target(&mut self) -> Result<Option<u32>> {
        let mut buf = [0u8; SECTOR_SIZE];
        let cursor = self.next_write;
        if cursor > self.high_water || self.marker(cursor, &mut buf)?.is_reclaimable() {
            return Ok(Some(cursor));
        }
        for index in 1..=self.high_water {
            if self.marker(index, &mut buf)?.is_reclaimable() {
                return Ok(Some(index));
            }
        }
        if self.high_water < self.max_sectors {
            return Ok(Some(self.high_water + 1));
        }
        Ok(None)
    }

    fn find_pending(&mut self, buf: &mut Sector) -> Result<Option<u32>> {
        let cursor = self.next_write.min(self.high_water + 1);
        for index in (cursor..=self.high_water).chain(1..cursor) {
            if self.marker(index, buf)? == Marker::Pending {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn write_record(&mut self, index: u32, image: &Sector) -> Result<()> {
        let device = self.device()?;
        device.write(index, 0, image)?;
        device.flush()?;

        if index > self.high_water && index < self.max_sectors {
            self.clear_marker(index + 1)?;
        }
        self.high_water = self.high_water.max(index);
        self.next_write = self.wrap(index);
        self.save_metadata()
    }

    /// Flip the marker byte only
    fn mark_sent(&mut self, index: u32) -> Result<()> {
        let device = self.device()?;
        device.write(index, 0, &[SENT_MARKER])?;
        device.flush()
    }

    fn clear_marker(&mut self, index: u32) -> Result<()> {
        let device = self.device()?;
        device.write(index, 0, &[CLEARED_MARKER])?;
        device.flush()
    }

    fn save_metadata(&mut self) -> Result<()> {
        let meta = encode_metadata(&Metadata {
            next_write: self.next_write,
            high_water: self.high_water,
        });
        let device = self.device()?;
        device.write(METADATA_SECTOR, 0, &meta)?;
        device.flush()
    }
}
