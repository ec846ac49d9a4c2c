//! Sector-addressed block storage.

use crate::error::{Result, TrackerError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::info;

/// Size of one storage sector in bytes
pub const SECTOR_SIZE: usize = 512;

pub type Sector = [u8; SECTOR_SIZE];

/// Exclusive, synchronous access to fixed-size sectors.
///
/// A write is durable only once [`BlockDevice::flush`] has returned.
pub trait BlockDevice {
    /// Read a whole sector; never-written space reads as zeros
    fn read(&mut self, sector: u32, buf: &mut Sector) -> Result<()>;

    /// Write `data` into `sector` starting at byte `offset`
    fn write(&mut self, sector: u32, offset: usize, data: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;
}

fn check_bounds(offset: usize, len: usize) -> Result<()> {
    if offset + len > SECTOR_SIZE {
        return Err(TrackerError::Storage(format!(
            "write of {} bytes at offset {} crosses sector boundary",
            len, offset
        )));
    }
    Ok(())
}

/// Sectors stored back to back in one host file
pub struct FileBlockDevice {
    file: File,
}

impl FileBlockDevice {
    /// Open or create the backing file without truncating it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        info!("Log storage opened at {}", path.display());
        Ok(Self { file })
    }

    fn seek(&mut self, sector: u32, offset: usize) -> Result<()> {
        let pos = sector as u64 * SECTOR_SIZE as u64 + offset as u64;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }
}

impl BlockDevice for FileBlockDevice {
    fn read(&mut self, sector: u32, buf: &mut Sector) -> Result<()> {
        self.seek(sector, 0)?;
        let mut filled = 0;
        while filled < SECTOR_SIZE {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    fn write(&mut self, sector: u32, offset: usize, data: &[u8]) -> Result<()> {
        check_bounds(offset, data.len())?;
        self.seek(sector, offset)?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}
