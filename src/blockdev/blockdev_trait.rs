//! Original-device abstraction for the snapshot engine.

use std::io;
use thiserror::Error;

/// Sector size in bytes. All offsets and counts in this crate are expressed
/// in sectors, matching `sector_t` in the kernel source this design is
/// grounded on.
pub const SECTOR_SIZE: u64 = 512;

/// `log2(SECTOR_SIZE)`.
pub const SECTOR_SHIFT: u32 = 9;

/// A sector index or count on an original device.
pub type Sector = u64;

/// A half-open, non-empty range of sectors: `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectorRange {
    pub start: Sector,
    pub count: Sector,
}

impl SectorRange {
    pub fn new(start: Sector, count: Sector) -> Self {
        Self { start, count }
    }

    pub fn end(&self) -> Sector {
        self.start + self.count
    }

    pub fn overlaps(&self, other: &SectorRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// The overlap between `self` and `other`, if any.
    pub fn intersect(&self, other: &SectorRange) -> Option<SectorRange> {
        let start = self.start.max(other.start);
        let end = self.end().min(other.end());
        if start < end {
            Some(SectorRange::new(start, end - start))
        } else {
            None
        }
    }
}

/// Error type for original-device operations.
#[derive(Error, Debug)]
pub enum BlockDeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("sector range {start}+{count} is out of bounds (capacity {capacity} sectors)")]
    OutOfBounds {
        start: Sector,
        count: Sector,
        capacity: Sector,
    },
    #[error("buffer length {0} is not a multiple of the logical block size {1}")]
    Misaligned(usize, usize),
    #[error("device is read-only")]
    ReadOnly,
    #[error("device is already closed")]
    DeviceClosed,
}

/// Result type for original-device operations.
pub type Result<T> = std::result::Result<T, BlockDeviceError>;

/// An original block device that writes can be intercepted on.
///
/// Reads and writes are sector-addressed and may span multiple sectors in
/// one call; implementations validate that `buf.len()` is a multiple of
/// `logical_block_size()` and that the addressed range fits the device.
#[async_trait::async_trait]
pub trait BlockDevice: Send + Sync + 'static {
    /// Read sectors starting at `start` into `buf`.
    async fn read_at(&self, start: Sector, buf: &mut [u8]) -> Result<()>;

    /// Write sectors starting at `start` from `buf`.
    async fn write_at(&self, start: Sector, buf: &[u8]) -> Result<()>;

    /// Total capacity of the device, in sectors.
    fn capacity_sectors(&self) -> Sector;

    /// Logical block size in bytes (the minimum addressable/aligned unit).
    fn logical_block_size(&self) -> usize {
        SECTOR_SIZE as usize
    }

    /// Physical block size in bytes (preferred I/O alignment).
    fn physical_block_size(&self) -> usize {
        self.logical_block_size()
    }

    /// Flush any buffered writes to stable storage.
    async fn sync(&self) -> Result<()>;

    /// Whether this device rejects writes.
    fn is_read_only(&self) -> bool {
        false
    }
}
