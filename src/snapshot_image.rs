//! The snapshot image: a virtual read/write block device over a diff area.
//!
//! Grounded on `examples/original_source/module/snapimage.c`. Exposes a
//! [`BlockDevice`] whose logical/physical block sizes match the original
//! (`spec.md` §4.6, "Queue limits").

use std::sync::Arc;

use async_trait::async_trait;

use crate::blockdev::{BlockDevice, BlockDeviceError, Result, Sector, SectorRange};
use crate::cbt::CbtMap;
use crate::diff_area::DiffArea;

/// A frozen, writable view of an original device as it was at snapshot
/// time. Reads and writes never touch the original.
pub struct SnapshotImage {
    original: Arc<dyn BlockDevice>,
    diff_area: Arc<DiffArea>,
    cbt: Arc<CbtMap>,
}

impl SnapshotImage {
    pub fn new(original: Arc<dyn BlockDevice>, diff_area: Arc<DiffArea>, cbt: Arc<CbtMap>) -> Self {
        Self { original, diff_area, cbt }
    }

    fn to_blockdev_err(err: crate::chunk::ChunkError) -> BlockDeviceError {
        match err {
            crate::chunk::ChunkError::Io(e) => BlockDeviceError::Io(e),
            crate::chunk::ChunkError::BlockDevice(e) => e,
            other => BlockDeviceError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

#[async_trait]
impl BlockDevice for SnapshotImage {
    async fn read_at(&self, start: Sector, buf: &mut [u8]) -> Result<()> {
        let count = buf.len() as u64 / crate::blockdev::SECTOR_SIZE;
        let range = SectorRange::new(start, count);
        self.diff_area
            .submit_image_read(range, buf)
            .await
            .map_err(Self::to_blockdev_err)
    }

    async fn write_at(&self, start: Sector, buf: &[u8]) -> Result<()> {
        let count = buf.len() as u64 / crate::blockdev::SECTOR_SIZE;
        let range = SectorRange::new(start, count);
        self.diff_area
            .submit_image_write(range, buf)
            .await
            .map_err(Self::to_blockdev_err)?;

        // Writing to the image diverges it from the original: both the
        // stable (read) and live (write) CBT maps learn about it.
        if self.cbt.set_both(start, count).is_err() {
            log::warn!("CBT mark-dirty failed for image write at {}..{}", start, start + count);
        }
        Ok(())
    }

    fn capacity_sectors(&self) -> Sector {
        self.original.capacity_sectors()
    }

    fn logical_block_size(&self) -> usize {
        self.original.logical_block_size()
    }

    fn physical_block_size(&self) -> usize {
        self.original.physical_block_size()
    }

    async fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn is_read_only(&self) -> bool {
        false
    }
}
