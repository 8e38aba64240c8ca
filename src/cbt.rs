//! Change Block Tracking: the two-generation dirty-block map.
//!
//! Grounded on `examples/original_source/module/cbt_map.h` and
//! `cbt_map.c`'s adaptive block sizing, re-expressed with a
//! `parking_lot::Mutex` standing in for the kernel spinlock since this is
//! this map's one designated leaf lock (`spec.md` §5, "CBT lock is a leaf").

use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

use crate::blockdev::{Sector, SECTOR_SHIFT};
use crate::config::SnapshotEngineConfig;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbtError {
    #[error("sector range outside device capacity")]
    OutOfRange,
    #[error("CBT map corrupted")]
    Corrupted,
}

pub type Result<T> = std::result::Result<T, CbtError>;

struct Inner {
    shift: u32,
    read_map: Vec<u8>,
    write_map: Vec<u8>,
    snap_number_active: u8,
    snap_number_previous: u8,
    generation_id: Uuid,
    corrupted: bool,
}

/// Per-original-device change tracking map. Outlives any single snapshot;
/// `switch` is called each time a snapshot is taken of the device.
pub struct CbtMap {
    inner: Mutex<Inner>,
    capacity_sectors: Sector,
}

impl CbtMap {
    /// Build a fresh map for a device of `capacity_sectors`, sizing the
    /// tracked block to stay within `tracking_block_maximum_count` blocks
    /// per `spec.md` §4.4 steps 1-3.
    pub fn new(capacity_sectors: Sector, config: &SnapshotEngineConfig) -> Self {
        let mut shift = config.tracking_block_minimum_shift;
        let mut count = block_count(capacity_sectors, shift);
        while count > config.tracking_block_maximum_count && shift < config.tracking_block_maximum_shift {
            shift += 1;
            count = block_count(capacity_sectors, shift);
        }

        let count = count as usize;
        Self {
            inner: Mutex::new(Inner {
                shift,
                read_map: vec![0u8; count],
                write_map: vec![0u8; count],
                snap_number_active: 1,
                snap_number_previous: 0,
                generation_id: Uuid::new_v4(),
                corrupted: false,
            }),
            capacity_sectors,
        }
    }

    pub fn block_shift(&self) -> u32 {
        self.inner.lock().shift
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().read_map.len()
    }

    pub fn generation_id(&self) -> Uuid {
        self.inner.lock().generation_id
    }

    pub fn snap_number_active(&self) -> u8 {
        self.inner.lock().snap_number_active
    }

    pub fn is_corrupted(&self) -> bool {
        self.inner.lock().corrupted
    }

    fn block_range(&self, inner: &Inner, start: Sector, count: Sector) -> Result<(usize, usize)> {
        if start + count > self.capacity_sectors {
            return Err(CbtError::OutOfRange);
        }
        let block_sectors: Sector = 1 << (inner.shift - SECTOR_SHIFT);
        let first = (start / block_sectors) as usize;
        let last = ((start + count - 1) / block_sectors) as usize;
        if last >= inner.read_map.len() {
            return Err(CbtError::OutOfRange);
        }
        Ok((first, last))
    }

    /// Mark `[start, start+count)` dirty in the write map, and in the read
    /// map too when `also_read` is set (snapshot-image writes diverge the
    /// image from the original immediately, per `spec.md` §4.6).
    pub fn set(&self, start: Sector, count: Sector, also_read: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let range = self.block_range(&inner, start, count);
        let (first, last) = match range {
            Ok(r) => r,
            Err(e) => {
                inner.corrupted = true;
                return Err(e);
            }
        };
        let active = inner.snap_number_active;
        for i in first..=last {
            inner.write_map[i] = inner.write_map[i].max(active);
            if also_read {
                inner.read_map[i] = inner.read_map[i].max(active);
            }
        }
        Ok(())
    }

    /// Mark dirty in both maps unconditionally. Used by the `CBT_DIRTY`
    /// control operation.
    pub fn set_both(&self, start: Sector, count: Sector) -> Result<()> {
        self.set(start, count, true)
    }

    /// Copy `write_map` into `read_map` and advance the active generation.
    /// At 256, wraps: resets to 1, zeroes the write map, and regenerates
    /// `generation_id`.
    pub fn switch(&self) {
        let mut inner = self.inner.lock();
        let write_map_snapshot = inner.write_map.clone();
        inner.read_map.copy_from_slice(&write_map_snapshot);
        inner.snap_number_previous = inner.snap_number_active;

        if inner.snap_number_active == 255 {
            inner.snap_number_active = 1;
            inner.write_map.iter_mut().for_each(|b| *b = 0);
            inner.generation_id = Uuid::new_v4();
        } else {
            inner.snap_number_active += 1;
        }
    }

    /// Snapshot-time view of the read map, for `CBT_MAP` readout.
    pub fn read_map_snapshot(&self) -> Vec<u8> {
        self.inner.lock().read_map.clone()
    }
}

fn block_count(capacity_sectors: Sector, shift: u32) -> u64 {
    let block_sectors: u64 = 1 << (shift - SECTOR_SHIFT);
    (capacity_sectors + block_sectors - 1) / block_sectors
}
