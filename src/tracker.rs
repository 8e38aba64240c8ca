//! The bio interceptor: the filter installed on an original device.
//!
//! Grounded on `examples/original_source/module/tracker.c`. Owns the CBT
//! map for its device (which outlives any single snapshot) and, once a
//! snapshot has been taken, holds the diff area writes are copied into.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::blockdev::{BlockDevice, BlockDeviceError, Sector, SectorRange};
use crate::cbt::{CbtError, CbtMap};
use crate::chunk::ChunkError;
use crate::config::SnapshotEngineConfig;
use crate::control::{CbtInfoReply, CbtMapReply};
use crate::diff_area::DiffArea;

#[derive(Error, Debug)]
pub enum TrackerError {
    /// The chunk lock was contended under a `NOWAIT` submission.
    #[error("resource temporarily unavailable")]
    Again,
    #[error("device already has a tracker attached")]
    AlreadyAttached,
    #[error("device has no tracker attached")]
    NotAttached,
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),
    #[error("original device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
    #[error("CBT error: {0}")]
    Cbt(#[from] CbtError),
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Snapshot-related state a tracker carries across its attachment, guarded
/// by the tracker's control mutex along with ioctl-shaped operations
/// (`spec.md` §4.1, "Ioctl-like control ops").
struct Control {
    diff_area: Option<Arc<DiffArea>>,
    snapshot_is_taken: bool,
}

/// Installed on one original device. Survives across multiple snapshots of
/// that device and carries its CBT map between them.
pub struct Tracker {
    original: Arc<dyn BlockDevice>,
    cbt: Arc<CbtMap>,
    control: AsyncMutex<Control>,
    /// Reference count the source's `tracker_get`/`tracker_put` kref
    /// models: `attach` starts it at one; `detach` is its release path.
    ref_count: AtomicUsize,
}

impl Tracker {
    /// Install this filter on `original`. The caller is responsible for
    /// having quiesced the device's queue for the duration of attachment,
    /// matching the kernel module's contract.
    pub fn attach(original: Arc<dyn BlockDevice>, config: &SnapshotEngineConfig) -> Self {
        let cbt = Arc::new(CbtMap::new(original.capacity_sectors(), config));
        Self {
            original,
            cbt,
            control: AsyncMutex::new(Control {
                diff_area: None,
                snapshot_is_taken: false,
            }),
            ref_count: AtomicUsize::new(1),
        }
    }

    /// Take another reference on this tracker, e.g. when a second control
    /// surface hands out a handle to the same device.
    pub fn acquire(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Release a reference, per `spec.md` §4.1's `detach`: "uninstalls;
    /// decrements reference count". Uninstalls the diff area only once the
    /// count reaches zero; returns `Ok(true)` when this call was the one
    /// that uninstalled it. Errors if the tracker was already fully
    /// detached.
    pub async fn detach(&self) -> Result<bool> {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match previous {
            Ok(1) => {
                self.clear_diff_area().await;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(_) => Err(TrackerError::NotAttached),
        }
    }

    pub fn cbt(&self) -> &Arc<CbtMap> {
        &self.cbt
    }

    pub fn original(&self) -> &Arc<dyn BlockDevice> {
        &self.original
    }

    pub async fn is_taken(&self) -> bool {
        self.control.lock().await.snapshot_is_taken
    }

    /// Install a fresh diff area and flip `snapshot_is_taken`, called by
    /// `Snapshot::take` after the device's queue has been frozen.
    pub async fn install_diff_area(&self, diff_area: Arc<DiffArea>) -> Result<()> {
        let mut control = self.control.lock().await;
        control.diff_area = Some(diff_area);
        control.snapshot_is_taken = true;
        Ok(())
    }

    /// Tear down the diff area on snapshot destruction.
    pub async fn clear_diff_area(&self) {
        let mut control = self.control.lock().await;
        control.diff_area = None;
        control.snapshot_is_taken = false;
    }

    pub async fn diff_area(&self) -> Option<Arc<DiffArea>> {
        self.control.lock().await.diff_area.clone()
    }

    /// The write-path algorithm from `spec.md` §4.1: preserve pre-write
    /// contents of every overlapped chunk (if a snapshot is taken), then
    /// always record the range in the CBT. Returns `Ok(true)` ("handled")
    /// only if the caller should not submit the original write itself —
    /// this implementation never defers the original write, so it always
    /// returns `Ok(false)` on success; `NOWAIT` contention surfaces as
    /// [`TrackerError::Again`] instead, leaving the decision to retry with
    /// the caller.
    pub async fn submit_write(&self, range: SectorRange, nowait: bool) -> Result<bool> {
        let diff_area = self.control.lock().await.diff_area.clone();

        if let Some(area) = diff_area {
            match area.cow_for(range, nowait).await {
                Ok(()) => {}
                Err(ChunkError::WouldBlock) => return Err(TrackerError::Again),
                Err(other) => return Err(TrackerError::Chunk(other)),
            }
        }

        if let Err(_e) = self.cbt.set(range.start, range.count, false) {
            log::warn!("CBT mark-dirty failed for tracker on {:?}", range);
        }

        Ok(false)
    }

    /// Non-write bios reach only the CBT no-op: they are never absorbed.
    pub fn submit_read(&self, _range: SectorRange) -> bool {
        false
    }

    /// `CBT_INFO`. Serialized through the control mutex alongside
    /// `diff_area`/`snapshot_is_taken`, matching `spec.md` §4.1's
    /// "Ioctl-like control ops" even though `CbtMap` carries its own lock.
    pub async fn cbt_info(&self) -> CbtInfoReply {
        let _control = self.control.lock().await;
        CbtInfoReply {
            device_capacity: self.original.capacity_sectors(),
            block_size: 1u32 << self.cbt.block_shift(),
            block_count: self.cbt.block_count() as u64,
            generation_id: self.cbt.generation_id(),
            changes_number: self.cbt.snap_number_active(),
        }
    }

    /// `CBT_MAP`: a byte-range readout of the read map.
    pub async fn cbt_map(&self, offset: usize, length: usize) -> CbtMapReply {
        let _control = self.control.lock().await;
        let map = self.cbt.read_map_snapshot();
        let data = if offset >= map.len() {
            Vec::new()
        } else {
            map[offset..(offset + length).min(map.len())].to_vec()
        };
        CbtMapReply { data }
    }

    /// `CBT_DIRTY`: mark ranges dirty out of band, e.g. after a host-side
    /// repair that bypassed this tracker's write path.
    pub async fn cbt_dirty(&self, ranges: &[(Sector, Sector)]) -> Result<()> {
        let _control = self.control.lock().await;
        for &(start, count) in ranges {
            self.cbt.set_both(start, count)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdev::FileBackedBlockDevice;
    use crate::diff_storage::DiffStorage;
    use crate::event::EventQueue;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_before_snapshot_only_updates_cbt() {
        let dir = tempdir().unwrap();
        let original = Arc::new(
            FileBackedBlockDevice::create(dir.path().join("orig.img"), crate::blockdev::SECTOR_SIZE * 64)
                .await
                .unwrap(),
        ) as Arc<dyn BlockDevice>;
        let config = SnapshotEngineConfig::default();
        let tracker = Tracker::attach(original, &config);

        tracker.submit_write(SectorRange::new(0, 1), false).await.unwrap();
        assert!(!tracker.is_taken().await);
        assert_eq!(tracker.cbt().read_map_snapshot()[0], 0, "write_map isn't switched into read_map yet");
    }

    #[tokio::test]
    async fn write_after_take_goes_through_cow() {
        let dir = tempdir().unwrap();
        let original = Arc::new(
            FileBackedBlockDevice::create(dir.path().join("orig.img"), crate::blockdev::SECTOR_SIZE * 64)
                .await
                .unwrap(),
        ) as Arc<dyn BlockDevice>;
        let config = SnapshotEngineConfig::default();
        let tracker = Tracker::attach(original.clone(), &config);

        let events = Arc::new(EventQueue::new());
        let diff_storage = Arc::new(
            DiffStorage::open_file(dir.path().join("diff.img"), 256, 256, events.clone())
                .await
                .unwrap(),
        );
        let diff_area = DiffArea::new(original, diff_storage, events, &config);
        tracker.install_diff_area(diff_area.clone()).await.unwrap();
        tracker.cbt().switch();

        tracker.submit_write(SectorRange::new(0, 1), false).await.unwrap();
        diff_area.flush_and_shutdown().await;

        assert!(tracker.is_taken().await);
        let block_sectors: Sector = 1 << (tracker.cbt().block_shift() - crate::blockdev::SECTOR_SHIFT);
        let _ = block_sectors;
    }
}
