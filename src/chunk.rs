//! The chunk state machine: the atomic copy-on-write unit.
//!
//! Grounded on `examples/original_source/module/chunk.h`'s `struct chunk`
//! and state bitmask, simplified to the four-state machine `spec.md` §3
//! describes (`NEW -> IN_MEMORY -> STORED`, with `FAILED` reachable from
//! any state on I/O error).

use std::io;
use std::sync::Weak;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, TryLockError};

use crate::blockdev::{BlockDeviceError, Sector};
use crate::diff_area::DiffArea;
use crate::diff_storage::StorageLocation;

#[derive(Error, Debug)]
pub enum ChunkError {
    /// The chunk lock is held and the caller asked for `NOWAIT` semantics.
    #[error("chunk lock contended")]
    WouldBlock,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The chunk has latched into the failed state.
    #[error("chunk is in the failed state")]
    Failed,
    #[error("diff storage exhausted")]
    NoSpace,
    #[error("original device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
}

pub type Result<T> = std::result::Result<T, ChunkError>;

/// Legal chunk states. See `spec.md` §3 for the transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Never touched: reads fall through to the original device.
    New,
    /// Pre-write contents are buffered in memory, awaiting the store worker.
    InMemory,
    /// Pre-write contents have been written to diff storage.
    Stored,
    /// An I/O error occurred; the chunk (and its diff area) are corrupted.
    Failed,
}

/// A chunk-sized, heap-allocated byte buffer. Always exactly
/// `sector_count * SECTOR_SIZE` bytes for its owning chunk.
pub type DiffBuffer = Box<[u8]>;

/// Fields protected by the chunk's lock. Per invariant 7 in `spec.md`,
/// the lock is held across every mutation of these fields and across the
/// I/O that produces or consumes them.
#[derive(Default)]
pub struct ChunkInner {
    pub state: Option<ChunkState>,
    pub diff_buffer: Option<DiffBuffer>,
    pub location: Option<StorageLocation>,
}

impl ChunkInner {
    fn new() -> Self {
        Self {
            state: Some(ChunkState::New),
            diff_buffer: None,
            location: None,
        }
    }

    pub fn state(&self) -> ChunkState {
        self.state.expect("chunk state always populated after construction")
    }
}

/// The atomic copy-on-write unit: a fixed-size, chunk-shift-aligned sector
/// range of the original device.
pub struct Chunk {
    pub number: u64,
    pub sector_count: Sector,
    /// Weak back-reference to the owning diff area (invariant: the
    /// ownership tree is rooted at the snapshot, so this must not be a
    /// strong reference or diff area/chunk would keep each other alive).
    pub diff_area: Weak<DiffArea>,
    inner: Mutex<ChunkInner>,
}

impl Chunk {
    pub fn new(diff_area: Weak<DiffArea>, number: u64, sector_count: Sector) -> Self {
        Self {
            number,
            sector_count,
            diff_area,
            inner: Mutex::new(ChunkInner::new()),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.sector_count as usize * crate::blockdev::SECTOR_SIZE as usize
    }

    /// Acquire the chunk lock, suspending if contended. Used on the normal
    /// (non-`NOWAIT`) path.
    pub async fn lock(&self) -> MutexGuard<'_, ChunkInner> {
        self.inner.lock().await
    }

    /// Acquire the chunk lock without suspending; returns
    /// [`ChunkError::WouldBlock`] if contended. Used on the `REQ_NOWAIT`
    /// path (`spec.md` §4.1 step 2, §8 scenario S6).
    pub fn try_lock(&self) -> Result<MutexGuard<'_, ChunkInner>> {
        self.inner.try_lock().map_err(|_: TryLockError| ChunkError::WouldBlock)
    }

    /// Mark the chunk failed and propagate corruption to the diff area.
    /// Caller must already hold the chunk lock.
    pub fn fail_locked(&self, inner: &mut ChunkInner, err: ChunkError) {
        inner.state = Some(ChunkState::Failed);
        inner.diff_buffer = None;
        if let Some(area) = self.diff_area.upgrade() {
            area.set_corrupted(err.to_string());
        }
        log::error!("chunk {} failed: {}", self.number, err);
    }
}
