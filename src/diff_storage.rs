//! Diff storage: the backing store chunks are written out to.
//!
//! Grounded on `examples/original_source/module/diff_storage.c` (sequential
//! extent allocation over a growable backing file or block device) and on
//! `FileBackedBlockDevice`'s file-handle plumbing for the file-backed case.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

use crate::blockdev::{BlockDevice, BlockDeviceError, Sector, SECTOR_SIZE};
use crate::event::{Event, EventQueue};

#[derive(Error, Debug)]
pub enum DiffStorageError {
    #[error("diff storage exhausted")]
    NoSpace,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("backing device error: {0}")]
    BlockDevice(#[from] BlockDeviceError),
}

pub type Result<T> = std::result::Result<T, DiffStorageError>;

/// The storage backing a diff area's chunks are written to. A tagged sum
/// over the two kinds of backing the engine supports, replacing the union
/// the kernel module uses for the same purpose.
pub enum StorageBacking {
    /// A plain file on a host filesystem, grown on demand with `set_len`.
    /// Guarded by an async mutex, not a `parking_lot` one: the guard is
    /// held across the `seek`+`read`/`write` pair below to keep them
    /// atomic, and that span includes `.await` points.
    File(AsyncMutex<File>),
    /// A dedicated block device, pre-sized and never grown.
    BlockDevice(Arc<dyn BlockDevice>),
}

/// Where a chunk's pre-write contents live once flushed out of memory.
#[derive(Clone)]
pub struct StorageLocation {
    pub backing: Arc<StorageBacking>,
    pub offset: Sector,
}

/// Sequential extent allocator and I/O path for one diff area's backing
/// store. One instance per snapshot.
pub struct DiffStorage {
    backing: Arc<StorageBacking>,
    state: SyncMutex<State>,
    events: Arc<EventQueue>,
    grow_increment: Sector,
    /// Signaled once `low_space` latches true, so the reallocate worker
    /// can grow the backing ahead of the next `alloc` hitting it.
    low_space_notify: Notify,
    worker: SyncMutex<Option<JoinHandle<()>>>,
}

struct State {
    /// Sectors physically available in the backing right now.
    capacity: Sector,
    /// Sectors handed out by `alloc` so far.
    filled: Sector,
    /// Sectors requested but not yet satisfiable (set once on `NoSpace`).
    limit: Option<Sector>,
    /// Latched low-space flag: true from the allocation that first leaves
    /// less than `grow_increment` free until growth catches back up.
    /// Prevents `alloc` from re-raising `Event::LowSpace` on every single
    /// call once past the watermark (`spec.md` §4.3: "emits low-space
    /// once").
    low_space: bool,
}

impl DiffStorage {
    /// Open a file-backed diff storage, pre-allocating `initial` sectors.
    pub async fn open_file(
        path: PathBuf,
        initial: Sector,
        grow_increment: Sector,
        events: Arc<EventQueue>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await?;
        file.set_len(initial * SECTOR_SIZE).await?;

        Ok(Self {
            backing: Arc::new(StorageBacking::File(AsyncMutex::new(file))),
            state: SyncMutex::new(State {
                capacity: initial,
                filled: 0,
                limit: None,
                low_space: false,
            }),
            events,
            grow_increment,
            low_space_notify: Notify::new(),
            worker: SyncMutex::new(None),
        })
    }

    /// Use a pre-sized block device as diff storage. Never grown; capacity
    /// is fixed at the device's size.
    pub fn open_block_device(device: Arc<dyn BlockDevice>, events: Arc<EventQueue>) -> Self {
        let capacity = device.capacity_sectors();
        Self {
            backing: Arc::new(StorageBacking::BlockDevice(device)),
            state: SyncMutex::new(State {
                capacity,
                filled: 0,
                limit: None,
                low_space: false,
            }),
            events,
            grow_increment: 0,
            low_space_notify: Notify::new(),
            worker: SyncMutex::new(None),
        }
    }

    /// Sectors physically backed right now.
    pub fn capacity(&self) -> Sector {
        self.state.lock().capacity
    }

    /// Sectors already handed out by `alloc`.
    pub fn filled(&self) -> Sector {
        self.state.lock().filled
    }

    /// Allocate `count` contiguous sectors for a chunk and return the
    /// [`StorageLocation`] to write it at. Grows a file backing on demand;
    /// a block-device backing that runs out returns [`DiffStorageError::NoSpace`].
    pub async fn alloc(&self, count: Sector) -> Result<StorageLocation> {
        if count == 0 {
            return Err(DiffStorageError::InvalidArg("zero-length allocation".into()));
        }

        loop {
            let mut newly_low = false;
            {
                let mut state = self.state.lock();
                if state.filled + count <= state.capacity {
                    let offset = state.filled;
                    state.filled += count;
                    let low = state.capacity - state.filled < self.grow_increment.max(1);
                    if low && !state.low_space {
                        state.low_space = true;
                        newly_low = true;
                    } else if !low {
                        state.low_space = false;
                    }
                    drop(state);

                    if newly_low {
                        self.events.push(Event::LowSpace);
                        self.low_space_notify.notify_one();
                    }
                    return Ok(StorageLocation {
                        backing: self.backing.clone(),
                        offset,
                    });
                }
            }

            match &*self.backing {
                StorageBacking::BlockDevice(_) => {
                    self.events.push(Event::NoSpace);
                    return Err(DiffStorageError::NoSpace);
                }
                StorageBacking::File(file) => {
                    let grown = self.grow_file(file, count).await?;
                    if !grown {
                        self.events.push(Event::NoSpace);
                        return Err(DiffStorageError::NoSpace);
                    }
                }
            }
        }
    }

    async fn grow_file(&self, file: &AsyncMutex<File>, needed: Sector) -> Result<bool> {
        let increment = self.grow_increment.max(needed);
        let new_capacity = {
            let state = self.state.lock();
            state.capacity + increment
        };

        if let Some(limit) = self.state.lock().limit {
            if new_capacity > limit {
                return Ok(false);
            }
        }

        {
            let guard = file.lock().await;
            guard.set_len(new_capacity * SECTOR_SIZE).await?;
        }

        let mut state = self.state.lock();
        state.capacity = new_capacity;
        if state.low_space && state.capacity - state.filled >= self.grow_increment.max(1) {
            state.low_space = false;
        }
        Ok(true)
    }

    /// Cap further growth at `limit` sectors. Used to bound a snapshot's
    /// diff storage by operator policy.
    pub fn set_limit(&self, limit: Sector) {
        self.state.lock().limit = Some(limit);
    }

    /// Spawn the background worker that grows a file backing proactively
    /// once the low-space watermark latches, rather than only reacting to
    /// it inline the next time `alloc` happens to need more room
    /// (`spec.md` §4.3, "Reallocate worker"). A no-op for a block-device
    /// backing, which is never grown.
    pub fn spawn_reallocate_worker(self: &Arc<Self>) {
        if matches!(&*self.backing, StorageBacking::BlockDevice(_)) {
            return;
        }
        let storage = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                storage.low_space_notify.notified().await;
                if let StorageBacking::File(file) = &*storage.backing {
                    let _ = storage.grow_file(file, storage.grow_increment).await;
                }
            }
        });
        *self.worker.lock() = Some(handle);
    }

    /// Stop the reallocate worker. Called once a snapshot owning this
    /// storage is destroyed; a no-op if none was ever spawned.
    pub fn shutdown(&self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }

    /// Write `data` to the allocated location.
    pub async fn write(&self, location: &StorageLocation, data: &[u8]) -> Result<()> {
        match &*location.backing {
            StorageBacking::File(file) => {
                let offset = location.offset * SECTOR_SIZE;
                let mut guard = file.lock().await;
                guard.seek(SeekFrom::Start(offset)).await?;
                guard.write_all(data).await?;
                Ok(())
            }
            StorageBacking::BlockDevice(device) => {
                device.write_at(location.offset, data).await?;
                Ok(())
            }
        }
    }

    /// Read back a previously written chunk.
    pub async fn read(&self, location: &StorageLocation, buf: &mut [u8]) -> Result<()> {
        match &*location.backing {
            StorageBacking::File(file) => {
                use tokio::io::AsyncReadExt;
                let offset = location.offset * SECTOR_SIZE;
                let mut guard = file.lock().await;
                guard.seek(SeekFrom::Start(offset)).await?;
                guard.read_exact(buf).await?;
                Ok(())
            }
            StorageBacking::BlockDevice(device) => {
                device.read_at(location.offset, buf).await?;
                Ok(())
            }
        }
    }
}
