//! Diff area: chunk map and copy-on-write orchestration for one snapshot.
//!
//! Grounded on `examples/original_source/module/diff_area.c` and
//! `diff_area.h`. The concurrent chunk map uses `dashmap` in place of the
//! kernel's RCU-protected red-black tree (`spec.md` §4.2, "Chunk-map").

pub mod buffer_pool;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::blockdev::{BlockDevice, Sector, SectorRange, SECTOR_SHIFT};
use crate::chunk::{Chunk, ChunkError, ChunkState};
use crate::config::SnapshotEngineConfig;
use crate::diff_storage::{DiffStorage, StorageLocation};
use crate::event::{Event, EventQueue};

pub use buffer_pool::BufferPool;
pub use queue::StoreQueue;

/// The overlap between a bio's sector range and one covered chunk.
struct ChunkSpan {
    number: u64,
    /// Sector offset of the overlap, relative to the start of the chunk.
    chunk_sector_offset: Sector,
    /// Number of sectors in the overlap.
    sector_count: Sector,
    /// Byte offset of the overlap within the caller's buffer.
    buffer_byte_offset: usize,
}

/// Owns every chunk belonging to one snapshot's diff area and orchestrates
/// the COW and snapshot-image read/write paths.
pub struct DiffArea {
    chunk_shift: u32,
    chunk_sectors: Sector,
    original: Arc<dyn BlockDevice>,
    diff_storage: Arc<DiffStorage>,
    buffer_pool: Arc<BufferPool>,
    store_queue: Arc<StoreQueue>,
    events: Arc<EventQueue>,
    chunks: DashMap<u64, Arc<Chunk>>,
    corrupted: AtomicBool,
    corruption_reason: Mutex<Option<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DiffArea {
    pub fn new(
        original: Arc<dyn BlockDevice>,
        diff_storage: Arc<DiffStorage>,
        events: Arc<EventQueue>,
        config: &SnapshotEngineConfig,
    ) -> Arc<Self> {
        let chunk_shift = optimal_chunk_shift(original.capacity_sectors(), config);
        let chunk_sectors: Sector = 1 << (chunk_shift - SECTOR_SHIFT);
        let chunk_bytes = chunk_sectors as usize * crate::blockdev::SECTOR_SIZE as usize;

        let area = Arc::new(Self {
            chunk_shift,
            chunk_sectors,
            original,
            diff_storage,
            buffer_pool: Arc::new(BufferPool::new(chunk_bytes, config.free_diff_buffer_pool_size)),
            store_queue: Arc::new(StoreQueue::new(config.chunk_maximum_in_queue)),
            events,
            chunks: DashMap::new(),
            corrupted: AtomicBool::new(false),
            corruption_reason: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let handle = StoreQueue::spawn_worker(area.store_queue.clone(), Arc::downgrade(&area));
        *area.worker.lock() = Some(handle);
        area
    }

    pub fn chunk_shift(&self) -> u32 {
        self.chunk_shift
    }

    pub fn chunk_sectors(&self) -> Sector {
        self.chunk_sectors
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::Acquire)
    }

    /// Latch the corrupted flag and emit a `corrupted` event exactly once.
    pub fn set_corrupted(&self, reason: String) {
        if self
            .corrupted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            log::error!("diff area corrupted: {}", reason);
            *self.corruption_reason.lock() = Some(reason.clone());
            self.events.push(Event::Corrupted(reason));
        }
    }

    fn chunk_start_sector(&self, number: u64) -> Sector {
        number * self.chunk_sectors
    }

    /// A chunk's sector count equals the chunk size, except the final
    /// chunk of a device whose capacity isn't an exact multiple of it,
    /// which is truncated (`spec.md` §3, "Chunk").
    fn chunk_sector_count_for(&self, number: u64) -> Sector {
        let start = self.chunk_start_sector(number);
        let capacity = self.original.capacity_sectors();
        self.chunk_sectors.min(capacity.saturating_sub(start))
    }

    fn spans(&self, range: SectorRange) -> Vec<ChunkSpan> {
        let first = range.start / self.chunk_sectors;
        let last = (range.end() - 1) / self.chunk_sectors;
        let mut spans = Vec::with_capacity((last - first + 1) as usize);

        for number in first..=last {
            let chunk_start = self.chunk_start_sector(number);
            let chunk_end = chunk_start + self.chunk_sector_count_for(number);
            let overlap_start = range.start.max(chunk_start);
            let overlap_end = range.end().min(chunk_end);
            spans.push(ChunkSpan {
                number,
                chunk_sector_offset: overlap_start - chunk_start,
                sector_count: overlap_end - overlap_start,
                buffer_byte_offset: ((overlap_start - range.start) * crate::blockdev::SECTOR_SIZE) as usize,
            });
        }
        spans
    }

    /// Look up a chunk, or lazily insert a freshly allocated one. On a
    /// concurrent race, the loser's allocation is simply dropped and the
    /// winner's entry returned (`spec.md` §4.2, "Chunk-map").
    fn get_or_insert_chunk(self: &Arc<Self>, number: u64) -> Arc<Chunk> {
        if let Some(existing) = self.chunks.get(&number) {
            return existing.clone();
        }
        let candidate = Arc::new(Chunk::new(
            Arc::downgrade(self),
            number,
            self.chunk_sector_count_for(number),
        ));
        self.chunks.entry(number).or_insert(candidate).clone()
    }

    /// Ensure every chunk overlapped by `range` has its pre-write contents
    /// preserved before the caller's write reaches the original device.
    /// With `nowait`, returns [`ChunkError::WouldBlock`] immediately on the
    /// first contended chunk lock instead of suspending.
    pub async fn cow_for(self: &Arc<Self>, range: SectorRange, nowait: bool) -> crate::chunk::Result<()> {
        for span in self.spans(range) {
            let chunk = self.get_or_insert_chunk(span.number);
            let mut guard = if nowait {
                chunk.try_lock()?
            } else {
                chunk.lock().await
            };

            if guard.state() != ChunkState::New {
                continue;
            }

            let mut buf = self.buffer_pool.take();
            let start = self.chunk_start_sector(span.number);
            let valid = chunk.sector_count as usize * crate::blockdev::SECTOR_SIZE as usize;
            match self.original.read_at(start, &mut buf[..valid]).await {
                Ok(()) => {
                    guard.diff_buffer = Some(buf);
                    guard.state = Some(ChunkState::InMemory);
                    drop(guard);
                    self.store_queue.push(chunk).await;
                }
                Err(e) => {
                    chunk.fail_locked(&mut guard, ChunkError::BlockDevice(e));
                }
            }
        }
        Ok(())
    }

    /// Flush one `IN_MEMORY` chunk to diff storage. Invoked by the store
    /// queue worker; also callable directly in tests.
    pub(crate) async fn store_chunk(self: &Arc<Self>, chunk: &Arc<Chunk>) {
        let mut guard = match chunk.try_lock() {
            Ok(g) => g,
            Err(_) => {
                // Lock is held by a concurrent reader/writer; retry later
                // rather than block the worker (`spec.md` §4.2 step 1).
                self.store_queue.requeue(chunk.clone());
                return;
            }
        };

        match guard.state() {
            ChunkState::InMemory => {}
            ChunkState::Failed => return,
            other => {
                log::warn!("chunk {} in unexpected state {:?} during store", chunk.number, other);
                return;
            }
        }

        if self.is_corrupted() {
            chunk.fail_locked(&mut guard, ChunkError::Failed);
            return;
        }

        // Extents are always full-chunk-sized so diff storage stays
        // aligned to the chunk size even for a truncated final chunk.
        let location = match self.diff_storage.alloc(self.chunk_sectors).await {
            Ok(loc) => loc,
            Err(_) => {
                self.events.push(Event::Overflow);
                self.set_corrupted("diff storage exhausted".into());
                chunk.fail_locked(&mut guard, ChunkError::NoSpace);
                return;
            }
        };

        let buf = guard
            .diff_buffer
            .take()
            .expect("IN_MEMORY chunk always carries a buffer");

        match self.diff_storage.write(&location, &buf).await {
            Ok(()) => {
                self.buffer_pool.release(buf);
                guard.location = Some(location);
                guard.state = Some(ChunkState::Stored);
            }
            Err(e) => {
                log::error!("chunk {} store failed: {}", chunk.number, e);
                self.set_corrupted(e.to_string());
                chunk.fail_locked(&mut guard, ChunkError::Failed);
            }
        }
    }

    /// Read-path for the snapshot image. Absent chunks read through to the
    /// original (`spec.md` §4.6).
    pub async fn submit_image_read(&self, range: SectorRange, buf: &mut [u8]) -> crate::chunk::Result<()> {
        for span in self.spans(range) {
            let dest = &mut buf[span.buffer_byte_offset..span.buffer_byte_offset + span.byte_len()];
            let Some(chunk) = self.chunks.get(&span.number).map(|c| c.clone()) else {
                self.read_through(span.absolute_start(self), span.sector_count, dest).await?;
                continue;
            };

            let guard = chunk.lock().await;
            match guard.state() {
                ChunkState::New => {
                    drop(guard);
                    self.read_through(span.absolute_start(self), span.sector_count, dest).await?;
                }
                ChunkState::InMemory => {
                    let source = guard.diff_buffer.as_ref().expect("IN_MEMORY chunk has a buffer");
                    let start = span.chunk_sector_offset as usize * crate::blockdev::SECTOR_SIZE as usize;
                    dest.copy_from_slice(&source[start..start + dest.len()]);
                }
                ChunkState::Stored => {
                    let location = guard.location.clone().expect("STORED chunk has a location");
                    drop(guard);
                    let sub = sub_location(&location, span.chunk_sector_offset);
                    self.diff_storage.read(&sub, dest).await.map_err(|_| ChunkError::Failed)?;
                }
                ChunkState::Failed => return Err(ChunkError::Failed),
            }
        }
        Ok(())
    }

    /// Write-path for the snapshot image. Always terminates in a chunk's
    /// buffer or diff-storage extent; the original is never touched.
    pub async fn submit_image_write(self: &Arc<Self>, range: SectorRange, data: &[u8]) -> crate::chunk::Result<()> {
        for span in self.spans(range) {
            let source = &data[span.buffer_byte_offset..span.buffer_byte_offset + span.byte_len()];
            let chunk = self.get_or_insert_chunk(span.number);
            let mut guard = chunk.lock().await;

            match guard.state() {
                ChunkState::New => {
                    let mut buf = self.buffer_pool.take();
                    let start = self.chunk_start_sector(span.number);
                    let valid = chunk.sector_count as usize * crate::blockdev::SECTOR_SIZE as usize;
                    self.original.read_at(start, &mut buf[..valid]).await.map_err(ChunkError::BlockDevice)?;
                    let offset = span.chunk_sector_offset as usize * crate::blockdev::SECTOR_SIZE as usize;
                    buf[offset..offset + source.len()].copy_from_slice(source);
                    guard.diff_buffer = Some(buf);
                    guard.state = Some(ChunkState::InMemory);
                    drop(guard);
                    self.store_queue.push(chunk).await;
                }
                ChunkState::InMemory => {
                    let offset = span.chunk_sector_offset as usize * crate::blockdev::SECTOR_SIZE as usize;
                    let buffer = guard.diff_buffer.as_mut().expect("IN_MEMORY chunk has a buffer");
                    buffer[offset..offset + source.len()].copy_from_slice(source);
                }
                ChunkState::Stored => {
                    let location = guard.location.clone().expect("STORED chunk has a location");
                    let sub = sub_location(&location, span.chunk_sector_offset);
                    drop(guard);
                    self.diff_storage.write(&sub, source).await.map_err(|_| ChunkError::Failed)?;
                }
                ChunkState::Failed => return Err(ChunkError::Failed),
            }
        }
        Ok(())
    }

    async fn read_through(&self, start: Sector, count: Sector, dest: &mut [u8]) -> crate::chunk::Result<()> {
        let _ = count;
        self.original.read_at(start, dest).await.map_err(ChunkError::BlockDevice)
    }

    /// Wait for the store queue to fully drain without stopping the
    /// worker. Useful in tests that need every pending chunk flushed
    /// before inspecting state.
    pub async fn drain(&self) {
        while self.store_queue.outstanding() > 0 {
            tokio::task::yield_now().await;
        }
    }

    /// Drain the store queue, then stop the worker. Used when tearing down
    /// a diff area so no chunk is left half-flushed. Rust has no async
    /// `Drop`, so this must be called explicitly before the last
    /// `Arc<DiffArea>` is released.
    pub async fn flush_and_shutdown(&self) {
        self.drain().await;
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

impl ChunkSpan {
    fn byte_len(&self) -> usize {
        self.sector_count as usize * crate::blockdev::SECTOR_SIZE as usize
    }

    fn absolute_start(&self, area: &DiffArea) -> Sector {
        area.chunk_start_sector(self.number) + self.chunk_sector_offset
    }
}

fn sub_location(location: &StorageLocation, chunk_sector_offset: Sector) -> StorageLocation {
    StorageLocation {
        backing: location.backing.clone(),
        offset: location.offset + chunk_sector_offset,
    }
}

/// Adaptive chunk-size selection. Grounded on
/// `examples/original_source/module/chunk.c`'s
/// `chunk_calculate_optimal_size_shift`: grow the shift until the chunk
/// count for the device fits under the configured ceiling.
pub fn optimal_chunk_shift(capacity_sectors: Sector, config: &SnapshotEngineConfig) -> u32 {
    let mut shift = config.chunk_minimum_shift;
    loop {
        let chunk_sectors: Sector = 1 << (shift - SECTOR_SHIFT);
        let count = (capacity_sectors + chunk_sectors - 1) / chunk_sectors;
        if count <= (1u64 << config.chunk_maximum_count_shift.min(63)) || shift >= config.chunk_maximum_shift {
            return shift;
        }
        shift += 1;
    }
}
