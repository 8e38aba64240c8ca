//! Store-queue worker: flushes `IN_MEMORY` chunks out to diff storage.
//!
//! Grounded on `examples/original_source/module/diff_area.c`'s
//! `diff_area_storing_chunk` work item, with the kernel work queue replaced
//! by a `tokio::task` woken through `Notify` and a `VecDeque` standing in
//! for the spinlock-protected list.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::chunk::Chunk;
use crate::diff_area::DiffArea;

/// FIFO of chunks awaiting a flush to diff storage, plus the reentrancy
/// flag the kernel module calls `store_queue_processing`.
pub struct StoreQueue {
    pending: Mutex<VecDeque<Arc<Chunk>>>,
    notify: Notify,
    processing: AtomicBool,
    /// Queued plus currently-being-stored chunks; used by callers that
    /// need to know the queue has truly drained, not just emptied.
    outstanding: AtomicUsize,
    /// `chunk_maximum_in_queue` from `spec.md` §4.2: `push` blocks once
    /// the queue holds this many chunks, rather than growing unbounded
    /// under a writer that outruns the store worker.
    capacity: usize,
    space: Notify,
}

impl StoreQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            processing: AtomicBool::new(false),
            outstanding: AtomicUsize::new(0),
            capacity,
            space: Notify::new(),
        }
    }

    /// Append a chunk and wake the worker, waiting for room first if the
    /// queue is at `capacity`.
    pub async fn push(&self, chunk: Arc<Chunk>) {
        loop {
            {
                let mut pending = self.pending.lock();
                if pending.len() < self.capacity {
                    pending.push_back(chunk);
                    break;
                }
            }
            self.space.notified().await;
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_one();
    }

    /// Re-queue a chunk the worker itself popped but couldn't store yet
    /// (a contended lock). Bypasses the capacity wait `push` applies to
    /// producers: the worker is the only consumer, so blocking it here on
    /// its own backlog would deadlock the drain loop.
    pub(crate) fn requeue(&self, chunk: Arc<Chunk>) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().push_back(chunk);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Arc<Chunk>> {
        let chunk = self.pending.lock().pop_front();
        if chunk.is_some() {
            self.space.notify_one();
        }
        chunk
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Queued plus in-flight chunks.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Spawn the background worker that drains this queue into `area`,
    /// flushing each `IN_MEMORY` chunk per `spec.md` §4.2. The worker
    /// holds only a weak reference to the diff area so it never keeps it
    /// alive on its own.
    pub fn spawn_worker(queue: Arc<StoreQueue>, area: Weak<DiffArea>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                queue.processing.store(true, Ordering::Release);

                while let Some(chunk) = queue.pop() {
                    let Some(area) = area.upgrade() else {
                        queue.processing.store(false, Ordering::Release);
                        return;
                    };
                    area.store_chunk(&chunk).await;
                    queue.outstanding.fetch_sub(1, Ordering::AcqRel);
                }

                queue.processing.store(false, Ordering::Release);

                if area.upgrade().is_none() {
                    return;
                }
                queue.notify.notified().await;
            }
        })
    }
}
