//! Free-buffer pool for chunk-sized diff buffers.
//!
//! Grounded on `examples/original_source/module/diff_buffer.c`'s free list:
//! take from the head, release to the tail only while under the configured
//! cap, otherwise drop the buffer for the allocator to reclaim.

use parking_lot::Mutex;

use crate::chunk::DiffBuffer;

pub struct BufferPool {
    chunk_bytes: usize,
    capacity: usize,
    free: Mutex<Vec<DiffBuffer>>,
}

impl BufferPool {
    pub fn new(chunk_bytes: usize, capacity: usize) -> Self {
        Self {
            chunk_bytes,
            capacity,
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
        }
    }

    /// Take a buffer from the pool, allocating a fresh zeroed one on miss.
    pub fn take(&self) -> DiffBuffer {
        if let Some(buf) = self.free.lock().pop() {
            buf
        } else {
            vec![0u8; self.chunk_bytes].into_boxed_slice()
        }
    }

    /// Return a buffer to the pool, if there's room for it.
    pub fn release(&self, buf: DiffBuffer) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buf);
        }
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_on_empty_pool_allocates_zeroed_buffer() {
        let pool = BufferPool::new(4096, 4);
        let buf = pool.take();
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn released_buffer_is_reused() {
        let pool = BufferPool::new(4096, 4);
        let mut buf = pool.take();
        buf[0] = 0xFF;
        pool.release(buf);
        assert_eq!(pool.len(), 1);

        let reused = pool.take();
        assert_eq!(reused[0], 0xFF);
        assert!(pool.is_empty());
    }

    #[test]
    fn pool_drops_buffers_past_capacity() {
        let pool = BufferPool::new(16, 2);
        pool.release(pool.take());
        pool.release(pool.take());
        pool.release(pool.take());
        assert_eq!(pool.len(), 2);
    }
}
