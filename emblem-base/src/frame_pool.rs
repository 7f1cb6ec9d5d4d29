use crossbeam_channel::{Receiver, Sender};

const DEFAULT_POOL_SIZE: usize = 16;
// 1024x1024 RGBA
const DEFAULT_MAX_BUFFER_CAPACITY: usize = 4 * 1024 * 1024;

/// Recycles pixel scratch buffers between decode workers and the surface-owning thread.
/// Decode workers and the blit path both churn through short-lived frame-sized buffers,
/// this keeps them out of the allocator. Backed by a bounded channel so producer and
/// consumer can touch it concurrently without a lock.
#[derive(Clone)]
pub struct FramePool {
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
    max_buffer_capacity: usize,
}

impl FramePool {
    /// `pool_size` bounds how many buffers are kept around, `max_buffer_capacity` is the
    /// largest buffer worth recycling. Both are tunables, not contracts.
    pub fn new(
        pool_size: usize,
        max_buffer_capacity: usize,
    ) -> Self {
        let (free_tx, free_rx) = crossbeam_channel::bounded(pool_size);
        FramePool {
            free_tx,
            free_rx,
            max_buffer_capacity,
        }
    }

    /// A zeroed buffer of exactly `len` bytes, recycled if one is available.
    pub fn take(
        &self,
        len: usize,
    ) -> Vec<u8> {
        match self.free_rx.try_recv() {
            Ok(mut buffer) => {
                buffer.clear();
                buffer.resize(len, 0);
                buffer
            }
            Err(_) => vec![0; len],
        }
    }

    /// Hand a buffer back for reuse. Oversized buffers and overflow beyond the pool
    /// bound are simply dropped.
    pub fn put(
        &self,
        buffer: Vec<u8>,
    ) {
        if buffer.capacity() > self.max_buffer_capacity {
            return;
        }
        let _ = self.free_tx.try_send(buffer);
    }

    pub fn pooled_count(&self) -> usize {
        self.free_rx.len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        FramePool::new(DEFAULT_POOL_SIZE, DEFAULT_MAX_BUFFER_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn take_reuses_returned_buffers() {
        let pool = FramePool::new(4, 1024);

        let mut buffer = pool.take(16);
        buffer[0] = 0xff;
        let capacity = buffer.capacity();
        pool.put(buffer);
        assert_eq!(pool.pooled_count(), 1);

        // recycled and zeroed
        let buffer = pool.take(8);
        assert_eq!(pool.pooled_count(), 0);
        assert!(buffer.capacity() >= capacity.min(8));
        assert!(buffer.iter().all(|&b| b == 0));
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn oversized_buffers_are_not_kept() {
        let pool = FramePool::new(4, 16);
        pool.put(vec![0; 64]);
        assert_eq!(pool.pooled_count(), 0);
    }

    #[test]
    fn pool_bound_is_respected() {
        let pool = FramePool::new(2, 1024);
        pool.put(vec![0; 8]);
        pool.put(vec![0; 8]);
        pool.put(vec![0; 8]);
        assert_eq!(pool.pooled_count(), 2);
    }
}
