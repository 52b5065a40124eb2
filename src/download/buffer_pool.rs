//! Reusable prefetch buffers
//!
//! Reduces allocations by reusing byte buffers across range readers.

use bytes::BytesMut;
use parking_lot::Mutex;

/// Allocator for prefetch buffers, shared by every reader of a downloader
pub trait BufferPool: Send + Sync {
    /// A cleared buffer with at least `size` bytes of capacity
    fn acquire(&self, size: usize) -> BytesMut;

    /// Return a buffer for reuse
    fn release(&self, buffer: BytesMut);
}

/// Thread-safe buffer pool keeping at most `max_buffers` idle buffers
#[derive(Debug)]
pub struct SharedBufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    max_buffers: usize,
}

impl SharedBufferPool {
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
        }
    }

    /// Idle buffers currently held
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl BufferPool for SharedBufferPool {
    fn acquire(&self, size: usize) -> BytesMut {
        let mut buffer = self
            .buffers
            .lock()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(size));
        if buffer.capacity() < size {
            buffer.reserve(size);
        }
        buffer
    }

    fn release(&self, mut buffer: BytesMut) {
        buffer.clear();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
        // Otherwise, buffer is dropped
    }
}
