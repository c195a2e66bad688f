//! Size-classed buffer pool backing packets and receive buffers.
//!
//! Every buffer rented from the pool is returned exactly once: the
//! [`PooledBuf`] guard gives the buffer back when it is dropped, no matter
//! which code path finishes with it.

use std::sync::{Arc, Mutex};

/// Capacity of each size class, smallest first.
const CLASS_SIZES: [usize; 5] = [64, 256, 1024, 4096, 16384];

/// Maximum number of idle buffers retained per class.
const MAX_IDLE_PER_CLASS: usize = 64;

/// A pool of reusable byte buffers grouped by capacity.
pub struct BufferPool {
    classes: [Mutex<Vec<Vec<u8>>>; CLASS_SIZES.len()],
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            classes: Default::default(),
        })
    }

    /// Rents a zero-length buffer with capacity for at least `min_capacity`
    /// bytes.
    pub fn rent(self: &Arc<Self>, min_capacity: usize) -> PooledBuf {
        let class = Self::class_for(min_capacity);
        let mut buf = match class {
            Some(idx) => self.classes[idx]
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Vec::with_capacity(CLASS_SIZES[idx])),
            // Larger than the biggest class: allocate exactly, recycle later
            // into whatever class fits.
            None => Vec::with_capacity(min_capacity),
        };
        buf.clear();
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn class_for(capacity: usize) -> Option<usize> {
        CLASS_SIZES.iter().position(|&size| capacity <= size)
    }

    fn give_back(&self, buf: Vec<u8>) {
        // File under the largest class the capacity still satisfies.
        let idx = match CLASS_SIZES.iter().rposition(|&size| buf.capacity() >= size) {
            Some(idx) => idx,
            None => return,
        };
        let mut idle = self.classes[idx].lock().unwrap();
        if idle.len() < MAX_IDLE_PER_CLASS {
            idle.push(buf);
        }
    }

    #[cfg(test)]
    fn idle_count(&self) -> usize {
        self.classes.iter().map(|c| c.lock().unwrap().len()).sum()
    }
}

/// A rented buffer that returns itself to its pool on drop.
pub struct PooledBuf {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuf {
    #[inline]
    pub fn get(&self) -> &Vec<u8> {
        self.buf.as_ref().unwrap()
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut Vec<u8> {
        self.buf.as_mut().unwrap()
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(buf);
        }
    }
}
