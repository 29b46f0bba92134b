//! Fixed-size page buffers for bulk transfers.
//!
//! Page reads happen on every READPAGE, so buffers are recycled through a
//! bounded pool instead of being allocated per request. A [`PageBuffer`]
//! goes back to the pool when dropped, which makes release-on-every-path a
//! property of ownership rather than of each error branch.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};

/// Page size used for directory page reads and bulk transfers.
pub const PAGE_SIZE: usize = 4096;

/// Statistics for the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Buffers ever allocated by this pool.
    pub total_allocated: usize,
    /// Buffers sitting idle in the pool.
    pub available: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
    /// Number of checkouts.
    pub acquired: u64,
    /// Number of returns.
    pub released: u64,
}

/// Bounded pool of page-sized buffers.
pub struct BufferPool {
    buffer_size: usize,
    max_count: usize,
    buffers: Mutex<VecDeque<Vec<u8>>>,
    total_allocated: AtomicUsize,
    in_use: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl BufferPool {
    /// Creates a pool of `max_count` buffers of `PAGE_SIZE` bytes.
    pub fn new(max_count: usize) -> Arc<Self> {
        Self::with_buffer_size(PAGE_SIZE, max_count)
    }

    /// Creates a pool with a custom buffer size.
    pub fn with_buffer_size(buffer_size: usize, max_count: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            buffer_size,
            max_count,
            buffers: Mutex::new(VecDeque::new()),
            total_allocated: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Checks out a zeroed buffer, allocating up to the pool limit.
    pub fn acquire(self: &Arc<Self>) -> Result<PageBuffer> {
        let recycled = self
            .buffers
            .lock()
            .map_err(|_| TransportError::TransportFailure {
                reason: "buffer pool lock poisoned".to_string(),
            })?
            .pop_front();

        let buf = match recycled {
            Some(buf) => buf,
            None => {
                let reserved = self
                    .total_allocated
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < self.max_count).then_some(n + 1)
                    });
                if reserved.is_err() {
                    return Err(TransportError::PoolExhausted {
                        max_count: self.max_count,
                    });
                }
                vec![0u8; self.buffer_size]
            }
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(PageBuffer {
            buf: Some(buf),
            len: 0,
            pool: Arc::clone(self),
        })
    }

    fn release(&self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(self.buffer_size, 0);
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.push_back(buf);
        }
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    /// Current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let available = self.buffers.lock().map(|b| b.len()).unwrap_or(0);
        BufferPoolStats {
            total_allocated: self.total_allocated.load(Ordering::SeqCst),
            available,
            in_use: self.in_use.load(Ordering::SeqCst),
            acquired: self.acquired.load(Ordering::SeqCst),
            released: self.released.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A buffer checked out of a [`BufferPool`]; returned on drop.
pub struct PageBuffer {
    buf: Option<Vec<u8>>,
    len: usize,
    pool: Arc<BufferPool>,
}

impl PageBuffer {
    /// Sets the number of valid bytes, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.capacity());
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if no bytes are valid.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer capacity (the page size).
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// The whole page, for filling.
    pub fn page_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..],
            None => &mut [],
        }
    }
}

impl Drop for PageBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl Deref for PageBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PageBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let len = self.len;
        match &mut self.buf {
            Some(buf) => &mut buf[..len],
            None => &mut [],
        }
    }
}

impl std::fmt::Debug for PageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let pool = BufferPool::new(2);
        let mut buf = pool.acquire().unwrap();
        assert_eq!(buf.capacity(), PAGE_SIZE);
        assert!(buf.is_empty());

        buf.page_mut()[..5].copy_from_slice(b"hello");
        buf.set_len(5);
        assert_eq!(&buf[..], b"hello");

        drop(buf);
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.released, 1);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = BufferPool::new(1);
        let held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, TransportError::PoolExhausted { max_count: 1 }));
        drop(held);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_recycled_buffer_is_zeroed() {
        let pool = BufferPool::new(1);
        let mut buf = pool.acquire().unwrap();
        buf.page_mut().fill(0xAB);
        drop(buf);

        let mut again = pool.acquire().unwrap();
        assert!(again.page_mut().iter().all(|&b| b == 0));
        assert_eq!(pool.stats().total_allocated, 1);
    }

    #[test]
    fn test_set_len_clamped() {
        let pool = BufferPool::with_buffer_size(16, 1);
        let mut buf = pool.acquire().unwrap();
        buf.set_len(100);
        assert_eq!(buf.len(), 16);
    }
}
