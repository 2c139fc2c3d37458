// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Payload buffer pool.
//!
//! Buffers are rented for exactly the payload length of a frame and come
//! back to the pool when the [`PooledBuffer`] owning them is dropped. A
//! buffer converted into [`Bytes`] returns when the last clone is dropped.
//! An empty pool never blocks: it allocates. Buffers grown past the
//! retention limit are freed instead of kept idle.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::frame::DEFAULT_MESSAGE_SIZE_WARNING;

/// Default number of idle buffers retained by a pool.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

/// Default capacity above which a returned buffer is freed.
pub const DEFAULT_MAX_RETAINED_BYTES: usize = DEFAULT_MESSAGE_SIZE_WARNING;

/// Counters describing buffer traffic through a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers handed out by `rent`
    pub rented: u64,
    /// Buffers given back on drop
    pub returned: u64,
    /// Rentals that had to allocate because no idle buffer was available
    pub allocated: u64,
    /// Returned buffers freed for exceeding the retention limit
    pub discarded: u64,
}

impl PoolStats {
    /// Buffers currently rented and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.rented.saturating_sub(self.returned)
    }
}

struct PoolInner {
    idle: Mutex<Vec<Vec<u8>>>,
    capacity: usize,
    max_retained: usize,
    rented: AtomicU64,
    returned: AtomicU64,
    allocated: AtomicU64,
    discarded: AtomicU64,
}

impl PoolInner {
    fn give_back(&self, mut buf: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::AcqRel);
        if buf.capacity() > self.max_retained {
            self.discarded.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.capacity {
            buf.clear();
            idle.push(buf);
        }
    }
}

/// Shared pool of payload buffers. Cloning shares the same pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool retaining at most `capacity` idle buffers.
    pub fn new(capacity: usize) -> Self {
        Self::with_max_retained(capacity, DEFAULT_MAX_RETAINED_BYTES)
    }

    /// Create a pool that also frees returned buffers whose capacity
    /// exceeds `max_retained` bytes.
    pub fn with_max_retained(capacity: usize, max_retained: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                max_retained,
                rented: AtomicU64::new(0),
                returned: AtomicU64::new(0),
                allocated: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Rent a zero-filled buffer of exactly `len` bytes.
    pub fn rent(&self, len: usize) -> PooledBuffer {
        self.inner.rented.fetch_add(1, Ordering::AcqRel);
        let recycled = self.inner.idle.lock().pop();
        let mut buf = match recycled {
            Some(buf) => buf,
            None => {
                self.inner.allocated.fetch_add(1, Ordering::AcqRel);
                Vec::with_capacity(len)
            }
        };
        buf.resize(len, 0);
        PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.inner.rented.load(Ordering::Acquire),
            returned: self.inner.returned.load(Ordering::Acquire),
            allocated: self.inner.allocated.load(Ordering::Acquire),
            discarded: self.inner.discarded.load(Ordering::Acquire),
        }
    }

    /// Number of idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.inner.capacity)
            .field("max_retained", &self.inner.max_retained)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A rented buffer with a single owner.
///
/// Dropping it returns the storage to its pool. Since `Drop` runs once per
/// value, a buffer can never be returned twice.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl PooledBuffer {
    /// Convert into a shared, zero-copy [`Bytes`]. The buffer goes back to
    /// the pool when the last clone of the returned value is dropped.
    pub fn into_bytes(self) -> Bytes {
        Bytes::from_owner(self)
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buf.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buf));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rent_exact_length() {
        let pool = BufferPool::new(4);
        let buf = pool.rent(17);
        assert_eq!(buf.len(), 17);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_drop_returns_once() {
        let pool = BufferPool::new(4);
        let buf = pool.rent(8);
        assert_eq!(pool.stats().outstanding(), 1);
        drop(buf);

        let stats = pool.stats();
        assert_eq!(stats.rented, 1);
        assert_eq!(stats.returned, 1);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn test_recycled_buffer_is_zeroed() {
        let pool = BufferPool::new(4);
        let mut buf = pool.rent(4);
        buf.copy_from_slice(b"dirt");
        drop(buf);

        let buf = pool.rent(6);
        assert_eq!(&buf[..], &[0u8; 6]);
        assert_eq!(pool.stats().allocated, 1);
    }

    #[test]
    fn test_exhausted_pool_allocates() {
        let pool = BufferPool::new(1);
        let a = pool.rent(1);
        let b = pool.rent(1);
        assert_eq!(pool.stats().allocated, 2);
        drop(a);
        drop(b);
        // Only one idle slot, the second buffer is discarded
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().returned, 2);
    }

    #[test]
    fn test_oversized_buffer_not_retained() {
        let pool = BufferPool::with_max_retained(4, 64);
        drop(pool.rent(32));
        assert_eq!(pool.idle(), 1);

        // The recycled buffer grows past the limit and is freed on return
        drop(pool.rent(1024));
        let stats = pool.stats();
        assert_eq!(pool.idle(), 0);
        assert_eq!(stats.returned, 2);
        assert_eq!(stats.discarded, 1);

        drop(pool.rent(16));
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.stats().allocated, 2);
    }

    #[test]
    fn test_bytes_return_on_last_clone() {
        let pool = BufferPool::new(4);
        let mut buf = pool.rent(3);
        buf.copy_from_slice(b"abc");
        let bytes = buf.into_bytes();
        let clone = bytes.slice(1..);
        drop(bytes);
        assert_eq!(pool.stats().returned, 0);
        assert_eq!(&clone[..], b"bc");
        drop(clone);
        assert_eq!(pool.stats().returned, 1);
    }
}
