// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Thread-safe reuse of command payload buffers
//!
//! The receive loop allocates one payload buffer per inbound command. To
//! avoid per-message heap churn, buffers come from a bounded freelist and
//! return to it once the command's last payload reference drops
//! ([bytes::Bytes::try_into_mut] succeeds only for unique references, so a
//! buffer still referenced by an in-flight command is never recycled).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::{Bytes, BytesMut};

/// Upper bound of retained free buffers
const MAX_FREE: usize = 64;

/// A freelist of reusable payload buffers
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a cleared buffer with at least `capacity` bytes of room,
    /// reusing a free one when possible
    pub fn alloc(&self, capacity: usize) -> BytesMut {
        let mut free = self.free.lock().expect("BufferPool lock poisoned");
        if let Some(position) = free.iter().position(|buf| buf.capacity() >= capacity) {
            let mut buf = free.swap_remove(position);
            buf.clear();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        drop(free);
        self.misses.fetch_add(1, Ordering::Relaxed);
        BytesMut::with_capacity(capacity)
    }

    /// Return a payload to the pool
    ///
    /// Returns [true] if the buffer was reclaimed, [false] if other
    /// references to it are still live (in which case the allocator frees it
    /// once they drop).
    pub fn release(&self, payload: Bytes) -> bool {
        match payload.try_into_mut() {
            Ok(buf) => {
                let mut free = self.free.lock().expect("BufferPool lock poisoned");
                if free.len() < MAX_FREE {
                    free.push(buf);
                }
                true
            }
            Err(_still_shared) => false,
        }
    }

    /// (hits, misses) counters for instrumentation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_released_buffers() {
        let pool = BufferPool::new();
        let mut buf = pool.alloc(128);
        buf.extend_from_slice(b"payload");
        let payload = buf.freeze();
        assert!(pool.release(payload));

        let _again = pool.alloc(64);
        let (hits, misses) = pool.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
    }

    #[test]
    fn shared_payloads_are_not_reclaimed() {
        let pool = BufferPool::new();
        let mut buf = pool.alloc(16);
        buf.extend_from_slice(b"shared");
        let payload = buf.freeze();
        let clone = payload.clone();
        assert!(!pool.release(payload));
        drop(clone);
    }
}
