// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Bounded, pinnable cache of recently seen object version payloads
//!
//! Received and committed instance data is parked here keyed by
//! (object id, version), so late-joining slaves can be bootstrapped and
//! re-maps avoid re-transmission. Lookups pin an entry; a pinned entry is
//! never evicted or erased. Once the cumulative payload size exceeds the
//! configured maximum, unpinned entries are evicted in least-recently-used
//! order down to 80% of the maximum.
//!
//! The cache is internally locked: the receive loop inserts while consumer
//! tasks look up and release concurrently.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::concurrency::Instant;
use crate::node_id::ObjectId;

/// Cache key: one version of one object
pub type CacheKey = (ObjectId, u64);

/// Eviction leaves this fraction of the maximum in use
const EVICT_TARGET: f64 = 0.8;

#[derive(Debug)]
struct Entry {
    data: Bytes,
    pins: u32,
    last_use: Instant,
}

#[derive(Debug, Default)]
struct Items {
    map: HashMap<CacheKey, Entry>,
    total_size: u64,
}

/// A bounded store of serialized object versions
#[derive(Debug)]
pub struct InstanceCache {
    items: Mutex<Items>,
    max_size: u64,
}

impl InstanceCache {
    /// Create a cache bounded to `max_size` payload bytes
    pub fn new(max_size: u64) -> Self {
        Self {
            items: Mutex::new(Items::default()),
            max_size,
        }
    }

    /// Insert a payload if the key is absent
    ///
    /// Returns [false] if an identical key already exists (idempotent
    /// no-op), or if the cache is over budget with every entry pinned.
    pub fn add(&self, key: CacheKey, data: Bytes) -> bool {
        let mut items = self.items.lock().expect("InstanceCache lock poisoned");
        if items.map.contains_key(&key) {
            return false;
        }

        let incoming = data.len() as u64;
        if items.total_size + incoming > self.max_size {
            Self::evict(&mut items, self.max_size.saturating_sub(incoming));
            if items.total_size + incoming > self.max_size {
                // whatever is left is pinned; the caller re-fetches from the
                // master instead
                tracing::warn!(
                    "Overfull instance cache ({} entries pinned), rejecting insert",
                    items.map.len()
                );
                return false;
            }
        }

        items.total_size += incoming;
        items.map.insert(
            key,
            Entry {
                data,
                pins: 0,
                last_use: Instant::now(),
            },
        );
        true
    }

    /// Look up a payload, pinning the entry until [InstanceCache::release]
    pub fn pin(&self, key: &CacheKey) -> Option<Bytes> {
        let mut items = self.items.lock().expect("InstanceCache lock poisoned");
        let entry = items.map.get_mut(key)?;
        entry.pins += 1;
        entry.last_use = Instant::now();
        Some(entry.data.clone())
    }

    /// Drop one pin from an entry
    ///
    /// Returns [false] if the key is unknown or was not pinned.
    pub fn release(&self, key: &CacheKey) -> bool {
        let mut items = self.items.lock().expect("InstanceCache lock poisoned");
        match items.map.get_mut(key) {
            Some(entry) if entry.pins > 0 => {
                entry.pins -= 1;
                entry.last_use = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Remove an entry; fails while the entry is pinned — pinning is a hard
    /// exclusion, never silently overridden
    pub fn erase(&self, key: &CacheKey) -> bool {
        let mut items = self.items.lock().expect("InstanceCache lock poisoned");
        match items.map.get(key) {
            Some(entry) if entry.pins == 0 => {
                let size = entry.data.len() as u64;
                items.map.remove(key);
                items.total_size -= size;
                true
            }
            _ => false,
        }
    }

    /// The latest cached version of an object, if any
    pub fn latest_version(&self, id: ObjectId) -> Option<u64> {
        let items = self.items.lock().expect("InstanceCache lock poisoned");
        items
            .map
            .keys()
            .filter(|(object, _)| *object == id)
            .map(|(_, version)| *version)
            .max()
    }

    /// Current cumulative payload size in bytes
    pub fn size(&self) -> u64 {
        self.items
            .lock()
            .expect("InstanceCache lock poisoned")
            .total_size
    }

    fn evict(items: &mut Items, max_size: u64) {
        let target = (max_size as f64 * EVICT_TARGET) as u64;
        while items.total_size > target {
            let candidate = items
                .map
                .iter()
                .filter(|(_, entry)| entry.pins == 0)
                .min_by_key(|(_, entry)| entry.last_use)
                .map(|(key, _)| *key);
            match candidate {
                Some(key) => {
                    if let Some(entry) = items.map.remove(&key) {
                        items.total_size -= entry.data.len() as u64;
                        tracing::debug!("Evicted cached instance {}/{}", key.0, key.1);
                    }
                }
                None => break,
            }
        }
    }
}
