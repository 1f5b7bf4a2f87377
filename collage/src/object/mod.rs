// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Versioned, replicated objects
//!
//! An [Object] is application state distributed from one master instance to
//! any number of slave instances on other nodes. The master advances the
//! object through numbered versions with [master::MasterObject::commit];
//! slaves apply versions in order with [slave::SlaveObject::sync]. How a
//! commit is serialized is governed by the object's [ChangeType].
//!
//! The object itself only describes its data: which fields are dirty, how
//! to write them out and how to read them back. All distribution mechanics
//! live in the per-node object store and the master/slave handles.

pub mod master;
pub mod slave;
pub mod store;


pub use master::MasterObject;
pub use slave::SlaveObject;

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The version of an object that was never committed
pub const VERSION_NONE: u64 = 0;
/// The first version a registered object exists at
pub const VERSION_FIRST: u64 = 1;
/// Sentinel requesting the newest available version
pub const VERSION_HEAD: u64 = u64::MAX;

/// Dirty mask selecting every field
pub const DIRTY_ALL: u64 = u64::MAX;

/// How commits of an object are serialized and distributed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    /// Distributed once at mapping time, never committed
    Static,
    /// Every commit ships a full instance
    Instance,
    /// Commits ship only the fields named by the dirty mask
    Delta,
    /// Full instance per commit, no version buffering on the master
    Unbuffered,
}

impl ChangeType {
    /// Whether commits produce new versions at all
    pub fn is_versioned(&self) -> bool {
        !matches!(self, ChangeType::Static)
    }

    /// Whether commits ship deltas rather than full instances
    pub fn is_delta(&self) -> bool {
        matches!(self, ChangeType::Delta)
    }
}

/// Payload could not be deserialized into the object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptPayload;

impl std::fmt::Display for CorruptPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Corrupt object payload")
    }
}

impl std::error::Error for CorruptPayload {}

/// Application state replicated between nodes
///
/// Implementations serialize whatever fields the dirty mask selects, and
/// deserialize payloads produced by the same implementation on another
/// node. [Object::serialize] must write nothing for clean fields so that
/// [ChangeType::Delta] payloads stay small.
pub trait Object: Send + 'static {
    /// The distribution policy of this object
    fn change_type(&self) -> ChangeType;

    /// Bitmask of fields modified since the last commit
    fn dirty_mask(&self) -> u64;

    /// Reset the dirty mask after a commit serialized the object
    fn clear_dirty(&mut self);

    /// Write the fields selected by `mask` into `out`
    fn serialize(&self, mask: u64, out: &mut BytesMut);

    /// Read back fields selected by `mask` from `data`
    fn deserialize(&mut self, mask: u64, data: &mut Bytes) -> Result<(), CorruptPayload>;

    /// How far commits may run ahead of the slowest slave, 0 for unbounded
    fn max_versions(&self) -> u64 {
        0
    }
}

/// A shared, lockable object instance
pub type SharedObject = std::sync::Arc<std::sync::Mutex<dyn Object>>;

/// Wire form of one object version: version, dirty mask, field data
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VersionPayload {
    pub(crate) version: u64,
    pub(crate) mask: u64,
    pub(crate) data: Bytes,
}

impl VersionPayload {
    const PREFIX: usize = 16;

    pub(crate) fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::PREFIX + self.data.len());
        out.put_u64(self.version);
        out.put_u64(self.mask);
        out.extend_from_slice(&self.data);
        out.freeze()
    }

    pub(crate) fn decode(mut raw: Bytes) -> Option<Self> {
        if raw.len() < Self::PREFIX {
            return None;
        }
        let version = raw.get_u64();
        let mask = raw.get_u64();
        Some(Self {
            version,
            mask,
            data: raw,
        })
    }
}

#[cfg(test)]
mod codec_tests {
    use super::*;

    #[test]
    fn version_payload_survives_the_wire() {
        let payload = VersionPayload {
            version: 7,
            mask: 0b1010,
            data: Bytes::from_static(b"fields"),
        };
        let decoded =
            VersionPayload::decode(payload.encode()).expect("Failed to decode payload");
        assert_eq!(decoded, payload);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        assert!(VersionPayload::decode(Bytes::from_static(&[0u8; 15])).is_none());
    }
}
