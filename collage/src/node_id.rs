// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! 128-bit identifiers for nodes and distributed objects
//!
//! Identity is independent of any transport address. Equality and ordering
//! are purely bitwise, and the reserved [NodeId::ZERO] / [ObjectId::ZERO]
//! values denote "no node" / "no object" (a command addressed to object zero
//! targets the node itself).

use std::fmt::Display;
use std::str::FromStr;

/// Error parsing an identifier from its string form
#[derive(Debug, PartialEq, Eq)]
pub struct ParseIdError;

impl Display for ParseIdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifiers are 32 hexadecimal digits")
    }
}

impl std::error::Error for ParseIdError {}

/// The globally unique identity of a peer process, independent of its
/// transport address(es).
///
/// Generated randomly on node startup or parsed from the 32-digit hex
/// string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u128);

impl NodeId {
    /// The reserved "no node" value
    pub const ZERO: NodeId = NodeId(0);

    /// Generate a new random (non-zero) node identifier
    pub fn generate() -> Self {
        loop {
            let value = rand::random::<u128>();
            if value != 0 {
                return NodeId(value);
            }
        }
    }

    /// Whether this is the reserved [NodeId::ZERO] value
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The raw 128-bit value
    pub fn value(&self) -> u128 {
        self.0
    }

    /// Construct from a raw 128-bit value
    pub fn from_value(value: u128) -> Self {
        NodeId(value)
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParseIdError);
        }
        u128::from_str_radix(s, 16).map(NodeId).map_err(|_| ParseIdError)
    }
}

/// The globally unique identity of a distributed object.
///
/// Assigned by the registering [crate::LocalNode] when a master object is
/// installed, and shared with slaves through a [crate::Session] or any
/// out-of-band channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u128);

impl ObjectId {
    /// The reserved "no object" value, addressing the node itself
    pub const ZERO: ObjectId = ObjectId(0);

    /// Generate a new random (non-zero) object identifier
    pub fn generate() -> Self {
        loop {
            let value = rand::random::<u128>();
            if value != 0 {
                return ObjectId(value);
            }
        }
    }

    /// Whether this is the reserved [ObjectId::ZERO] value
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// The raw 128-bit value
    pub fn value(&self) -> u128 {
        self.0
    }

    /// Construct from a raw 128-bit value
    pub fn from_value(value: u128) -> Self {
        ObjectId(value)
    }
}

impl Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 {
            return Err(ParseIdError);
        }
        u128::from_str_radix(s, 16)
            .map(ObjectId)
            .map_err(|_| ParseIdError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_nonzero_and_unique() {
        let a = NodeId::generate();
        let b = NodeId::generate();
        assert!(!a.is_zero());
        assert_ne!(a, b);
    }

    #[test]
    fn string_round_trip() {
        let id = NodeId::generate();
        let parsed: NodeId = id.to_string().parse().expect("Failed to parse id");
        assert_eq!(id, parsed);

        let obj = ObjectId::generate();
        let parsed: ObjectId = obj.to_string().parse().expect("Failed to parse id");
        assert_eq!(obj, parsed);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert_eq!("nope".parse::<NodeId>(), Err(ParseIdError));
        assert_eq!(
            "zz000000000000000000000000000000".parse::<NodeId>(),
            Err(ParseIdError)
        );
    }
}
