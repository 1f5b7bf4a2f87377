// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Peer identity and the local node
//!
//! A [Node] is the local handle of a remote peer: its [NodeId] plus the
//! connection descriptions it can be reached at. Nodes are shared
//! (`Arc<Node>`) because dispatch tables, in-flight commands and the
//! receive loop all need to keep a peer alive until fully processed; the
//! connection itself is owned by the [local::LocalNode] peer table.
//!
//! [local::LocalNode] is the specialization representing "this process": it
//! owns the listening connections, the command dispatch table, the pending
//! request registry and the object registry.

pub mod local;
pub mod requests;

#[cfg(test)]
mod tests;

pub use local::{Config, LocalNode};
pub use requests::RequestTicket;

use std::sync::RwLock;

use crate::connection::ConnectionDescription;
use crate::node_id::NodeId;

/// A remote peer: identity plus the ways to reach it
#[derive(Debug)]
pub struct Node {
    id: RwLock<NodeId>,
    descriptions: RwLock<Vec<ConnectionDescription>>,
}

impl Node {
    /// A peer known only by identity (descriptions learned on connect)
    pub fn with_id(id: NodeId) -> Self {
        Self {
            id: RwLock::new(id),
            descriptions: RwLock::new(Vec::new()),
        }
    }

    /// A peer known only by address (identity learned in the handshake)
    pub fn from_description(description: ConnectionDescription) -> Self {
        Self {
            id: RwLock::new(NodeId::ZERO),
            descriptions: RwLock::new(vec![description]),
        }
    }

    /// The peer's identity, [NodeId::ZERO] until the handshake completed
    pub fn id(&self) -> NodeId {
        *self.id.read().expect("Node lock poisoned")
    }

    pub(crate) fn set_id(&self, id: NodeId) {
        *self.id.write().expect("Node lock poisoned") = id;
    }

    /// Snapshot of the peer's known connection descriptions
    pub fn descriptions(&self) -> Vec<ConnectionDescription> {
        self.descriptions
            .read()
            .expect("Node lock poisoned")
            .clone()
    }

    /// Add a way to reach this peer
    pub fn add_description(&self, description: ConnectionDescription) {
        self.descriptions
            .write()
            .expect("Node lock poisoned")
            .push(description);
    }

    pub(crate) fn set_descriptions(&self, descriptions: Vec<ConnectionDescription>) {
        *self.descriptions.write().expect("Node lock poisoned") = descriptions;
    }
}
