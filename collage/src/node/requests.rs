// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Bridge between async command traffic and synchronous call sites
//!
//! A caller registers a request, embeds the returned id in an outgoing
//! command, and awaits the ticket. When the peer's reply command arrives,
//! the receive loop resolves the id and the ticket completes. Tickets also
//! fail eagerly when the peer disconnects, rather than waiting out the
//! caller's timeout.

use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::errors::RequestError;
use crate::node_id::NodeId;

#[derive(Debug)]
struct Pending {
    tx: oneshot::Sender<Result<Bytes, RequestError>>,
    target: NodeId,
}

/// One awaited reply
///
/// Dropping the ticket abandons the request; a late reply is then discarded
/// by [RequestRegistry::serve].
#[derive(Debug)]
pub struct RequestTicket {
    id: u32,
    rx: oneshot::Receiver<Result<Bytes, RequestError>>,
}

impl RequestTicket {
    /// The id to embed in the outgoing command
    pub fn id(&self) -> u32 {
        self.id
    }

    pub(crate) async fn wait(self) -> Result<Bytes, RequestError> {
        match self.rx.await {
            Ok(result) => result,
            // registry entry dropped without a reply
            Err(_) => Err(RequestError::PeerGone),
        }
    }
}

/// All requests awaiting a reply on this node
#[derive(Debug, Default)]
pub(crate) struct RequestRegistry {
    next_id: AtomicU32,
    pending: DashMap<u32, Pending>,
}

impl RequestRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocate an id and park a ticket for the reply from `target`
    pub(crate) fn register(&self, target: NodeId) -> RequestTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, Pending { tx, target });
        RequestTicket { id, rx }
    }

    /// Resolve a pending request with a reply payload
    ///
    /// Returns [false] when the id is unknown, which happens when the
    /// caller timed out or dropped the ticket before the reply arrived.
    pub(crate) fn serve(&self, id: u32, result: Bytes) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => entry.tx.send(Ok(result)).is_ok(),
            None => {
                tracing::debug!("Discarding reply for unknown request {id}");
                false
            }
        }
    }

    /// Abandon a request without resolving it (caller timed out)
    pub(crate) fn forget(&self, id: u32) {
        self.pending.remove(&id);
    }

    /// Fail every request waiting on a departed peer
    pub(crate) fn fail_node(&self, node: NodeId) {
        let stale = self
            .pending
            .iter()
            .filter(|entry| entry.value().target == node)
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        for id in stale {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.tx.send(Err(RequestError::PeerGone));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
