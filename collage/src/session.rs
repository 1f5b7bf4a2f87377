// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Named object rendezvous within a group of nodes
//!
//! A [Session] designates one node as its master and keeps a name-to-object
//! registry there. Producers bind names to the objects they registered;
//! consumers resolve names to [crate::node_id::ObjectId]s they can then map.
//! Lookups against the local node short-circuit the wire.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::{Command, CMD_SESSION_RESOLVE, CMD_SESSION_SET_NAME};
use crate::concurrency::Duration;
use crate::errors::{DispatchError, RequestError};
use crate::node::local::encode_set_name;
use crate::node::LocalNode;
use crate::node_id::{NodeId, ObjectId};

/// A shared namespace rooted at one master node
#[derive(Debug, Clone)]
pub struct Session {
    node: Arc<LocalNode>,
    master: NodeId,
}

impl Session {
    /// Join the session whose registry lives on `master`
    ///
    /// `master` may be the local node's own id, making this node the
    /// registry holder.
    pub fn new(node: Arc<LocalNode>, master: NodeId) -> Self {
        Self { node, master }
    }

    /// The node holding the name registry
    pub fn master(&self) -> NodeId {
        self.master
    }

    /// Bind `name` to `object` in the session registry
    pub async fn register_name(
        &self,
        name: &str,
        object: ObjectId,
    ) -> Result<(), DispatchError> {
        if self.master == self.node.id() {
            tracing::debug!("Binding name '{name}' to {object}");
            self.node.names().insert(name.to_string(), object);
            return Ok(());
        }
        let cmd = Command::node(CMD_SESSION_SET_NAME, encode_set_name(name, object));
        self.node.send_to(self.master, cmd).await
    }

    /// Resolve `name` to the object bound to it, if any
    pub async fn resolve(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<Option<ObjectId>, RequestError> {
        if self.master == self.node.id() {
            return Ok(self.node.names().get(name).map(|entry| *entry.value()));
        }

        let ticket = self.node.register_request(self.master);
        let mut payload = BytesMut::with_capacity(6 + name.len());
        payload.put_u32(ticket.id());
        payload.put_u16(name.len() as u16);
        payload.extend_from_slice(name.as_bytes());
        let cmd = Command::node(CMD_SESSION_RESOLVE, payload.freeze());
        self.node.send_to(self.master, cmd).await?;

        let reply = self.node.wait_request(ticket, timeout).await?;
        Ok(decode_resolve_reply(reply))
    }
}

fn decode_resolve_reply(mut reply: Bytes) -> Option<ObjectId> {
    if reply.is_empty() || reply.get_u8() == 0 {
        return None;
    }
    if reply.len() < 16 {
        return None;
    }
    Some(ObjectId::from_value(reply.get_u128()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Config;

    #[tokio::test]
    async fn local_session_binds_and_resolves() {
        let node = LocalNode::new(Config::default());
        let session = Session::new(node.clone(), node.id());
        let object = ObjectId::generate();

        session
            .register_name("frame-data", object)
            .await
            .expect("Failed to bind name");
        let resolved = session
            .resolve("frame-data", None)
            .await
            .expect("Resolve failed");
        assert_eq!(resolved, Some(object));

        let missing = session
            .resolve("no-such-name", None)
            .await
            .expect("Resolve failed");
        assert_eq!(missing, None);
    }

    #[test]
    fn resolve_reply_decoding() {
        let object = ObjectId::generate();
        let mut found = BytesMut::new();
        found.put_u8(1);
        found.put_u128(object.value());
        assert_eq!(decode_resolve_reply(found.freeze()), Some(object));

        let mut missing = BytesMut::new();
        missing.put_u8(0);
        assert_eq!(decode_resolve_reply(missing.freeze()), None);
        assert_eq!(decode_resolve_reply(Bytes::new()), None);
    }
}
