// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Per-node registry of master and slave object instances
//!
//! Commands in the object id partition are routed here by the node's
//! dispatch: mapping and acknowledgment traffic is handled inline, version
//! payloads are queued on the addressed slave, and custom object commands
//! land on the addressed object's own command queue.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use super::master::MasterEntry;
use super::slave::SlaveEntry;
use super::{SharedObject, VersionPayload};
use crate::command::{
    Command, CMD_OBJECT_ACK, CMD_OBJECT_CUSTOM, CMD_OBJECT_DELTA, CMD_OBJECT_INSTANCE,
    CMD_OBJECT_MAP, CMD_OBJECT_MAP_REPLY, CMD_OBJECT_REFETCH, CMD_OBJECT_UNMAP, INSTANCE_NONE,
};
use crate::errors::DispatchError;
use crate::node::LocalNode;
use crate::node_id::{NodeId, ObjectId};

/// Map reply status: the master accepted the slave
pub(crate) const MAP_OK: u8 = 0;
/// Map reply status: the object is not registered on the addressed node
pub(crate) const MAP_UNKNOWN: u8 = 1;

/// All objects attached to a node
#[derive(Debug, Default)]
pub(crate) struct ObjectStore {
    masters: DashMap<ObjectId, Arc<MasterEntry>>,
    slaves: DashMap<ObjectId, Arc<SlaveEntry>>,
}

impl ObjectStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_master(&self, id: ObjectId, object: SharedObject) -> Arc<MasterEntry> {
        let entry = Arc::new(MasterEntry::new(id, object));
        self.masters.insert(id, entry.clone());
        entry
    }

    pub(crate) fn deregister_master(&self, id: ObjectId) -> Option<Arc<MasterEntry>> {
        self.masters.remove(&id).map(|(_, entry)| entry)
    }

    pub(crate) fn master(&self, id: ObjectId) -> Option<Arc<MasterEntry>> {
        self.masters.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn insert_slave(&self, entry: Arc<SlaveEntry>) {
        self.slaves.insert(entry.id, entry);
    }

    pub(crate) fn slave(&self, id: ObjectId) -> Option<Arc<SlaveEntry>> {
        self.slaves.get(&id).map(|entry| entry.clone())
    }

    pub(crate) fn remove_slave(&self, id: ObjectId) -> Option<Arc<SlaveEntry>> {
        self.slaves.remove(&id).map(|(_, entry)| entry)
    }

    /// Route a command from the object id partition
    pub(crate) async fn handle_command(
        &self,
        node: &Arc<LocalNode>,
        cmd: Command,
    ) -> Result<(), DispatchError> {
        match cmd.command() {
            CMD_OBJECT_MAP => self.handle_map(node, cmd).await,
            CMD_OBJECT_MAP_REPLY => {
                let mut payload = cmd.payload();
                if payload.len() < 4 {
                    protocol_error(&cmd);
                }
                let request_id = payload.get_u32();
                node.requests().serve(request_id, payload);
                Ok(())
            }
            CMD_OBJECT_UNMAP => {
                if let Some(entry) = self.master(cmd.object_id()) {
                    entry.remove_slave(cmd.origin(), cmd.instance_id());
                }
                Ok(())
            }
            CMD_OBJECT_INSTANCE | CMD_OBJECT_DELTA => self.handle_version(node, cmd),
            CMD_OBJECT_ACK => {
                let mut payload = cmd.payload();
                if payload.len() < 8 {
                    protocol_error(&cmd);
                }
                let version = payload.get_u64();
                if let Some(entry) = self.master(cmd.object_id()) {
                    entry.handle_ack(cmd.origin(), cmd.instance_id(), version);
                }
                Ok(())
            }
            CMD_OBJECT_REFETCH => self.handle_refetch(node, cmd).await,
            custom if custom >= CMD_OBJECT_CUSTOM => self.handle_custom(cmd),
            _ => protocol_error(&cmd),
        }
    }

    /// Attach a requesting slave and reply with its baseline
    async fn handle_map(
        &self,
        node: &Arc<LocalNode>,
        cmd: Command,
    ) -> Result<(), DispatchError> {
        let mut payload = cmd.payload();
        if payload.len() < 24 {
            protocol_error(&cmd);
        }
        let request_id = payload.get_u32();
        let instance_id = payload.get_u32();
        let requested = payload.get_u64();
        let cached = payload.get_u64();
        let id = cmd.object_id();
        let origin = cmd.origin();

        let mut reply = BytesMut::new();
        reply.put_u32(request_id);
        match self.master(id) {
            None => {
                tracing::debug!("Refusing to map unknown object {id} for {origin}");
                reply.put_u8(MAP_UNKNOWN);
                reply.put_u8(0);
            }
            Some(entry) => {
                let (version, instance) = entry.attach(origin, instance_id);
                tracing::trace!(
                    "Mapping {id} v{version} for {origin}/{instance_id} \
                     (requested v{requested}, cached v{cached})"
                );
                reply.put_u8(MAP_OK);
                if cached == version {
                    // the slave already holds this instance in its cache
                    reply.put_u8(1);
                } else {
                    reply.put_u8(0);
                    reply.extend_from_slice(&instance);
                }
            }
        }

        let reply = Command::object(CMD_OBJECT_MAP_REPLY, id, instance_id, reply.freeze());
        node.send_to(origin, reply).await
    }

    /// Queue an arrived version payload on the addressed slave
    fn handle_version(
        &self,
        node: &Arc<LocalNode>,
        cmd: Command,
    ) -> Result<(), DispatchError> {
        let id = cmd.object_id();
        let delta = cmd.command() == CMD_OBJECT_DELTA;
        let raw = cmd.payload();
        let Some(payload) = VersionPayload::decode(raw.clone()) else {
            protocol_error(&cmd);
        };

        let addressed = self.slave(id).filter(|entry| {
            cmd.instance_id() == INSTANCE_NONE || cmd.instance_id() == entry.instance_id
        });
        match addressed {
            Some(entry) => entry.queue_version(payload, delta),
            None if !delta => {
                // pushed instance for an object not (yet) mapped here
                node.cache().add((id, payload.version), raw);
            }
            None => {
                tracing::trace!("Dropping delta v{} for unmapped {id}", payload.version);
            }
        }
        Ok(())
    }

    /// Serve a full baseline to a slave that observed a delta gap
    async fn handle_refetch(
        &self,
        node: &Arc<LocalNode>,
        cmd: Command,
    ) -> Result<(), DispatchError> {
        let mut payload = cmd.payload();
        if payload.len() < 4 {
            protocol_error(&cmd);
        }
        let request_id = payload.get_u32();
        let id = cmd.object_id();
        match self.master(id) {
            Some(entry) => {
                let (version, instance) = entry.snapshot();
                tracing::debug!("Re-serving {id} v{version} to {}", cmd.origin());
                node.reply_request(cmd.origin(), request_id, instance).await
            }
            None => Err(DispatchError::ObjectUnknown(id)),
        }
    }

    /// Deliver a custom object command to the addressed object's queue
    fn handle_custom(&self, cmd: Command) -> Result<(), DispatchError> {
        let id = cmd.object_id();
        if let Some(entry) = self.master(id) {
            entry.custom_queue().push(cmd);
            return Ok(());
        }
        if let Some(entry) = self.slave(id) {
            entry.custom_queue().push(cmd);
            return Ok(());
        }
        Err(DispatchError::ObjectUnknown(id))
    }

    /// A peer disconnected: detach its slaves and poison our mappings to it
    pub(crate) fn handle_disconnect(&self, node: NodeId) {
        for entry in self.masters.iter() {
            entry.value().remove_node(node);
        }
        for entry in self.slaves.iter() {
            if entry.value().master == node {
                entry.value().detach();
            }
        }
    }
}

/// A malformed or unknown command inside the internal protocol means the
/// peers disagree about the protocol itself; there is no way to continue.
/// Aborts rather than panics so the violation cannot be swallowed by a
/// task boundary.
fn protocol_error(cmd: &Command) -> ! {
    tracing::error!(
        "Protocol error: invalid object command {:#06x} from {} for {}",
        cmd.command(),
        cmd.origin(),
        cmd.object_id()
    );
    std::process::abort();
}

/// Wire form of a map request
pub(crate) fn encode_map_request(
    request_id: u32,
    instance_id: u32,
    requested: u64,
    cached: u64,
) -> Bytes {
    let mut out = BytesMut::with_capacity(24);
    out.put_u32(request_id);
    out.put_u32(instance_id);
    out.put_u64(requested);
    out.put_u64(cached);
    out.freeze()
}

/// Decoded map reply: `Ok(None)` means "use your cached instance"
pub(crate) fn decode_map_reply(
    id: ObjectId,
    mut reply: Bytes,
) -> Result<Option<VersionPayload>, crate::errors::ObjectError> {
    use crate::errors::ObjectError;
    if reply.len() < 2 {
        return Err(ObjectError::Corrupt(id));
    }
    let status = reply.get_u8();
    let use_cached = reply.get_u8();
    if status != MAP_OK {
        return Err(ObjectError::MapFailed(id));
    }
    if use_cached == 1 {
        return Ok(None);
    }
    VersionPayload::decode(reply)
        .map(Some)
        .ok_or(ObjectError::Corrupt(id))
}
