// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Typed, length-prefixed command messages
//!
//! Every message on the wire is a [Command]: a fixed 28-byte header
//! addressing an (object, instance) pair, followed by an opaque payload.
//! A command always refers to exactly one registered handler, and is never
//! mutated once dispatch begins ([Command] hands out read-only views of a
//! reference-counted payload).
//!
//! ## Command id partitioning
//!
//! The id space is partitioned by recipient category, with a reserved
//! "custom" offset per category so higher layers can extend the space
//! without collision. The partitioning is wire-stable; see the constants in
//! this module.

pub mod cache;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node_id::{NodeId, ObjectId};

/// Size in bytes of the fixed wire header
pub const HEADER_SIZE: usize = 28;

/// Instance id wildcard: "any/none"
pub const INSTANCE_NONE: u32 = u32::MAX;

// ------------------- node-level commands: 0x0000..0x0400 ------------------ //

/// Handshake: client announces its identity and listen descriptions
pub const CMD_NODE_CONNECT: u32 = 0x0000;
/// Handshake: server announces its identity and listen descriptions
pub const CMD_NODE_CONNECT_REPLY: u32 = 0x0001;
/// Handshake: client confirms the session
pub const CMD_NODE_CONNECT_ACK: u32 = 0x0002;
/// Orderly session teardown
pub const CMD_NODE_STOP: u32 = 0x0003;
/// Generic reply carrying a request id and result bytes
pub const CMD_NODE_REPLY: u32 = 0x0004;
/// First node-level id available to higher layers
pub const CMD_NODE_CUSTOM: u32 = 0x0200;

// ------------------ object-level commands: 0x0400..0x0800 ----------------- //

/// Slave asks the master to attach it to an object
pub const CMD_OBJECT_MAP: u32 = 0x0400;
/// Master reply to [CMD_OBJECT_MAP] with the baseline instance data
pub const CMD_OBJECT_MAP_REPLY: u32 = 0x0401;
/// Slave detaches from an object
pub const CMD_OBJECT_UNMAP: u32 = 0x0402;
/// Full-instance version payload
pub const CMD_OBJECT_INSTANCE: u32 = 0x0403;
/// Incremental (dirty-field) version payload
pub const CMD_OBJECT_DELTA: u32 = 0x0404;
/// Slave acknowledges an applied version
pub const CMD_OBJECT_ACK: u32 = 0x0405;
/// Slave requests a fresh full baseline after observing a version gap
pub const CMD_OBJECT_REFETCH: u32 = 0x0406;
/// First object-level id available to higher layers
pub const CMD_OBJECT_CUSTOM: u32 = 0x0600;

/// Distributed barrier entry (object-custom range)
pub const CMD_BARRIER_ENTER: u32 = CMD_OBJECT_CUSTOM;

// ----------------- session-level commands: 0x0800..0x0C00 ----------------- //

/// Bind a name to an object id on the session master
pub const CMD_SESSION_SET_NAME: u32 = 0x0800;
/// Resolve a name to an object id on the session master
pub const CMD_SESSION_RESOLVE: u32 = 0x0801;
/// First session-level id available to higher layers
pub const CMD_SESSION_CUSTOM: u32 = 0x0A00;

/// Whether a command id falls into the object-level partition and is
/// therefore forwarded to the addressed object's own dispatch
pub fn is_object_command(command: u32) -> bool {
    (CMD_OBJECT_MAP..CMD_SESSION_SET_NAME).contains(&command)
}

/// The fixed wire header preceding every command payload
///
/// All fields are encoded big-endian: `size: u32 | command: u32 |
/// object_id: u128 | instance_id: u32`. `size` counts header plus payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Total frame size in bytes, header included
    pub size: u32,
    /// The command id, determining the registered handler
    pub command: u32,
    /// The addressed object, [ObjectId::ZERO] for the node itself
    pub object_id: ObjectId,
    /// The addressed object instance, [INSTANCE_NONE] for "any"
    pub instance_id: u32,
}

impl CommandHeader {
    /// Decode a header from exactly [HEADER_SIZE] bytes
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut cursor = &buf[..];
        let size = cursor.get_u32();
        let command = cursor.get_u32();
        let object_id = ObjectId::from_value(cursor.get_u128());
        let instance_id = cursor.get_u32();
        Self {
            size,
            command,
            object_id,
            instance_id,
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.size);
        out.put_u32(self.command);
        out.put_u128(self.object_id.value());
        out.put_u32(self.instance_id);
    }
}

/// A dispatchable message: header, payload, and the node it arrived from
///
/// The payload is reference counted ([Bytes]); cloning a command is cheap
/// and the backing buffer is reclaimed by the node's [cache::BufferPool]
/// when the last reference drops.
#[derive(Debug, Clone)]
pub struct Command {
    header: CommandHeader,
    payload: Bytes,
    origin: NodeId,
}

impl Command {
    /// Build a node-addressed command
    pub fn node(command: u32, payload: Bytes) -> Self {
        Self::object(command, ObjectId::ZERO, INSTANCE_NONE, payload)
    }

    /// Build an object-addressed command
    pub fn object(command: u32, object_id: ObjectId, instance_id: u32, payload: Bytes) -> Self {
        Self {
            header: CommandHeader {
                size: (HEADER_SIZE + payload.len()) as u32,
                command,
                object_id,
                instance_id,
            },
            payload,
            origin: NodeId::ZERO,
        }
    }

    /// Reassemble a received command from its decoded header and payload
    pub fn from_parts(header: CommandHeader, payload: Bytes, origin: NodeId) -> Self {
        Self {
            header,
            payload,
            origin,
        }
    }

    /// The command id
    pub fn command(&self) -> u32 {
        self.header.command
    }

    /// The addressed object
    pub fn object_id(&self) -> ObjectId {
        self.header.object_id
    }

    /// The addressed object instance
    pub fn instance_id(&self) -> u32 {
        self.header.instance_id
    }

    /// The wire header
    pub fn header(&self) -> &CommandHeader {
        &self.header
    }

    /// The node which delivered this command (the local node's own id for
    /// self-dispatched commands)
    pub fn origin(&self) -> NodeId {
        self.origin
    }

    /// Stamp the delivering node; done by the receive loop before dispatch
    pub(crate) fn set_origin(&mut self, origin: NodeId) {
        self.origin = origin;
    }

    /// A read-only view of the payload
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Consume the command, yielding the payload for buffer reclamation
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encode the full frame (header + payload) for transmission
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        self.header.encode(&mut out);
        out.put_slice(&self.payload);
        out.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let cmd = Command::object(
            CMD_OBJECT_DELTA,
            ObjectId::generate(),
            7,
            Bytes::from_static(b"some field data"),
        );
        let wire = cmd.encode();
        assert_eq!(wire.len(), cmd.header().size as usize);

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&wire[..HEADER_SIZE]);
        let header = CommandHeader::decode(&header_bytes);
        assert_eq!(header, *cmd.header());

        let decoded = Command::from_parts(header, wire.slice(HEADER_SIZE..), NodeId::ZERO);
        assert_eq!(decoded.payload(), cmd.payload());
        assert_eq!(decoded.command(), CMD_OBJECT_DELTA);
        assert_eq!(decoded.instance_id(), 7);
    }

    #[test]
    fn node_commands_address_object_zero() {
        let cmd = Command::node(CMD_NODE_STOP, Bytes::new());
        assert!(cmd.object_id().is_zero());
        assert_eq!(cmd.instance_id(), INSTANCE_NONE);
        assert_eq!(cmd.header().size as usize, HEADER_SIZE);
    }

    #[test]
    fn id_partitioning() {
        assert!(is_object_command(CMD_OBJECT_MAP));
        assert!(is_object_command(CMD_BARRIER_ENTER));
        assert!(!is_object_command(CMD_NODE_REPLY));
        assert!(!is_object_command(CMD_SESSION_RESOLVE));
        // reserved custom offsets are wire-stable
        assert_eq!(CMD_NODE_CUSTOM, 0x0200);
        assert_eq!(CMD_OBJECT_CUSTOM, 0x0600);
        assert_eq!(CMD_SESSION_CUSTOM, 0x0A00);
    }
}
