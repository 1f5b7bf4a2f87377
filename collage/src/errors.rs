// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Error types surfaced by the messaging substrate
//!
//! Transport failures close the affected connection and are returned as
//! values; protocol-level disagreements between peers are invariant
//! violations and abort instead (see the crate documentation). Nothing here
//! relies on structured exception propagation.

use std::fmt::Display;

use crate::node_id::{NodeId, ObjectId};

/// Transport-level errors: connect, listen, accept, read and write failures.
///
/// Any of these transitions the affected connection to
/// [crate::connection::ConnectionState::Closed]; the caller decides whether
/// to retry with a fresh connection.
#[derive(Debug)]
pub enum ConnectionError {
    /// The connection description could not be parsed or is incomplete
    BadDescription(String),
    /// The transport kind is recognized but not supported by this build
    Unsupported(crate::connection::ConnectionKind),
    /// An underlying I/O operation failed
    Io(std::io::Error),
    /// The connection is (already) closed
    Closed,
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadDescription(text) => {
                write!(f, "Malformed connection description '{text}'")
            }
            Self::Unsupported(kind) => {
                write!(f, "Transport '{kind}' is not supported by this build")
            }
            Self::Io(inner) => {
                write!(f, "Connection I/O failed: {inner}")
            }
            Self::Closed => {
                write!(f, "Connection is closed")
            }
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Errors routing a command to its registered handler
#[derive(Debug)]
pub enum DispatchError {
    /// A handler is already registered for the command id
    AlreadyRegistered(u32),
    /// The addressed node is not connected
    NodeUnreachable(NodeId),
    /// The addressed object is neither registered nor mapped here
    ObjectUnknown(ObjectId),
    /// The command could not be sent over the peer's connection
    Send(ConnectionError),
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered(id) => {
                write!(f, "A handler for command {id:#06x} is already registered")
            }
            Self::NodeUnreachable(node) => {
                write!(f, "Node {node} is not connected")
            }
            Self::ObjectUnknown(object) => {
                write!(f, "Object {object} is not attached to this node")
            }
            Self::Send(inner) => {
                write!(f, "Failed to send command: {inner}")
            }
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Send(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<ConnectionError> for DispatchError {
    fn from(value: ConnectionError) -> Self {
        Self::Send(value)
    }
}

/// Errors completing a synchronous-call bridge request
#[derive(Debug)]
pub enum RequestError {
    /// The reply did not arrive within the allowed time
    Timeout,
    /// The serving peer disconnected before replying
    PeerGone,
    /// The request could not be sent
    Send(DispatchError),
}

impl Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "Request timed out waiting for a reply"),
            Self::PeerGone => write!(f, "Peer disconnected before replying"),
            Self::Send(inner) => write!(f, "Failed to issue request: {inner}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Send(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<DispatchError> for RequestError {
    fn from(value: DispatchError) -> Self {
        Self::Send(value)
    }
}

/// Errors in the object commit/sync protocol
#[derive(Debug)]
pub enum ObjectError {
    /// The operation is only valid on a master instance
    NotMaster(ObjectId),
    /// The operation is only valid on a mapped slave instance
    NotMapped(ObjectId),
    /// The object's payload could not be decoded
    Corrupt(ObjectId),
    /// The requested version was not reached within the allowed time
    Timeout(ObjectId, u64),
    /// The master's node disconnected while the slave was mapped
    MasterGone(ObjectId),
    /// The map request failed on the master side
    MapFailed(ObjectId),
    /// A request to the master failed
    Request(RequestError),
}

impl Display for ObjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotMaster(id) => {
                write!(f, "Object {id} is not a master instance here")
            }
            Self::NotMapped(id) => {
                write!(f, "Object {id} is not mapped here")
            }
            Self::Corrupt(id) => {
                write!(f, "Version payload for object {id} could not be decoded")
            }
            Self::Timeout(id, version) => {
                write!(f, "Timed out syncing object {id} to version {version}")
            }
            Self::MasterGone(id) => {
                write!(f, "Master node for object {id} disconnected")
            }
            Self::MapFailed(id) => {
                write!(f, "Master refused to map object {id}")
            }
            Self::Request(inner) => {
                write!(f, "Object request failed: {inner}")
            }
        }
    }
}

impl std::error::Error for ObjectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Request(inner) => Some(inner),
            _ => None,
        }
    }
}

impl From<RequestError> for ObjectError {
    fn from(value: RequestError) -> Self {
        Self::Request(value)
    }
}
