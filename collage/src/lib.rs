// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! # collage
//!
//! A peer-to-peer messaging substrate for cluster applications: typed
//! commands over pluggable transports, request/reply bridging, and
//! versioned replicated objects.
//!
//! ## Model
//!
//! Every process is a [node::LocalNode] with a random 128-bit identity. Nodes
//! connect pairwise over [connection::Connection]s (TCP, named pipes,
//! in-process pipes, reliable multicast) and exchange [command::Command]s:
//! length-prefixed frames addressing an (object, instance) pair. Received
//! commands are routed by command id to [queue::CommandQueue]s owned by
//! application tasks, so the network never runs application logic on its
//! own threads.
//!
//! Shared state is modeled as [object::Object]s: one master instance per
//! object commits numbered versions, any number of slave instances on other
//! nodes apply them in order when they choose to sync. Payloads are cached
//! in a bounded [instance_cache::InstanceCache] to serve late joiners
//! locally. [session::Session] provides name-based object rendezvous and
//! [barrier::Barrier] a distributed barrier on top of the same machinery.
//!
//! ## Errors and protocol violations
//!
//! Transport failures are values ([errors]); the affected connection closes
//! and its peer's state is torn down. Disagreement about the protocol
//! itself (an unknown command id, a malformed internal payload) is not
//! recoverable and aborts the process.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod barrier;
pub mod command;
pub mod concurrency;
pub mod connection;
pub mod errors;
pub mod instance_cache;
pub mod node;
pub mod node_id;
pub mod object;
pub mod queue;
pub mod session;

pub use barrier::Barrier;
pub use command::Command;
pub use connection::{Connection, ConnectionDescription, ConnectionKind};
pub use errors::{ConnectionError, DispatchError, ObjectError, RequestError};
pub use instance_cache::InstanceCache;
pub use node::{Config, LocalNode, Node};
pub use node_id::{NodeId, ObjectId};
pub use object::{ChangeType, MasterObject, Object, SlaveObject};
pub use queue::CommandQueue;
pub use session::Session;
