// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Master side of object distribution
//!
//! The node owning an object's master instance serializes commits, numbers
//! them, and fans each version out to every attached slave. Commits on one
//! object are serialized by a per-object gate; commits on different objects
//! proceed concurrently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use super::{ChangeType, SharedObject, VersionPayload, DIRTY_ALL, VERSION_FIRST};
use crate::command::{Command, CMD_OBJECT_DELTA, CMD_OBJECT_INSTANCE, INSTANCE_NONE};
use crate::errors::ObjectError;
use crate::node::LocalNode;
use crate::node_id::{NodeId, ObjectId};
use crate::queue::CommandQueue;

/// One slave attachment as seen from the master
#[derive(Debug, Clone)]
pub(crate) struct SlaveProxy {
    pub(crate) node: NodeId,
    pub(crate) instance_id: u32,
    pub(crate) acked: u64,
}

#[derive(Debug)]
struct MasterState {
    version: u64,
    slaves: Vec<SlaveProxy>,
}

/// Registry entry for a locally mastered object
pub(crate) struct MasterEntry {
    pub(crate) id: ObjectId,
    object: SharedObject,
    change: ChangeType,
    max_versions: u64,
    state: Mutex<MasterState>,
    // serializes commits per object; held across the slave fan-out
    commit_gate: tokio::sync::Mutex<()>,
    acks: tokio::sync::Notify,
    custom: Arc<CommandQueue>,
}

impl MasterEntry {
    pub(crate) fn new(id: ObjectId, object: SharedObject) -> Self {
        let (change, max_versions) = {
            let locked = object.lock().expect("Object lock poisoned");
            (locked.change_type(), locked.max_versions())
        };
        Self {
            id,
            object,
            change,
            max_versions,
            state: Mutex::new(MasterState {
                version: VERSION_FIRST,
                slaves: Vec::new(),
            }),
            commit_gate: tokio::sync::Mutex::new(()),
            acks: tokio::sync::Notify::new(),
            custom: Arc::new(CommandQueue::new()),
        }
    }

    pub(crate) fn change_type(&self) -> ChangeType {
        self.change
    }

    pub(crate) fn custom_queue(&self) -> Arc<CommandQueue> {
        self.custom.clone()
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.lock().expect("Master lock poisoned").version
    }

    /// Attach a slave and serialize its baseline in one step, so no commit
    /// can slip between the attachment and the snapshot
    pub(crate) fn attach(&self, node: NodeId, instance_id: u32) -> (u64, Bytes) {
        let mut state = self.state.lock().expect("Master lock poisoned");
        let version = state.version;
        state.slaves.push(SlaveProxy {
            node,
            instance_id,
            acked: version,
        });
        (version, Self::serialize_full(&self.object, version))
    }

    /// Serialize the current full instance, returning (version, payload)
    pub(crate) fn snapshot(&self) -> (u64, Bytes) {
        let state = self.state.lock().expect("Master lock poisoned");
        let payload = Self::serialize_full(&self.object, state.version);
        (state.version, payload)
    }

    // callers hold the state lock, excluding a commit's publish step
    fn serialize_full(object: &SharedObject, version: u64) -> Bytes {
        let object = object.lock().expect("Object lock poisoned");
        let mut out = BytesMut::new();
        object.serialize(DIRTY_ALL, &mut out);
        VersionPayload {
            version,
            mask: DIRTY_ALL,
            data: out.freeze(),
        }
        .encode()
    }

    pub(crate) fn remove_slave(&self, node: NodeId, instance_id: u32) {
        let mut state = self.state.lock().expect("Master lock poisoned");
        state
            .slaves
            .retain(|proxy| !(proxy.node == node && proxy.instance_id == instance_id));
        self.acks.notify_waiters();
    }

    /// Drop every slave attachment hosted by a departed node
    pub(crate) fn remove_node(&self, node: NodeId) {
        let mut state = self.state.lock().expect("Master lock poisoned");
        state.slaves.retain(|proxy| proxy.node != node);
        self.acks.notify_waiters();
    }

    pub(crate) fn handle_ack(&self, node: NodeId, instance_id: u32, version: u64) {
        let mut state = self.state.lock().expect("Master lock poisoned");
        for proxy in &mut state.slaves {
            if proxy.node == node && proxy.instance_id == instance_id {
                proxy.acked = proxy.acked.max(version);
            }
        }
        drop(state);
        self.acks.notify_waiters();
    }

    /// Commit dirty state as a new version and distribute it
    pub(crate) async fn commit(&self, node: &Arc<LocalNode>) -> Result<u64, ObjectError> {
        if !self.change.is_versioned() {
            tracing::debug!("Ignoring commit on static object {}", self.id);
            return Ok(VERSION_FIRST);
        }

        let _gate = self.commit_gate.lock().await;

        let new_version = {
            let state = self.state.lock().expect("Master lock poisoned");
            let object = self.object.lock().expect("Object lock poisoned");
            if object.dirty_mask() == 0 {
                return Ok(state.version);
            }
            state.version + 1
        };

        // hold back until the slowest slave has caught up enough
        if self.max_versions > 0 {
            loop {
                let notified = self.acks.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let oldest = {
                    let state = self.state.lock().expect("Master lock poisoned");
                    state.slaves.iter().map(|proxy| proxy.acked).min()
                };
                match oldest {
                    Some(acked) if new_version.saturating_sub(acked) > self.max_versions => {
                        tracing::trace!(
                            "Commit of {} v{new_version} waiting on slave acks (oldest {acked})",
                            self.id
                        );
                        notified.await;
                    }
                    _ => break,
                }
            }
        }

        // serialize, clear and publish atomically, so a concurrent map or
        // refetch never sees new field data under the old version
        let (payload, targets) = {
            let mut state = self.state.lock().expect("Master lock poisoned");
            let mut object = self.object.lock().expect("Object lock poisoned");
            let dirty = object.dirty_mask();
            let mask = if self.change.is_delta() { dirty } else { DIRTY_ALL };
            let mut out = BytesMut::new();
            object.serialize(mask, &mut out);
            object.clear_dirty();
            state.version = new_version;
            let payload = VersionPayload {
                version: new_version,
                mask,
                data: out.freeze(),
            };
            (payload, state.slaves.clone())
        };

        let command = if self.change.is_delta() {
            CMD_OBJECT_DELTA
        } else {
            CMD_OBJECT_INSTANCE
        };
        let encoded = payload.encode();
        // all instances on one peer travel as a single batched write
        let mut batches: HashMap<NodeId, Vec<Command>> = HashMap::new();
        for proxy in &targets {
            batches
                .entry(proxy.node)
                .or_default()
                .push(Command::object(command, self.id, proxy.instance_id, encoded.clone()));
        }
        for (target, commands) in batches {
            if let Err(err) = node.send_many(target, commands).await {
                tracing::warn!(
                    "Failed to distribute {} v{new_version} to {target}: {err}",
                    self.id
                );
            }
        }

        if matches!(self.change, ChangeType::Instance) {
            node.cache().add((self.id, new_version), encoded);
        }

        Ok(new_version)
    }
}

impl std::fmt::Debug for MasterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterEntry")
            .field("id", &self.id)
            .field("change", &self.change)
            .field("version", &self.version())
            .finish()
    }
}

/// Handle to a locally registered master instance
///
/// Returned by [LocalNode::register_object]; the object stays registered
/// until [LocalNode::deregister_object], independent of this handle.
#[derive(Debug, Clone)]
pub struct MasterObject {
    id: ObjectId,
    node: Arc<LocalNode>,
}

impl MasterObject {
    pub(crate) fn new(id: ObjectId, node: Arc<LocalNode>) -> Self {
        Self { id, node }
    }

    /// The distributed identity of this object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The current committed version
    pub fn version(&self) -> Result<u64, ObjectError> {
        let entry = self
            .node
            .objects()
            .master(self.id)
            .ok_or(ObjectError::NotMaster(self.id))?;
        Ok(entry.version())
    }

    /// Commit dirty fields as a new version and send it to all slaves
    ///
    /// Returns the committed version, or the current one when nothing was
    /// dirty. Blocks while the object's [super::Object::max_versions]
    /// window is full of unacknowledged versions.
    pub async fn commit(&self) -> Result<u64, ObjectError> {
        let entry = self
            .node
            .objects()
            .master(self.id)
            .ok_or(ObjectError::NotMaster(self.id))?;
        entry.commit(&self.node).await
    }

    /// Send the current full instance to nodes which have not mapped it
    ///
    /// The receiving nodes park the payload in their instance cache, so a
    /// subsequent map resolves locally.
    pub async fn push(&self, targets: &[NodeId]) -> Result<(), ObjectError> {
        let entry = self
            .node
            .objects()
            .master(self.id)
            .ok_or(ObjectError::NotMaster(self.id))?;
        let (version, payload) = entry.snapshot();
        for target in targets {
            let cmd = Command::object(
                CMD_OBJECT_INSTANCE,
                self.id,
                INSTANCE_NONE,
                payload.clone(),
            );
            self.node
                .send_to(*target, cmd)
                .await
                .map_err(|err| ObjectError::Request(crate::errors::RequestError::Send(err)))?;
        }
        tracing::debug!("Pushed {} v{version} to {} node(s)", self.id, targets.len());
        Ok(())
    }

    /// The queue receiving custom object commands addressed to this object
    pub fn command_queue(&self) -> Result<Arc<CommandQueue>, ObjectError> {
        let entry = self
            .node
            .objects()
            .master(self.id)
            .ok_or(ObjectError::NotMaster(self.id))?;
        Ok(entry.custom_queue())
    }
}
