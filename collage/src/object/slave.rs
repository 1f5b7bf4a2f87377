// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Slave side of object distribution
//!
//! Incoming version payloads are queued per slave instance and only applied
//! when the owning task calls [SlaveObject::sync]; the network never
//! mutates application state behind the application's back. Versions apply
//! strictly in order for delta objects; a full instance may jump the
//! version forward. A delta arriving above the next expected version is a
//! gap, resolved by re-fetching a full baseline from the master.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};

use super::{SharedObject, VersionPayload, VERSION_HEAD};
use crate::command::{Command, CMD_OBJECT_ACK, CMD_OBJECT_REFETCH, CMD_OBJECT_UNMAP};
use crate::concurrency::{Duration, Instant};
use crate::errors::ObjectError;
use crate::node::LocalNode;
use crate::node_id::{NodeId, ObjectId};
use crate::queue::CommandQueue;

#[derive(Debug)]
struct Queued {
    mask: u64,
    data: Bytes,
    delta: bool,
}

#[derive(Debug)]
struct SlaveState {
    applied: u64,
    queued: BTreeMap<u64, Queued>,
    detached: bool,
}

/// The result of draining the pending-version queue
#[derive(Debug, Clone, Copy)]
pub(crate) struct ApplyOutcome {
    pub(crate) applied: u64,
    pub(crate) advanced: bool,
    /// Lowest still-queued delta version that cannot apply in order
    pub(crate) gap: Option<u64>,
}

/// Registry entry for a mapped slave instance
pub(crate) struct SlaveEntry {
    pub(crate) id: ObjectId,
    object: SharedObject,
    pub(crate) master: NodeId,
    pub(crate) instance_id: u32,
    state: Mutex<SlaveState>,
    arrivals: tokio::sync::Notify,
    custom: Arc<CommandQueue>,
}

impl SlaveEntry {
    pub(crate) fn new(
        id: ObjectId,
        object: SharedObject,
        master: NodeId,
        instance_id: u32,
    ) -> Self {
        Self {
            id,
            object,
            master,
            instance_id,
            state: Mutex::new(SlaveState {
                applied: 0,
                queued: BTreeMap::new(),
                detached: false,
            }),
            arrivals: tokio::sync::Notify::new(),
            custom: Arc::new(CommandQueue::new()),
        }
    }

    pub(crate) fn custom_queue(&self) -> Arc<CommandQueue> {
        self.custom.clone()
    }

    pub(crate) fn applied(&self) -> u64 {
        self.state.lock().expect("Slave lock poisoned").applied
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.state.lock().expect("Slave lock poisoned").detached
    }

    /// Queue an arrived version for later application
    pub(crate) fn queue_version(&self, payload: VersionPayload, delta: bool) {
        let mut state = self.state.lock().expect("Slave lock poisoned");
        if payload.version <= state.applied {
            tracing::trace!(
                "Dropping stale v{} for {} (at v{})",
                payload.version,
                self.id,
                state.applied
            );
            return;
        }
        state.queued.insert(
            payload.version,
            Queued {
                mask: payload.mask,
                data: payload.data,
                delta,
            },
        );
        drop(state);
        self.arrivals.notify_waiters();
    }

    /// Apply a full instance directly, jumping the version forward
    ///
    /// Used for the mapping baseline and for re-fetched instances.
    pub(crate) fn apply_instance(&self, payload: &VersionPayload) -> Result<(), ObjectError> {
        let mut state = self.state.lock().expect("Slave lock poisoned");
        if payload.version < state.applied {
            return Ok(());
        }
        let mut object = self.object.lock().expect("Object lock poisoned");
        let mut data = payload.data.clone();
        object
            .deserialize(payload.mask, &mut data)
            .map_err(|_| ObjectError::Corrupt(self.id))?;
        state.applied = payload.version;
        let obsolete = state
            .queued
            .range(..=payload.version)
            .map(|(version, _)| *version)
            .collect::<Vec<_>>();
        for version in obsolete {
            state.queued.remove(&version);
        }
        Ok(())
    }

    /// Apply every queued version that can apply now
    pub(crate) fn apply_ready(&self) -> Result<ApplyOutcome, ObjectError> {
        let mut state = self.state.lock().expect("Slave lock poisoned");
        let before = state.applied;
        let mut gap = None;

        loop {
            let next = state.queued.keys().next().copied();
            let Some(version) = next else { break };
            if version <= state.applied {
                state.queued.remove(&version);
                continue;
            }
            let is_gap = {
                let entry = state.queued.get(&version).expect("Queued entry vanished");
                entry.delta && version != state.applied + 1
            };
            if is_gap {
                gap = Some(version);
                break;
            }
            let entry = state.queued.remove(&version).expect("Queued entry vanished");
            let mut object = self.object.lock().expect("Object lock poisoned");
            let mut data = entry.data;
            object
                .deserialize(entry.mask, &mut data)
                .map_err(|_| ObjectError::Corrupt(self.id))?;
            drop(object);
            state.applied = version;
        }

        Ok(ApplyOutcome {
            applied: state.applied,
            advanced: state.applied != before,
            gap,
        })
    }

    /// Mark the master's node as gone; wakes any sync in progress
    pub(crate) fn detach(&self) {
        let mut state = self.state.lock().expect("Slave lock poisoned");
        state.detached = true;
        drop(state);
        self.arrivals.notify_waiters();
        self.custom.close();
    }
}

impl std::fmt::Debug for SlaveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveEntry")
            .field("id", &self.id)
            .field("master", &self.master)
            .field("instance_id", &self.instance_id)
            .field("applied", &self.applied())
            .finish()
    }
}

/// Handle to an object mapped from a remote master
///
/// Returned by [LocalNode::map_object]. Versions committed by the master
/// accumulate locally and take effect when the owning task calls
/// [SlaveObject::sync].
#[derive(Debug, Clone)]
pub struct SlaveObject {
    id: ObjectId,
    node: Arc<LocalNode>,
}

impl SlaveObject {
    pub(crate) fn new(id: ObjectId, node: Arc<LocalNode>) -> Self {
        Self { id, node }
    }

    /// The distributed identity of this object
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The version this slave has applied
    pub fn version(&self) -> Result<u64, ObjectError> {
        let entry = self
            .node
            .objects()
            .slave(self.id)
            .ok_or(ObjectError::NotMapped(self.id))?;
        Ok(entry.applied())
    }

    /// The queue receiving custom object commands addressed to this object
    pub fn command_queue(&self) -> Result<Arc<CommandQueue>, ObjectError> {
        let entry = self
            .node
            .objects()
            .slave(self.id)
            .ok_or(ObjectError::NotMapped(self.id))?;
        Ok(entry.custom_queue())
    }

    /// The node hosting the master instance
    pub fn master(&self) -> Result<NodeId, ObjectError> {
        let entry = self
            .node
            .objects()
            .slave(self.id)
            .ok_or(ObjectError::NotMapped(self.id))?;
        Ok(entry.master)
    }

    /// Apply queued versions until `version` is reached
    ///
    /// `version` may be [VERSION_HEAD] to apply whatever has arrived and
    /// return immediately. Each applied batch is acknowledged to the
    /// master. Fails with [ObjectError::Timeout] when the deadline passes
    /// first, and [ObjectError::MasterGone] when the master's node
    /// disconnects while waiting.
    pub async fn sync(
        &self,
        version: u64,
        timeout: Option<Duration>,
    ) -> Result<u64, ObjectError> {
        let entry = self
            .node
            .objects()
            .slave(self.id)
            .ok_or(ObjectError::NotMapped(self.id))?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // register for wakeups before checking, so an arrival between
            // the check and the wait is not lost
            let notified = entry.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let outcome = entry.apply_ready()?;
            if outcome.advanced {
                self.acknowledge(&entry, outcome.applied).await;
            }
            if let Some(missing) = outcome.gap {
                tracing::debug!(
                    "Delta gap on {} (have v{}, queued v{missing}), re-fetching",
                    self.id,
                    outcome.applied
                );
                self.refetch(&entry, deadline).await?;
                continue;
            }
            if version == VERSION_HEAD || outcome.applied >= version {
                return Ok(outcome.applied);
            }
            if entry.is_detached() {
                return Err(ObjectError::MasterGone(self.id));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(ObjectError::Timeout(self.id, version));
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Detach from the master and drop the local mapping
    pub async fn unmap(self) -> Result<(), ObjectError> {
        let entry = self
            .node
            .objects()
            .remove_slave(self.id)
            .ok_or(ObjectError::NotMapped(self.id))?;
        entry.detach();
        let cmd = Command::object(
            CMD_OBJECT_UNMAP,
            self.id,
            entry.instance_id,
            Bytes::new(),
        );
        if let Err(err) = self.node.send_to(entry.master, cmd).await {
            tracing::debug!("Unmap notification for {} not delivered: {err}", self.id);
        }
        Ok(())
    }

    async fn acknowledge(&self, entry: &SlaveEntry, version: u64) {
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(version);
        let cmd = Command::object(
            CMD_OBJECT_ACK,
            self.id,
            entry.instance_id,
            payload.freeze(),
        );
        if let Err(err) = self.node.send_to(entry.master, cmd).await {
            tracing::debug!("Ack for {} v{version} not delivered: {err}", self.id);
        }
    }

    /// Request a fresh full instance from the master to bridge a delta gap
    async fn refetch(
        &self,
        entry: &SlaveEntry,
        deadline: Option<Instant>,
    ) -> Result<(), ObjectError> {
        let ticket = self.node.requests().register(entry.master);
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32(ticket.id());
        let cmd = Command::object(
            CMD_OBJECT_REFETCH,
            self.id,
            entry.instance_id,
            payload.freeze(),
        );
        self.node
            .send_to(entry.master, cmd)
            .await
            .map_err(|err| ObjectError::Request(err.into()))?;

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let reply = self
            .node
            .wait_request(ticket, remaining)
            .await
            .map_err(ObjectError::Request)?;
        let instance =
            VersionPayload::decode(reply).ok_or(ObjectError::Corrupt(self.id))?;
        entry.apply_instance(&instance)?;
        self.acknowledge(entry, instance.version).await;
        Ok(())
    }
}
