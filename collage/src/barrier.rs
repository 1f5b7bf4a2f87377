// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Distributed barrier built on the object layer
//!
//! The barrier is a replicated object: the master instance carries the
//! height (the number of participants per round) and collects entry
//! requests on its object command queue. [Barrier::enter] suspends the
//! caller until `height` participants have entered, at which point the
//! master releases them all by answering their requests.
//!
//! A barrier of height one is a no-op; the master participates like any
//! other node by sending its entry request to itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::command::{Command, CMD_BARRIER_ENTER, INSTANCE_NONE};
use crate::concurrency::{Duration, JoinHandle};
use crate::errors::ObjectError;
use crate::node::LocalNode;
use crate::node_id::{NodeId, ObjectId};
use crate::object::{
    ChangeType, CorruptPayload, MasterObject, Object, SlaveObject, VERSION_FIRST,
};
use crate::queue::CommandQueue;

/// Replicated barrier state: its height and master node
#[derive(Debug)]
pub struct BarrierData {
    height: u32,
    master: NodeId,
    dirty: bool,
}

impl BarrierData {
    fn new(height: u32, master: NodeId) -> Self {
        Self {
            height,
            master,
            dirty: false,
        }
    }

    /// Change the number of participants; takes effect on the next commit
    pub fn set_height(&mut self, height: u32) {
        self.height = height;
        self.dirty = true;
    }
}

impl Object for BarrierData {
    fn change_type(&self) -> ChangeType {
        ChangeType::Instance
    }

    fn dirty_mask(&self) -> u64 {
        u64::from(self.dirty)
    }

    fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn serialize(&self, mask: u64, out: &mut BytesMut) {
        if mask != 0 {
            out.put_u32(self.height);
            out.put_u128(self.master.value());
        }
    }

    fn deserialize(&mut self, mask: u64, data: &mut Bytes) -> Result<(), CorruptPayload> {
        if mask == 0 {
            return Ok(());
        }
        if data.len() < 20 {
            return Err(CorruptPayload);
        }
        self.height = data.get_u32();
        self.master = NodeId::from_value(data.get_u128());
        Ok(())
    }
}

enum Role {
    Master {
        handle: MasterObject,
        consumer: JoinHandle<()>,
    },
    Slave {
        handle: SlaveObject,
    },
}

/// One participant's handle on a distributed barrier
pub struct Barrier {
    node: Arc<LocalNode>,
    data: Arc<Mutex<BarrierData>>,
    role: Role,
}

impl Barrier {
    /// Create the barrier's master instance on this node
    pub fn master(node: &Arc<LocalNode>, height: u32) -> Result<Self, ObjectError> {
        let data = Arc::new(Mutex::new(BarrierData::new(height, node.id())));
        let handle = node.register_object(data.clone());
        let queue = handle.command_queue()?;
        let consumer = crate::concurrency::spawn(master_loop(
            node.clone(),
            queue,
            data.clone(),
        ));
        Ok(Self {
            node: node.clone(),
            data,
            role: Role::Master { handle, consumer },
        })
    }

    /// Join the barrier mastered on another node
    pub async fn join(
        node: &Arc<LocalNode>,
        id: ObjectId,
        master: NodeId,
        timeout: Option<Duration>,
    ) -> Result<Self, ObjectError> {
        let data = Arc::new(Mutex::new(BarrierData::new(0, master)));
        let handle = node.map_object(data.clone(), id, master, timeout).await?;
        Ok(Self {
            node: node.clone(),
            data,
            role: Role::Slave { handle },
        })
    }

    /// The barrier's distributed identity
    pub fn id(&self) -> ObjectId {
        match &self.role {
            Role::Master { handle, .. } => handle.id(),
            Role::Slave { handle } => handle.id(),
        }
    }

    /// The number of participants released together
    pub fn height(&self) -> u32 {
        self.data.lock().expect("Barrier lock poisoned").height
    }

    /// Commit a changed height to all joined participants (master only)
    pub async fn commit(&self) -> Result<u64, ObjectError> {
        match &self.role {
            Role::Master { handle, .. } => handle.commit().await,
            Role::Slave { handle } => Err(ObjectError::NotMaster(handle.id())),
        }
    }

    /// Apply height changes committed by the master (slave only)
    pub async fn sync(&self, timeout: Option<Duration>) -> Result<u64, ObjectError> {
        match &self.role {
            Role::Master { handle, .. } => handle.version(),
            Role::Slave { handle } => handle.sync(crate::object::VERSION_HEAD, timeout).await,
        }
    }

    /// Enter the barrier, returning once `height` participants entered
    pub async fn enter(&self, timeout: Option<Duration>) -> Result<(), ObjectError> {
        let (height, master) = {
            let data = self.data.lock().expect("Barrier lock poisoned");
            (data.height, data.master)
        };
        if height <= 1 {
            return Ok(());
        }

        let id = self.id();
        let round = match &self.role {
            Role::Master { handle, .. } => handle.version().unwrap_or(VERSION_FIRST),
            Role::Slave { handle } => handle.version().unwrap_or(VERSION_FIRST),
        };
        let ticket = self.node.register_request(master);
        let mut payload = BytesMut::with_capacity(12);
        payload.put_u32(ticket.id());
        payload.put_u64(round);
        let cmd = Command::object(CMD_BARRIER_ENTER, id, INSTANCE_NONE, payload.freeze());
        self.node
            .send_to(master, cmd)
            .await
            .map_err(|err| ObjectError::Request(err.into()))?;

        self.node
            .wait_request(ticket, timeout)
            .await
            .map(|_| ())
            .map_err(ObjectError::Request)
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        if let Role::Master { handle, consumer } = &self.role {
            consumer.abort();
            self.node.deregister_object(handle.id());
        }
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("id", &self.id())
            .field("height", &self.height())
            .finish()
    }
}

/// Collect entry requests per round and release each full round
async fn master_loop(
    node: Arc<LocalNode>,
    queue: Arc<CommandQueue>,
    data: Arc<Mutex<BarrierData>>,
) {
    let mut entered: HashMap<u64, Vec<(NodeId, u32)>> = HashMap::new();
    while let Some(cmd) = queue.pop(None).await {
        if cmd.command() != CMD_BARRIER_ENTER {
            tracing::warn!(
                "Ignoring command {:#06x} on barrier queue",
                cmd.command()
            );
            continue;
        }
        let mut payload = cmd.payload();
        if payload.len() < 12 {
            tracing::warn!("Ignoring malformed barrier entry from {}", cmd.origin());
            continue;
        }
        let request_id = payload.get_u32();
        let round = payload.get_u64();

        let waiting = entered.entry(round).or_default();
        waiting.push((cmd.origin(), request_id));
        let height = data.lock().expect("Barrier lock poisoned").height;
        tracing::trace!(
            "Barrier round {round}: {}/{height} entered",
            waiting.len()
        );
        if waiting.len() as u32 >= height {
            let released = entered.remove(&round).unwrap_or_default();
            for (target, request) in released {
                if let Err(err) = node.reply_request(target, request, Bytes::new()).await {
                    tracing::warn!("Failed to release {target} from barrier: {err}");
                }
            }
        }
    }
}
