// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! The local node: listeners, peers, dispatch and the object registry
//!
//! A [LocalNode] is one process's endpoint in the cluster. It listens on
//! the configured transports, performs the identity handshake with every
//! peer, runs one receive loop per connection, and routes every received
//! [Command] to its handler: internal node and session commands are handled
//! inline on the receive loop, object-partition commands go to the object
//! store, and application commands land on the [CommandQueue] they were
//! registered with.
//!
//! Sending to the local node's own id dispatches the command locally
//! through the exact same routing, so handlers cannot tell a loopback
//! command from a remote one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use futures::future::BoxFuture;

use super::requests::{RequestRegistry, RequestTicket};
use super::Node;
use crate::command::cache::BufferPool;
use crate::command::{
    is_object_command, Command, CommandHeader, CMD_NODE_CONNECT, CMD_NODE_CONNECT_ACK,
    CMD_NODE_CONNECT_REPLY, CMD_NODE_REPLY, CMD_NODE_STOP, CMD_OBJECT_MAP, CMD_SESSION_RESOLVE,
    CMD_SESSION_SET_NAME, HEADER_SIZE,
};
use crate::concurrency::{Duration, Instant, JoinHandle};
use crate::connection::{
    BufferConnection, Connection, ConnectionDescription, ConnectionKind, ConnectionReadHalf,
    ConnectionWriteHalf, Listener,
};
use crate::errors::{ConnectionError, DispatchError, ObjectError, RequestError};
use crate::instance_cache::InstanceCache;
use crate::node_id::{NodeId, ObjectId};
use crate::object::store::{decode_map_reply, encode_map_request, ObjectStore};
use crate::object::{MasterObject, SharedObject, SlaveObject, VERSION_HEAD, VERSION_NONE};
use crate::queue::CommandQueue;

/// Default instance cache capacity
const DEFAULT_CACHE_SIZE: u64 = 64 * 1024 * 1024;

/// Handler invoked for an application command popped off its queue
pub type CommandHandler =
    Arc<dyn Fn(Arc<LocalNode>, Command) -> BoxFuture<'static, Result<(), DispatchError>> + Send + Sync>;

/// Startup configuration of a [LocalNode]
#[derive(Debug, Clone)]
pub struct Config {
    /// Transports to listen on; ephemeral TCP ports are resolved at bind
    pub listeners: Vec<ConnectionDescription>,
    /// Instance cache capacity in payload bytes
    pub instance_cache_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listeners: vec![ConnectionDescription::tcp(crate::connection::default_host(), 0)],
            instance_cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

struct Registration {
    queue: Arc<CommandQueue>,
    handler: CommandHandler,
}

/// A connected peer: shared identity plus the exclusive write half
struct Peer {
    node: Arc<Node>,
    writer: tokio::sync::Mutex<ConnectionWriteHalf>,
    recv_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// This process's endpoint in the cluster
pub struct LocalNode {
    node: Arc<Node>,
    peers: DashMap<NodeId, Arc<Peer>>,
    dispatch: DashMap<u32, Registration>,
    requests: RequestRegistry,
    objects: ObjectStore,
    cache: InstanceCache,
    pool: BufferPool,
    command_queue: Arc<CommandQueue>,
    names: DashMap<String, ObjectId>,
    listen_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    queue_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    next_instance: AtomicU32,
    running: AtomicBool,
}

impl LocalNode {
    /// Create a node with a fresh random identity
    pub fn new(config: Config) -> Arc<Self> {
        let node = Arc::new(Node::with_id(NodeId::generate()));
        node.set_descriptions(config.listeners);
        Arc::new(Self {
            node,
            peers: DashMap::new(),
            dispatch: DashMap::new(),
            requests: RequestRegistry::new(),
            objects: ObjectStore::new(),
            cache: InstanceCache::new(config.instance_cache_size),
            pool: BufferPool::new(),
            command_queue: Arc::new(CommandQueue::new()),
            names: DashMap::new(),
            listen_tasks: std::sync::Mutex::new(Vec::new()),
            queue_tasks: std::sync::Mutex::new(Vec::new()),
            next_instance: AtomicU32::new(0),
            running: AtomicBool::new(true),
        })
    }

    /// This node's identity
    pub fn id(&self) -> NodeId {
        self.node.id()
    }

    /// The shared [Node] describing this process
    pub fn node(&self) -> Arc<Node> {
        self.node.clone()
    }

    /// The default queue receiving unrouted application commands
    pub fn command_queue(&self) -> Arc<CommandQueue> {
        self.command_queue.clone()
    }

    /// The node's instance cache
    pub fn instance_cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub(crate) fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    pub(crate) fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    pub(crate) fn requests(&self) -> &RequestRegistry {
        &self.requests
    }

    /// Whether `peer` currently has an established connection
    pub fn is_connected(&self, peer: NodeId) -> bool {
        self.peers.contains_key(&peer)
    }

    /// Identities of all currently connected peers
    pub fn peers(&self) -> Vec<NodeId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }

    // ------------------------ listening & connecting ----------------------- //

    /// Bind all configured listeners and start accepting peers
    ///
    /// Resolved ephemeral ports are written back into the node's
    /// descriptions, so peers learn real addresses from the handshake. Also
    /// starts the consumer of the default command queue.
    pub async fn listen(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let mut bound = Vec::new();
        let mut listeners = Vec::new();
        for description in self.node.descriptions() {
            if description.kind == ConnectionKind::Rsp {
                // multicast groups carry object data, not peer sessions
                tracing::warn!("Ignoring multicast listener {description}");
                continue;
            }
            let listener = Listener::bind(&description).await?;
            tracing::info!("Node {} listening on {}", self.id(), listener.description());
            bound.push(listener.description().clone());
            listeners.push(listener);
        }
        self.node.set_descriptions(bound);

        let mut tasks = self.listen_tasks.lock().expect("Listener lock poisoned");
        for listener in listeners {
            let node = self.clone();
            tasks.push(crate::concurrency::spawn(node.accept_loop(listener)));
        }
        let default_consumer = self.serve_queue(self.command_queue.clone());
        self.queue_tasks
            .lock()
            .expect("Queue task lock poisoned")
            .push(default_consumer);
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, mut listener: Listener) {
        loop {
            match listener.accept().await {
                Ok(connection) => {
                    let node = self.clone();
                    crate::concurrency::spawn(async move {
                        if let Err(err) = node.handshake_accept(connection).await {
                            tracing::warn!("Peer handshake failed: {err}");
                        }
                    });
                }
                Err(err) => {
                    if self.running.load(Ordering::Acquire) {
                        tracing::warn!("Listener failed: {err}");
                    }
                    return;
                }
            }
        }
    }

    /// Server side of the identity handshake
    async fn handshake_accept(
        self: Arc<Self>,
        mut connection: Connection,
    ) -> Result<(), ConnectionError> {
        let (header, payload) = read_frame_connected(&mut connection).await?;
        if header.command != CMD_NODE_CONNECT {
            tracing::warn!(
                "Dropping peer speaking command {:#06x} instead of a handshake",
                header.command
            );
            connection.close();
            return Ok(());
        }
        let Some((peer_id, descriptions)) = decode_greeting(payload) else {
            connection.close();
            return Err(ConnectionError::BadDescription(
                "Malformed handshake greeting".to_string(),
            ));
        };

        let reply = Command::node(CMD_NODE_CONNECT_REPLY, self.greeting());
        connection.send(&reply.encode()).await?;

        let (header, _ack) = read_frame_connected(&mut connection).await?;
        if header.command != CMD_NODE_CONNECT_ACK {
            connection.close();
            return Ok(());
        }

        let peer = Arc::new(Node::with_id(peer_id));
        peer.set_descriptions(descriptions);
        self.adopt_peer(peer, connection);
        Ok(())
    }

    /// Connect to a peer found at `description`
    ///
    /// Returns the peer's [Node] with its identity and listen descriptions
    /// learned in the handshake. Connecting twice to the same peer reuses
    /// the established connection.
    pub async fn connect_to(
        self: &Arc<Self>,
        description: &ConnectionDescription,
    ) -> Result<Arc<Node>, ConnectionError> {
        let mut connection = Connection::connect(description).await?;

        let hello = Command::node(CMD_NODE_CONNECT, self.greeting());
        connection.send(&hello.encode()).await?;

        let (header, payload) = read_frame_connected(&mut connection).await?;
        if header.command != CMD_NODE_CONNECT_REPLY {
            connection.close();
            return Err(ConnectionError::Closed);
        }
        let Some((peer_id, descriptions)) = decode_greeting(payload) else {
            connection.close();
            return Err(ConnectionError::BadDescription(
                "Malformed handshake greeting".to_string(),
            ));
        };

        let ack = Command::node(CMD_NODE_CONNECT_ACK, Bytes::new());
        connection.send(&ack.encode()).await?;

        let peer = Arc::new(Node::with_id(peer_id));
        peer.set_descriptions(descriptions);
        Ok(self.adopt_peer(peer, connection))
    }

    /// Connect to a peer via any of its known descriptions
    pub async fn connect_node(
        self: &Arc<Self>,
        node: &Arc<Node>,
    ) -> Result<Arc<Node>, ConnectionError> {
        if let Some(peer) = self.peers.get(&node.id()) {
            return Ok(peer.node.clone());
        }
        let mut last = ConnectionError::Closed;
        for description in node.descriptions() {
            match self.connect_to(&description).await {
                Ok(peer) => {
                    // stamp the learned identity onto the caller's handle
                    node.set_id(peer.id());
                    return Ok(peer);
                }
                Err(err) => {
                    tracing::debug!("Connect to {description} failed: {err}");
                    last = err;
                }
            }
        }
        Err(last)
    }

    /// Register an established connection and start its receive loop
    fn adopt_peer(self: &Arc<Self>, peer_node: Arc<Node>, mut connection: Connection) -> Arc<Node> {
        let peer_id = peer_node.id();
        if let Some(existing) = self.peers.get(&peer_id) {
            // simultaneous connect: first session wins
            tracing::debug!("Duplicate connection to {peer_id}, keeping the first");
            connection.close();
            return existing.node.clone();
        }
        let Some((read, write)) = connection.take_halves() else {
            return peer_node;
        };
        let peer = Arc::new(Peer {
            node: peer_node.clone(),
            writer: tokio::sync::Mutex::new(write),
            recv_task: std::sync::Mutex::new(None),
        });
        self.peers.insert(peer_id, peer.clone());

        let node = self.clone();
        let task = crate::concurrency::spawn(node.recv_loop(peer_id, read));
        *peer.recv_task.lock().expect("Peer lock poisoned") = Some(task);
        tracing::info!("Node {} connected peer {peer_id}", self.id());
        peer_node
    }

    async fn recv_loop(self: Arc<Self>, peer_id: NodeId, mut read: ConnectionReadHalf) {
        loop {
            let frame = read_frame(&mut read, &self.pool).await;
            let (header, payload) = match frame {
                Ok(frame) => frame,
                Err(ConnectionError::Closed) => break,
                Err(err) => {
                    tracing::warn!("Receive from {peer_id} failed: {err}");
                    break;
                }
            };
            let command = Command::from_parts(header, payload, peer_id);
            if let Err(err) = self.dispatch_command(command).await {
                tracing::warn!("Command {:#06x} from {peer_id}: {err}", header.command);
            }
        }
        self.handle_disconnect(peer_id);
    }

    /// Tear down all peer state after a connection ended
    fn handle_disconnect(&self, peer_id: NodeId) {
        let Some((_, peer)) = self.peers.remove(&peer_id) else {
            return;
        };
        tracing::info!("Node {} lost peer {peer_id}", self.id());
        if let Some(task) = peer.recv_task.lock().expect("Peer lock poisoned").take() {
            task.abort();
        }
        self.requests.fail_node(peer_id);
        self.objects.handle_disconnect(peer_id);
    }

    /// Disconnect a peer, notifying it first
    pub async fn disconnect(self: &Arc<Self>, peer_id: NodeId) {
        let stop = Command::node(CMD_NODE_STOP, Bytes::new());
        if let Err(err) = self.send_to(peer_id, stop).await {
            tracing::debug!("Stop notification for {peer_id} not delivered: {err}");
        }
        self.handle_disconnect(peer_id);
    }

    /// Stop listening, drop every peer and close all queues
    pub async fn shutdown(self: &Arc<Self>) {
        self.running.store(false, Ordering::Release);
        let peers = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        for peer in peers {
            self.disconnect(peer).await;
        }
        for task in self
            .listen_tasks
            .lock()
            .expect("Listener lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        self.command_queue.close();
        for task in self
            .queue_tasks
            .lock()
            .expect("Queue task lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        tracing::info!("Node {} shut down", self.id());
    }

    fn greeting(&self) -> Bytes {
        encode_greeting(self.id(), &self.node.descriptions())
    }

    // ----------------------------- dispatching ----------------------------- //

    /// Register a handler and delivery queue for an application command id
    pub fn register_command<F>(
        &self,
        command: u32,
        queue: Arc<CommandQueue>,
        handler: F,
    ) -> Result<(), DispatchError>
    where
        F: Fn(Arc<LocalNode>, Command) -> BoxFuture<'static, Result<(), DispatchError>>
            + Send
            + Sync
            + 'static,
    {
        match self.dispatch.entry(command) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(DispatchError::AlreadyRegistered(command))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Registration {
                    queue,
                    handler: Arc::new(handler),
                });
                Ok(())
            }
        }
    }

    /// Route one command to its destination
    ///
    /// Internal node and session commands are handled inline; object
    /// commands go to the object store; registered application commands are
    /// pushed onto their queue. A command id no peer agreed on is a
    /// protocol violation and aborts. The returned future is boxed because
    /// dispatch can recurse into itself through a loopback send.
    pub fn dispatch_command(
        self: &Arc<Self>,
        command: Command,
    ) -> BoxFuture<'static, Result<(), DispatchError>> {
        let node = self.clone();
        Box::pin(async move { node.dispatch_command_inner(command).await })
    }

    async fn dispatch_command_inner(self: Arc<Self>, command: Command) -> Result<(), DispatchError> {
        let id = command.command();
        if is_object_command(id) {
            return self.objects.handle_command(&self, command).await;
        }
        match id {
            CMD_NODE_REPLY => {
                let mut payload = command.payload();
                if payload.len() < 4 {
                    protocol_error(&command);
                }
                let request_id = payload.get_u32();
                self.requests.serve(request_id, payload);
                Ok(())
            }
            CMD_NODE_STOP => {
                self.handle_disconnect(command.origin());
                Ok(())
            }
            CMD_SESSION_SET_NAME => {
                let Some((name, object)) = decode_set_name(command.payload()) else {
                    protocol_error(&command);
                };
                tracing::debug!("Binding name '{name}' to {object}");
                self.names.insert(name, object);
                Ok(())
            }
            CMD_SESSION_RESOLVE => {
                let mut payload = command.payload();
                if payload.len() < 6 {
                    protocol_error(&command);
                }
                let request_id = payload.get_u32();
                let Some(name) = decode_string(&mut payload) else {
                    protocol_error(&command);
                };
                let found = self.names.get(&name).map(|entry| *entry.value());
                let mut reply = BytesMut::with_capacity(17);
                match found {
                    Some(object) => {
                        reply.put_u8(1);
                        reply.put_u128(object.value());
                    }
                    None => reply.put_u8(0),
                }
                self.reply_request(command.origin(), request_id, reply.freeze())
                    .await
            }
            _ => match self.dispatch.get(&id) {
                Some(registration) => {
                    registration.queue.push(command);
                    Ok(())
                }
                None => protocol_error(&command),
            },
        }
    }

    /// Spawn a consumer task popping `queue` and invoking handlers
    pub fn serve_queue(self: &Arc<Self>, queue: Arc<CommandQueue>) -> JoinHandle<()> {
        let node = self.clone();
        crate::concurrency::spawn(async move {
            while let Some(command) = queue.pop(None).await {
                node.invoke(command).await;
            }
        })
    }

    /// Run the registered handler for a queued command
    pub async fn invoke(self: &Arc<Self>, command: Command) {
        let handler = self
            .dispatch
            .get(&command.command())
            .map(|registration| registration.handler.clone());
        let Some(handler) = handler else {
            tracing::debug!("Dropping command {:#06x} after deregistration", command.command());
            return;
        };
        let id = command.command();
        let payload = command.payload();
        if let Err(err) = handler(self.clone(), command).await {
            tracing::warn!("Handler for {id:#06x} failed: {err}");
        }
        self.pool.release(payload);
    }

    // ------------------------------- sending ------------------------------- //

    /// Send a command to a peer, or loop it back when addressed to self
    pub async fn send_to(
        self: &Arc<Self>,
        target: NodeId,
        mut command: Command,
    ) -> Result<(), DispatchError> {
        if target == self.id() {
            command.set_origin(target);
            return self.dispatch_command(command).await;
        }

        let peer = self
            .peers
            .get(&target)
            .map(|entry| entry.value().clone())
            .ok_or(DispatchError::NodeUnreachable(target))?;
        let frame = command.encode();
        let result = peer.writer.lock().await.write_all(&frame).await;
        if let Err(err) = result {
            tracing::warn!("Send to {target} failed: {err}");
            self.handle_disconnect(target);
            return Err(DispatchError::Send(err));
        }
        Ok(())
    }

    /// Send several commands to one peer, batched into a single write
    ///
    /// Loopback targets dispatch each command in order. A transport failure
    /// tears the peer down like [LocalNode::send_to].
    pub async fn send_many(
        self: &Arc<Self>,
        target: NodeId,
        commands: Vec<Command>,
    ) -> Result<(), DispatchError> {
        if target == self.id() {
            for mut command in commands {
                command.set_origin(target);
                self.dispatch_command(command).await?;
            }
            return Ok(());
        }

        let peer = self
            .peers
            .get(&target)
            .map(|entry| entry.value().clone())
            .ok_or(DispatchError::NodeUnreachable(target))?;
        let mut batch = BufferConnection::new();
        for command in &commands {
            batch.write_all(&command.encode());
        }
        let mut writer = peer.writer.lock().await;
        if let Err(err) = batch.flush_into(&mut writer).await {
            drop(writer);
            tracing::warn!("Send to {target} failed: {err}");
            self.handle_disconnect(target);
            return Err(DispatchError::Send(err));
        }
        Ok(())
    }

    /// Send a command to every connected peer, returning the delivery count
    pub async fn multicast(self: &Arc<Self>, command: Command) -> usize {
        let targets = self
            .peers
            .iter()
            .map(|entry| *entry.key())
            .collect::<Vec<_>>();
        let mut delivered = 0;
        for target in targets {
            if self.send_to(target, command.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    // ------------------------------- requests ------------------------------ //

    /// Park a ticket for a reply from `target`
    pub fn register_request(&self, target: NodeId) -> RequestTicket {
        self.requests.register(target)
    }

    /// Await a reply, failing after `timeout` if one was given
    pub async fn wait_request(
        &self,
        ticket: RequestTicket,
        timeout: Option<Duration>,
    ) -> Result<Bytes, RequestError> {
        match timeout {
            None => ticket.wait().await,
            Some(timeout) => {
                let id = ticket.id();
                match crate::concurrency::timeout(timeout, ticket.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.requests.forget(id);
                        Err(RequestError::Timeout)
                    }
                }
            }
        }
    }

    /// Await a reply while serving commands arriving on `queue`
    ///
    /// For callers that both issue a request and own the queue its reply
    /// depends on: the queue keeps draining while the caller waits, so two
    /// nodes requesting each other's service on the same queue make
    /// progress instead of deadlocking.
    pub async fn wait_request_pumping(
        self: &Arc<Self>,
        ticket: RequestTicket,
        timeout: Option<Duration>,
        queue: &CommandQueue,
    ) -> Result<Bytes, RequestError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let ticket_id = ticket.id();
        let wait = ticket.wait();
        tokio::pin!(wait);
        loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.requests.forget(ticket_id);
                        return Err(RequestError::Timeout);
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            tokio::select! {
                result = &mut wait => return result,
                command = queue.pop(remaining) => match command {
                    Some(command) => self.invoke(command).await,
                    None => {
                        self.requests.forget(ticket_id);
                        return Err(RequestError::Timeout);
                    }
                },
            }
        }
    }

    /// Deliver a request's reply back to its issuer
    pub async fn reply_request(
        self: &Arc<Self>,
        target: NodeId,
        request_id: u32,
        result: Bytes,
    ) -> Result<(), DispatchError> {
        if target == self.id() {
            self.requests.serve(request_id, result);
            return Ok(());
        }
        let mut payload = BytesMut::with_capacity(4 + result.len());
        payload.put_u32(request_id);
        payload.extend_from_slice(&result);
        self.send_to(target, Command::node(CMD_NODE_REPLY, payload.freeze()))
            .await
    }

    // ------------------------------- objects ------------------------------- //

    /// Register `object` as a master instance with a fresh distributed id
    pub fn register_object(self: &Arc<Self>, object: SharedObject) -> MasterObject {
        let id = ObjectId::generate();
        self.objects.register_master(id, object);
        tracing::debug!("Registered master object {id}");
        MasterObject::new(id, self.clone())
    }

    /// Remove a master instance; its slaves keep their last applied state
    pub fn deregister_object(&self, id: ObjectId) -> bool {
        self.objects.deregister_master(id).is_some()
    }

    /// Map `object` as a slave of the master instance on `master`
    ///
    /// Fetches the baseline instance (from the local cache when current,
    /// from the master otherwise) and applies it before returning.
    pub async fn map_object(
        self: &Arc<Self>,
        object: SharedObject,
        id: ObjectId,
        master: NodeId,
        timeout: Option<Duration>,
    ) -> Result<SlaveObject, ObjectError> {
        let instance_id = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let cached = self.cache.latest_version(id).unwrap_or(VERSION_NONE);

        // install the slave entry before the map request leaves, so versions
        // racing the map reply are queued instead of dropped
        let entry = Arc::new(crate::object::slave::SlaveEntry::new(
            id,
            object,
            master,
            instance_id,
        ));
        self.objects.insert_slave(entry.clone());

        let applied = self
            .fetch_baseline(id, master, instance_id, cached, timeout)
            .await
            .and_then(|baseline| {
                entry.apply_instance(&baseline)?;
                Ok(baseline.version)
            });
        let version = match applied {
            Ok(version) => version,
            Err(err) => {
                let _ = self.objects.remove_slave(id);
                return Err(err);
            }
        };
        tracing::debug!("Mapped {id} at v{version} from {master} (instance {instance_id})");
        Ok(SlaveObject::new(id, self.clone()))
    }

    /// Fetch the map baseline, from the cache when the master says it is
    /// current and from the map reply otherwise
    async fn fetch_baseline(
        self: &Arc<Self>,
        id: ObjectId,
        master: NodeId,
        instance_id: u32,
        cached: u64,
        timeout: Option<Duration>,
    ) -> Result<crate::object::VersionPayload, ObjectError> {
        let ticket = self.requests.register(master);
        let request = Command::object(
            CMD_OBJECT_MAP,
            id,
            instance_id,
            encode_map_request(ticket.id(), instance_id, VERSION_HEAD, cached),
        );
        if let Err(err) = self.send_to(master, request).await {
            self.requests.forget(ticket.id());
            return Err(ObjectError::Request(err.into()));
        }
        let reply = self
            .wait_request(ticket, timeout)
            .await
            .map_err(ObjectError::Request)?;

        match decode_map_reply(id, reply)? {
            Some(instance) => {
                self.cache.add((id, instance.version), instance.encode());
                Ok(instance)
            }
            None => {
                // the master confirmed our cached instance is current
                let key = (id, cached);
                let raw = self.cache.pin(&key).ok_or(ObjectError::MapFailed(id))?;
                let instance = crate::object::VersionPayload::decode(raw)
                    .ok_or(ObjectError::Corrupt(id));
                self.cache.release(&key);
                instance
            }
        }
    }

    // ------------------------------- sessions ------------------------------ //

    pub(crate) fn names(&self) -> &DashMap<String, ObjectId> {
        &self.names
    }
}

impl std::fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNode")
            .field("id", &self.id())
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// A command no registered handler exists for means the peers disagree
/// about the protocol itself; there is no way to continue. Aborts rather
/// than panics so the violation cannot be swallowed by a task boundary.
fn protocol_error(command: &Command) -> ! {
    tracing::error!(
        "Protocol error: no handler for command {:#06x} from {}",
        command.command(),
        command.origin()
    );
    std::process::abort();
}

/// Read one full frame from a split read half, payload from the pool
async fn read_frame(
    read: &mut ConnectionReadHalf,
    pool: &BufferPool,
) -> Result<(CommandHeader, Bytes), ConnectionError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    read.read_exact(&mut header_bytes).await?;
    let header = CommandHeader::decode(&header_bytes);
    if (header.size as usize) < HEADER_SIZE {
        tracing::error!("Protocol error: frame size {} below header size", header.size);
        std::process::abort();
    }
    let length = header.size as usize - HEADER_SIZE;
    let mut payload = pool.alloc(length);
    payload.resize(length, 0);
    read.read_exact(&mut payload).await?;
    Ok((header, payload.freeze()))
}

/// Read one full frame from an unsplit connection (handshake phase)
async fn read_frame_connected(
    connection: &mut Connection,
) -> Result<(CommandHeader, Bytes), ConnectionError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    connection.recv_exact(&mut header_bytes).await?;
    let header = CommandHeader::decode(&header_bytes);
    if (header.size as usize) < HEADER_SIZE {
        tracing::error!("Protocol error: frame size {} below header size", header.size);
        std::process::abort();
    }
    let length = header.size as usize - HEADER_SIZE;
    let mut payload = vec![0u8; length];
    connection.recv_exact(&mut payload).await?;
    Ok((header, Bytes::from(payload)))
}

/// Handshake greeting: identity plus listen descriptions
fn encode_greeting(id: NodeId, descriptions: &[ConnectionDescription]) -> Bytes {
    let mut out = BytesMut::new();
    out.put_u128(id.value());
    out.put_u16(descriptions.len() as u16);
    for description in descriptions {
        let text = description.to_string();
        out.put_u16(text.len() as u16);
        out.extend_from_slice(text.as_bytes());
    }
    out.freeze()
}

fn decode_greeting(mut payload: Bytes) -> Option<(NodeId, Vec<ConnectionDescription>)> {
    if payload.len() < 18 {
        return None;
    }
    let id = NodeId::from_value(payload.get_u128());
    let count = payload.get_u16();
    let mut descriptions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let text = decode_string(&mut payload)?;
        match ConnectionDescription::from_string(&text) {
            Ok(description) => descriptions.push(description),
            Err(err) => {
                tracing::debug!("Skipping peer description '{text}': {err}");
            }
        }
    }
    Some((id, descriptions))
}

fn decode_string(payload: &mut Bytes) -> Option<String> {
    if payload.len() < 2 {
        return None;
    }
    let length = payload.get_u16() as usize;
    if payload.len() < length {
        return None;
    }
    let raw = payload.split_to(length);
    String::from_utf8(raw.to_vec()).ok()
}

fn decode_set_name(mut payload: Bytes) -> Option<(String, ObjectId)> {
    let name = decode_string(&mut payload)?;
    if payload.len() < 16 {
        return None;
    }
    Some((name, ObjectId::from_value(payload.get_u128())))
}

pub(crate) fn encode_set_name(name: &str, object: ObjectId) -> Bytes {
    let mut out = BytesMut::with_capacity(2 + name.len() + 16);
    out.put_u16(name.len() as u16);
    out.extend_from_slice(name.as_bytes());
    out.put_u128(object.value());
    out.freeze()
}
