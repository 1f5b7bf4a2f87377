// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! End-to-end node tests over real TCP connections

use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::future::BoxFuture;

use super::{Config, LocalNode, Node};
use crate::barrier::Barrier;
use crate::command::{Command, CMD_NODE_CUSTOM};
use crate::concurrency::Duration;
use crate::connection::ConnectionDescription;
use crate::errors::{DispatchError, ObjectError};
use crate::object::{ChangeType, CorruptPayload, Object, VERSION_FIRST};
use crate::session::Session;

const CMD_PING: u32 = CMD_NODE_CUSTOM;

fn test_config() -> Config {
    Config {
        listeners: vec![ConnectionDescription::tcp("127.0.0.1", 0)],
        ..Default::default()
    }
}

/// Two listening nodes with an established client-to-server connection
async fn connected_pair() -> (Arc<LocalNode>, Arc<LocalNode>, Arc<Node>) {
    let server = LocalNode::new(test_config());
    server.listen().await.expect("Failed to listen");
    let client = LocalNode::new(test_config());
    client.listen().await.expect("Failed to listen");

    let description = server.node().descriptions()[0].clone();
    let peer = client
        .connect_to(&description)
        .await
        .expect("Failed to connect");
    (server, client, peer)
}

async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        crate::concurrency::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for: {what}");
}

struct Counter {
    value: u64,
    dirty: bool,
}

impl Counter {
    fn shared(value: u64) -> Arc<Mutex<Counter>> {
        Arc::new(Mutex::new(Counter {
            value,
            dirty: false,
        }))
    }
}

impl Object for Counter {
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
            out.put_u64(self.value);
        }
    }

    fn deserialize(&mut self, mask: u64, data: &mut Bytes) -> Result<(), CorruptPayload> {
        if mask != 0 {
            if data.len() < 8 {
                return Err(CorruptPayload);
            }
            self.value = data.get_u64();
        }
        Ok(())
    }
}

#[tokio::test]
async fn handshake_exchanges_identities() {
    let (server, client, peer) = connected_pair().await;
    assert_eq!(peer.id(), server.id());
    assert!(!peer.descriptions().is_empty());
    assert!(client.is_connected(server.id()));
    wait_until("server sees client", || server.is_connected(client.id())).await;
}

#[tokio::test]
async fn request_reply_round_trip() {
    let (server, client, _peer) = connected_pair().await;

    server
        .register_command(CMD_PING, server.command_queue(), |node, cmd| -> BoxFuture<
            'static,
            Result<(), DispatchError>,
        > {
            Box::pin(async move {
                let mut payload = cmd.payload();
                let request_id = payload.get_u32();
                node.reply_request(cmd.origin(), request_id, payload).await
            })
        })
        .expect("Failed to register handler");

    let ticket = client.register_request(server.id());
    let mut payload = BytesMut::new();
    payload.put_u32(ticket.id());
    payload.extend_from_slice(b"ping");
    client
        .send_to(server.id(), Command::node(CMD_PING, payload.freeze()))
        .await
        .expect("Failed to send");

    let reply = client
        .wait_request(ticket, Some(Duration::from_secs(5)))
        .await
        .expect("Request failed");
    assert_eq!(reply, "ping");
}

#[tokio::test]
async fn second_handler_for_a_command_is_rejected() {
    let node = LocalNode::new(test_config());
    let queue = Arc::new(crate::queue::CommandQueue::new());
    node.register_command(CMD_PING, queue.clone(), |_, _| -> BoxFuture<
        'static,
        Result<(), DispatchError>,
    > { Box::pin(async { Ok(()) }) })
        .expect("Failed to register handler");

    let again = node.register_command(CMD_PING, queue, |_, _| -> BoxFuture<
        'static,
        Result<(), DispatchError>,
    > { Box::pin(async { Ok(()) }) });
    assert!(matches!(again, Err(DispatchError::AlreadyRegistered(_))));
}

#[tokio::test]
async fn loopback_requests_resolve_through_local_dispatch() {
    let node = LocalNode::new(test_config());
    node.listen().await.expect("Failed to listen");

    node.register_command(CMD_PING, node.command_queue(), |node, cmd| -> BoxFuture<
        'static,
        Result<(), DispatchError>,
    > {
        Box::pin(async move {
            let mut payload = cmd.payload();
            let request_id = payload.get_u32();
            node.reply_request(cmd.origin(), request_id, payload).await
        })
    })
    .expect("Failed to register handler");

    let ticket = node.register_request(node.id());
    let mut payload = BytesMut::new();
    payload.put_u32(ticket.id());
    payload.extend_from_slice(b"self");
    node.send_to(node.id(), Command::node(CMD_PING, payload.freeze()))
        .await
        .expect("Failed to send");

    let reply = node
        .wait_request(ticket, Some(Duration::from_secs(5)))
        .await
        .expect("Request failed");
    assert_eq!(reply, "self");
}

#[tokio::test]
async fn connect_node_learns_the_peer_identity() {
    let server = LocalNode::new(test_config());
    server.listen().await.expect("Failed to listen");
    let client = LocalNode::new(test_config());
    client.listen().await.expect("Failed to listen");

    let handle = Arc::new(Node::from_description(
        server.node().descriptions()[0].clone(),
    ));
    assert_eq!(handle.id(), crate::node_id::NodeId::ZERO);

    let peer = client
        .connect_node(&handle)
        .await
        .expect("Failed to connect");
    assert_eq!(peer.id(), server.id());
    assert_eq!(handle.id(), server.id());

    // connecting again reuses the established session
    let again = client
        .connect_node(&handle)
        .await
        .expect("Failed to reconnect");
    assert_eq!(again.id(), server.id());
}

#[tokio::test]
async fn pumping_wait_serves_commands_the_reply_depends_on() {
    const CMD_QUERY: u32 = CMD_NODE_CUSTOM + 1;

    let (server, client, _peer) = connected_pair().await;
    wait_until("server sees client", || server.is_connected(client.id())).await;

    // the server answers a ping only after querying the requester back
    server
        .register_command(CMD_PING, server.command_queue(), |node, cmd| -> BoxFuture<
            'static,
            Result<(), DispatchError>,
        > {
            Box::pin(async move {
                let mut payload = cmd.payload();
                let request_id = payload.get_u32();
                let ticket = node.register_request(cmd.origin());
                let mut query = BytesMut::new();
                query.put_u32(ticket.id());
                node.send_to(cmd.origin(), Command::node(CMD_QUERY, query.freeze()))
                    .await?;
                let answer = node
                    .wait_request(ticket, Some(Duration::from_secs(5)))
                    .await
                    .expect("Callback failed");
                node.reply_request(cmd.origin(), request_id, answer).await
            })
        })
        .expect("Failed to register handler");

    // the client answers queries on a queue only its waiting task drains
    let queries = Arc::new(crate::queue::CommandQueue::new());
    client
        .register_command(CMD_QUERY, queries.clone(), |node, cmd| -> BoxFuture<
            'static,
            Result<(), DispatchError>,
        > {
            Box::pin(async move {
                let mut payload = cmd.payload();
                let request_id = payload.get_u32();
                node.reply_request(cmd.origin(), request_id, Bytes::from_static(b"answer"))
                    .await
            })
        })
        .expect("Failed to register handler");

    let ticket = client.register_request(server.id());
    let mut payload = BytesMut::new();
    payload.put_u32(ticket.id());
    client
        .send_to(server.id(), Command::node(CMD_PING, payload.freeze()))
        .await
        .expect("Failed to send");

    // a plain wait would starve here: the reply depends on the query being
    // served, and only this task drains the query queue
    let reply = client
        .wait_request_pumping(ticket, Some(Duration::from_secs(5)), &queries)
        .await
        .expect("Request failed");
    assert_eq!(reply, "answer");
}

#[tokio::test]
async fn batched_sends_arrive_in_order() {
    let (server, client, _peer) = connected_pair().await;
    wait_until("server sees client", || server.is_connected(client.id())).await;

    let received = Arc::new(crate::queue::CommandQueue::new());
    client
        .register_command(CMD_PING, received.clone(), |_, _| -> BoxFuture<
            'static,
            Result<(), DispatchError>,
        > { Box::pin(async { Ok(()) }) })
        .expect("Failed to register handler");

    server
        .send_many(
            client.id(),
            vec![
                Command::node(CMD_PING, Bytes::from_static(b"first")),
                Command::node(CMD_PING, Bytes::from_static(b"second")),
            ],
        )
        .await
        .expect("Failed to send");

    for expected in ["first", "second"] {
        let command = received
            .pop(Some(Duration::from_secs(5)))
            .await
            .expect("Nothing received");
        assert_eq!(command.payload(), expected);
    }
}

#[tokio::test]
async fn commit_and_sync_across_nodes() {
    let (server, client, peer) = connected_pair().await;
    wait_until("server sees client", || server.is_connected(client.id())).await;

    let master_data = Counter::shared(0);
    let master = server.register_object(master_data.clone());

    let slave_data = Counter::shared(0);
    let slave = client
        .map_object(
            slave_data.clone(),
            master.id(),
            peer.id(),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("Failed to map");

    {
        let mut data = master_data.lock().expect("Object lock poisoned");
        data.value = 1234;
        data.dirty = true;
    }
    let committed = master.commit().await.expect("Commit failed");
    assert_eq!(committed, VERSION_FIRST + 1);

    let synced = slave
        .sync(committed, Some(Duration::from_secs(5)))
        .await
        .expect("Sync failed");
    assert_eq!(synced, committed);
    assert_eq!(
        slave_data.lock().expect("Object lock poisoned").value,
        1234
    );
}

#[tokio::test]
async fn sync_fails_when_the_master_node_dies() {
    let (server, client, peer) = connected_pair().await;
    wait_until("server sees client", || server.is_connected(client.id())).await;

    let master = server.register_object(Counter::shared(7));
    let slave = client
        .map_object(
            Counter::shared(0),
            master.id(),
            peer.id(),
            Some(Duration::from_secs(5)),
        )
        .await
        .expect("Failed to map");

    server.shutdown().await;

    let result = slave
        .sync(VERSION_FIRST + 1, Some(Duration::from_secs(5)))
        .await;
    assert!(matches!(result, Err(ObjectError::MasterGone(_))));
}

#[tokio::test]
async fn names_resolve_across_nodes() {
    let (server, client, peer) = connected_pair().await;

    let object = crate::node_id::ObjectId::generate();
    let server_session = Session::new(server.clone(), server.id());
    server_session
        .register_name("scene", object)
        .await
        .expect("Failed to bind name");

    let client_session = Session::new(client.clone(), peer.id());
    let resolved = client_session
        .resolve("scene", Some(Duration::from_secs(5)))
        .await
        .expect("Resolve failed");
    assert_eq!(resolved, Some(object));

    let missing = client_session
        .resolve("nothing", Some(Duration::from_secs(5)))
        .await
        .expect("Resolve failed");
    assert_eq!(missing, None);
}

#[tokio::test]
async fn barrier_releases_all_participants_together() {
    let (server, client, peer) = connected_pair().await;
    wait_until("server sees client", || server.is_connected(client.id())).await;

    let master = Barrier::master(&server, 2).expect("Failed to create barrier");
    let joined = Barrier::join(&client, master.id(), peer.id(), Some(Duration::from_secs(5)))
        .await
        .expect("Failed to join barrier");
    assert_eq!(joined.height(), 2);

    let entering = crate::concurrency::spawn(async move {
        joined.enter(Some(Duration::from_secs(5))).await
    });
    // the second entrant releases both
    master
        .enter(Some(Duration::from_secs(5)))
        .await
        .expect("Master enter failed");
    entering
        .await
        .expect("Enter task panicked")
        .expect("Joined enter failed");
}

#[tokio::test]
async fn barrier_of_height_one_is_trivial() {
    let node = LocalNode::new(test_config());
    let barrier = Barrier::master(&node, 1).expect("Failed to create barrier");
    barrier
        .enter(Some(Duration::from_millis(100)))
        .await
        .expect("Enter failed");
}

#[tokio::test]
async fn multicast_reaches_every_peer() {
    let (server, client, _peer) = connected_pair().await;
    wait_until("server sees client", || server.is_connected(client.id())).await;

    let received = Arc::new(crate::queue::CommandQueue::new());
    client
        .register_command(CMD_PING, received.clone(), |_, _| -> BoxFuture<
            'static,
            Result<(), DispatchError>,
        > { Box::pin(async { Ok(()) }) })
        .expect("Failed to register handler");

    let delivered = server
        .multicast(Command::node(CMD_PING, Bytes::from_static(b"hello all")))
        .await;
    assert_eq!(delivered, 1);

    let command = received
        .pop(Some(Duration::from_secs(5)))
        .await
        .expect("Nothing received");
    assert_eq!(command.payload(), "hello all");
    assert_eq!(command.origin(), server.id());
}
