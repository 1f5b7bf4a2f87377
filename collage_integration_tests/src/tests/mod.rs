// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Different test scenarios are defined here

use std::sync::Arc;

use clap::Parser;
use collage::{Config, ConnectionDescription, LocalNode, Node};

pub mod object_sync;
pub mod ping_pong;

#[derive(Parser, Debug, Clone)]
pub enum TestCase {
    /// Test command request/reply between two nodes
    PingPong(ping_pong::PingPongConfig),
    /// Test object commit/sync through the name registry
    ObjectSync(object_sync::ObjectSyncConfig),
    /// Test the distributed barrier
    Barrier(barrier::BarrierConfig),
    /// Not-a-Node: Don't run any test and exit this node with code 0
    Nan,
}

pub async fn run(case: TestCase) -> i32 {
    match case {
        TestCase::PingPong(config) => ping_pong::test(config).await,
        TestCase::ObjectSync(config) => object_sync::test(config).await,
        TestCase::Barrier(config) => barrier::test(config).await,
        TestCase::Nan => 0,
    }
}

/// Start a node listening on `port` (zero picks an ephemeral port)
pub(crate) async fn listening_node(port: u16) -> Arc<LocalNode> {
    let node = LocalNode::new(Config {
        listeners: vec![ConnectionDescription::tcp("127.0.0.1", port)],
        ..Config::default()
    });
    node.listen().await.expect("Failed to listen");
    node
}

/// Resolve `name` against the session registry, retrying while the
/// serving side may still be binding it
pub(crate) async fn resolve_retry(
    session: &collage::Session,
    name: &str,
) -> Option<collage::ObjectId> {
    for _ in 0..100 {
        match session
            .resolve(name, Some(collage::concurrency::Duration::from_secs(1)))
            .await
        {
            Ok(Some(id)) => return Some(id),
            Ok(None) => {}
            Err(err) => tracing::debug!("Resolve of '{name}' failed: {err}"),
        }
        collage::concurrency::sleep(collage::concurrency::Duration::from_millis(200)).await;
    }
    None
}

/// Connect `node` to the peer serving on `host`:`port`
pub(crate) async fn connect_peer(
    node: &Arc<LocalNode>,
    host: Option<String>,
    port: u16,
) -> Arc<Node> {
    let host = host.unwrap_or_else(|| "127.0.0.1".to_string());
    let description = ConnectionDescription::tcp(host, port);
    node.connect_to(&description)
        .await
        .expect("Failed to connect to peer")
}
