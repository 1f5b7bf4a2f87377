// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Test the command request/reply bridge between two nodes.
//!
//! The serving node registers an echo handler for a custom command and
//! waits until it has served ten pings. The connecting node issues ten
//! requests and verifies every echoed payload. Both sides exit zero on
//! success.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use clap::Args;
use collage::command::{Command, CMD_NODE_CUSTOM};
use collage::concurrency::{sleep, Duration, Instant};
use collage::errors::DispatchError;
use collage::{CommandQueue, LocalNode};
use futures::future::BoxFuture;

const CMD_PING: u32 = CMD_NODE_CUSTOM;
const ROUNDS: u64 = 10;

/// Configuration
#[derive(Args, Debug, Clone)]
pub struct PingPongConfig {
    /// Server port
    server_port: u16,
    /// If specified, represents the peer port to connect to
    client_port: Option<u16>,
    /// If specified, represents the peer host to connect to
    client_host: Option<String>,
}

pub(crate) async fn test(config: PingPongConfig) -> i32 {
    let node = super::listening_node(config.server_port).await;

    match config.client_port {
        Some(port) => ping(node, config.client_host, port).await,
        None => pong(node).await,
    }
}

/// Connecting side: issue requests and verify the echoes
async fn ping(node: Arc<LocalNode>, host: Option<String>, port: u16) -> i32 {
    let peer = super::connect_peer(&node, host, port).await;
    for round in 0..ROUNDS {
        let ticket = node.register_request(peer.id());
        let mut payload = BytesMut::new();
        payload.put_u32(ticket.id());
        payload.put_u64(round);
        if let Err(err) = node
            .send_to(peer.id(), Command::node(CMD_PING, payload.freeze()))
            .await
        {
            tracing::error!("Failed to send ping {round}: {err}");
            return -1;
        }
        let mut reply = match node.wait_request(ticket, Some(Duration::from_secs(10))).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!("Ping {round} failed: {err}");
                return -1;
            }
        };
        if reply.len() != 8 || reply.get_u64() != round {
            tracing::error!("Ping {round} echoed the wrong payload");
            return -1;
        }
        tracing::info!("Ping {round} echoed");
    }
    node.shutdown().await;
    0
}

/// Serving side: echo every ping until all rounds were served
async fn pong(node: Arc<LocalNode>) -> i32 {
    let served = Arc::new(AtomicU64::new(0));
    let counter = served.clone();
    let queue = Arc::new(CommandQueue::new());
    node.register_command(CMD_PING, queue.clone(), move |node, cmd| -> BoxFuture<
        'static,
        Result<(), DispatchError>,
    > {
        let counter = counter.clone();
        Box::pin(async move {
            let mut payload = cmd.payload();
            let request_id = payload.get_u32();
            let result = node.reply_request(cmd.origin(), request_id, payload).await;
            if result.is_ok() {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            result
        })
    })
    .expect("Failed to register ping handler");
    let consumer = node.serve_queue(queue);

    let deadline = Instant::now() + Duration::from_secs(60);
    while Instant::now() < deadline {
        if served.load(Ordering::Relaxed) >= ROUNDS {
            tracing::info!("Served {ROUNDS} pings");
            consumer.abort();
            node.shutdown().await;
            return 0;
        }
        sleep(Duration::from_millis(200)).await;
    }
    tracing::error!(
        "Timed out after serving {} pings",
        served.load(Ordering::Relaxed)
    );
    -1
}
