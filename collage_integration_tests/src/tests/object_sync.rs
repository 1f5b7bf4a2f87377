// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Test object commit/sync across two nodes through the name registry.
//!
//! The serving node registers a counter object as master, binds it to a
//! well-known name, and commits a fixed number of versions once a peer
//! connected. The connecting node resolves the name, maps the counter and
//! syncs to the final version, verifying the replicated value. The server
//! exits once the client unmapped and disconnected.

use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use clap::Args;
use collage::concurrency::{sleep, Duration, Instant};
use collage::object::{ChangeType, CorruptPayload, Object, VERSION_FIRST};
use collage::{LocalNode, Session};

const COUNTER_NAME: &str = "sync-counter";
const COMMITS: u64 = 5;
const BASE_VALUE: u64 = 100;

/// Configuration
#[derive(Args, Debug, Clone)]
pub struct ObjectSyncConfig {
    /// Server port
    server_port: u16,
    /// If specified, represents the peer port to connect to
    client_port: Option<u16>,
    /// If specified, represents the peer host to connect to
    client_host: Option<String>,
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

    fn set(&mut self, value: u64) {
        self.value = value;
        self.dirty = true;
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

pub(crate) async fn test(config: ObjectSyncConfig) -> i32 {
    let node = super::listening_node(config.server_port).await;

    match config.client_port {
        Some(port) => slave(node, config.client_host, port).await,
        None => master(node).await,
    }
}

/// Serving side: commit versions, wait for the slave to finish
async fn master(node: Arc<LocalNode>) -> i32 {
    let data = Counter::shared(BASE_VALUE);
    let object = node.register_object(data.clone());
    let session = Session::new(node.clone(), node.id());
    session
        .register_name(COUNTER_NAME, object.id())
        .await
        .expect("Failed to bind counter name");

    let deadline = Instant::now() + Duration::from_secs(60);
    while node.peers().is_empty() {
        if Instant::now() >= deadline {
            tracing::error!("No peer connected");
            return -1;
        }
        sleep(Duration::from_millis(100)).await;
    }

    for commit in 1..=COMMITS {
        data.lock()
            .expect("Counter lock poisoned")
            .set(BASE_VALUE + commit);
        let version = match object.commit().await {
            Ok(version) => version,
            Err(err) => {
                tracing::error!("Commit {commit} failed: {err}");
                return -1;
            }
        };
        tracing::info!("Committed v{version}");
        sleep(Duration::from_millis(100)).await;
    }

    // the slave disconnects when it verified the final value
    while !node.peers().is_empty() {
        if Instant::now() >= deadline {
            tracing::error!("Peer never finished");
            return -1;
        }
        sleep(Duration::from_millis(100)).await;
    }
    node.shutdown().await;
    0
}

/// Connecting side: map the counter and sync to the final version
async fn slave(node: Arc<LocalNode>, host: Option<String>, port: u16) -> i32 {
    let peer = super::connect_peer(&node, host, port).await;
    let session = Session::new(node.clone(), peer.id());

    let Some(id) = super::resolve_retry(&session, COUNTER_NAME).await else {
        tracing::error!("Counter name never resolved");
        return -1;
    };

    let data = Counter::shared(0);
    let object = match node
        .map_object(data.clone(), id, peer.id(), Some(Duration::from_secs(10)))
        .await
    {
        Ok(object) => object,
        Err(err) => {
            tracing::error!("Failed to map counter: {err}");
            return -1;
        }
    };

    let target = VERSION_FIRST + COMMITS;
    match object.sync(target, Some(Duration::from_secs(30))).await {
        Ok(version) => tracing::info!("Synced to v{version}"),
        Err(err) => {
            tracing::error!("Sync to v{target} failed: {err}");
            return -1;
        }
    }

    let value = data.lock().expect("Counter lock poisoned").value;
    if value != BASE_VALUE + COMMITS {
        tracing::error!("Synced value {value} does not match the master");
        return -1;
    }

    object.unmap().await.expect("Failed to unmap");
    node.shutdown().await;
    0
}
