// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Reliable multicast (RSP) over UDP
//!
//! A UDP multicast group does not guarantee delivery or ordering; this
//! module layers application-level reliability on top so that each logical
//! sender is observed as an ordered, loss-free byte stream:
//!
//! - every data datagram carries a per-sender sequence number,
//! - receivers reassemble per-sender streams in sequence order and
//!   periodically acknowledge the highest contiguous sequence seen,
//! - receivers request missing sequences (NACK) once a gap persists past an
//!   ack interval,
//! - senders retain sent datagrams in a bounded retransmit window and
//!   replay them on NACK; the window only advances past datagrams every
//!   known receiver has acknowledged, so a sender can never outrun the
//!   group's slowest receiver by more than the window size.
//!
//! Joining a group yields an [RspGroup]: a shared write half that fans out
//! to all receivers, and an accept stream producing one read half per
//! discovered remote sender.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::description::ConnectionDescription;
use crate::concurrency::{Duration, Instant, JoinHandle};
use crate::errors::ConnectionError;

/// Payload bytes per datagram
const MTU: usize = 1350;
/// Retransmit window size in datagrams
const WINDOW_SIZE: usize = 128;
/// Ack/NACK timer period
const ACK_INTERVAL: Duration = Duration::from_millis(10);
/// Receivers silent for this long are dropped from the ack bookkeeping
const ACKER_TIMEOUT: Duration = Duration::from_secs(5);
/// Outgoing chunk channel depth
const SEND_DEPTH: usize = 32;

const KIND_DATA: u8 = 0;
const KIND_ACK: u8 = 1;
const KIND_NACK: u8 = 2;

// ========================= sender-side window ========================= //

/// Bounded buffer of sent-but-unacknowledged datagrams
///
/// Acknowledgements are tracked per receiver: a datagram leaves the window
/// only once every known receiver has acknowledged it, so the slowest
/// receiver can always be repaired. A receiver becomes known by its first
/// ack; one silent for longer than [ACKER_TIMEOUT] is expired so a
/// departed node cannot pin the window.
#[derive(Debug, Default)]
pub(crate) struct RspWindow {
    next_seq: u64,
    pending: VecDeque<(u64, Bytes)>,
    ackers: HashMap<u64, Acker>,
}

#[derive(Debug)]
struct Acker {
    acked: u64,
    last_heard: Instant,
}

impl RspWindow {
    /// Whether another datagram may be sent
    pub(crate) fn has_room(&self) -> bool {
        self.pending.len() < WINDOW_SIZE
    }

    /// Record an outgoing datagram, returning its sequence number
    pub(crate) fn push(&mut self, payload: Bytes) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back((seq, payload));
        seq
    }

    /// Record `acker`'s highest contiguous sequence and advance the window
    /// to the slowest receiver's progress
    pub(crate) fn acknowledge(&mut self, acker: u64, seq: u64) {
        let now = Instant::now();
        let entry = self.ackers.entry(acker).or_insert(Acker {
            acked: seq,
            last_heard: now,
        });
        entry.acked = entry.acked.max(seq);
        entry.last_heard = now;
        self.trim();
    }

    /// Forget receivers not heard from within `max_age`. With no receivers
    /// left the pending datagrams have nobody to be repaired for and are
    /// dropped.
    pub(crate) fn expire_ackers(&mut self, max_age: Duration) {
        if self.ackers.is_empty() {
            return;
        }
        let now = Instant::now();
        self.ackers
            .retain(|_, acker| now.duration_since(acker.last_heard) <= max_age);
        if self.ackers.is_empty() {
            self.pending.clear();
        } else {
            self.trim();
        }
    }

    /// Look up a datagram for retransmission; [None] once every receiver
    /// acknowledged it
    pub(crate) fn retransmit(&self, seq: u64) -> Option<Bytes> {
        self.pending
            .iter()
            .find(|(pending_seq, _)| *pending_seq == seq)
            .map(|(_, payload)| payload.clone())
    }

    /// Drop all datagrams every known receiver has acknowledged
    fn trim(&mut self) {
        let Some(lowest) = self.ackers.values().map(|acker| acker.acked).min() else {
            return;
        };
        while let Some((front, _)) = self.pending.front() {
            if *front > lowest {
                break;
            }
            self.pending.pop_front();
        }
    }
}

// ======================== receiver-side reorder ======================== //

/// Per-sender sequence reassembly
#[derive(Debug, Default)]
pub(crate) struct RspReorder {
    next_seq: u64,
    out_of_order: BTreeMap<u64, Bytes>,
}

impl RspReorder {
    /// Insert a received datagram; returns the chunks which became
    /// deliverable in order. Duplicates and already-delivered sequences are
    /// ignored.
    pub(crate) fn insert(&mut self, seq: u64, payload: Bytes) -> Vec<Bytes> {
        if seq < self.next_seq {
            return Vec::new();
        }
        self.out_of_order.entry(seq).or_insert(payload);

        let mut ready = Vec::new();
        while let Some(payload) = self.out_of_order.remove(&self.next_seq) {
            ready.push(payload);
            self.next_seq += 1;
        }
        ready
    }

    /// Highest contiguous sequence delivered, as an acknowledgement value.
    /// [None] until the first datagram was delivered.
    pub(crate) fn ack_seq(&self) -> Option<u64> {
        self.next_seq.checked_sub(1)
    }

    /// The sequence numbers missing below the highest one seen
    pub(crate) fn missing(&self) -> Vec<u64> {
        let mut gaps = Vec::new();
        let mut expect = self.next_seq;
        for seq in self.out_of_order.keys() {
            while expect < *seq {
                gaps.push(expect);
                expect += 1;
            }
            expect = seq + 1;
        }
        gaps
    }
}

// ============================ datagram codec =========================== //

fn encode_data(sender: u64, seq: u64, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(17 + payload.len());
    out.put_u8(KIND_DATA);
    out.put_u64(sender);
    out.put_u64(seq);
    out.put_slice(payload);
    out.freeze()
}

fn encode_control(kind: u8, acker: u64, target: u64, seqs: &[u64]) -> Bytes {
    let mut out = BytesMut::with_capacity(19 + seqs.len() * 8);
    out.put_u8(kind);
    out.put_u64(acker);
    out.put_u64(target);
    out.put_u16(seqs.len() as u16);
    for seq in seqs {
        out.put_u64(*seq);
    }
    out.freeze()
}

// ============================= group state ============================= //

/// Read half of one remote sender's ordered byte stream
#[derive(Debug)]
pub struct RspReadHalf {
    chunks: mpsc::Receiver<Bytes>,
    current: Bytes,
}

impl RspReadHalf {
    /// Fill `buf` completely from the sender's stream
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.current.is_empty() {
                match self.chunks.recv().await {
                    Some(chunk) => self.current = chunk,
                    None => return Err(ConnectionError::Closed),
                }
            }
            let take = usize::min(self.current.len(), buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&self.current[..take]);
            self.current.advance(take);
            filled += take;
        }
        Ok(())
    }
}

/// Shared write half: a send fans out to all group receivers
#[derive(Debug, Clone)]
pub struct RspWriteHalf {
    outgoing: mpsc::Sender<Bytes>,
}

impl RspWriteHalf {
    /// Queue bytes for reliable transmission to the whole group
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.outgoing
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| ConnectionError::Closed)
    }
}

/// A joined reliable-multicast group
#[derive(Debug)]
pub struct RspGroup {
    description: ConnectionDescription,
    writer: RspWriteHalf,
    accepted: mpsc::Receiver<RspReadHalf>,
    worker: JoinHandle<()>,
}

impl RspGroup {
    /// Join the multicast group named by `description` (hostname is the
    /// group address, interface selects the local endpoint)
    pub async fn join(description: &ConnectionDescription) -> Result<Self, ConnectionError> {
        let group: Ipv4Addr = description
            .hostname
            .parse()
            .map_err(|_| ConnectionError::BadDescription(description.to_string()))?;
        if !group.is_multicast() {
            return Err(ConnectionError::BadDescription(description.to_string()));
        }
        let interface: Ipv4Addr = if description.interface.is_empty() {
            Ipv4Addr::UNSPECIFIED
        } else {
            description
                .interface
                .parse()
                .map_err(|_| ConnectionError::BadDescription(description.to_string()))?
        };

        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, description.port)))
            .await?;
        socket.join_multicast_v4(group, interface)?;

        let (outgoing_tx, outgoing_rx) = mpsc::channel(SEND_DEPTH);
        let (accepted_tx, accepted_rx) = mpsc::channel(16);
        let worker = crate::concurrency::spawn(group_worker(
            socket,
            SocketAddr::from((group, description.port)),
            outgoing_rx,
            accepted_tx,
        ));

        Ok(Self {
            description: description.clone(),
            writer: RspWriteHalf {
                outgoing: outgoing_tx,
            },
            accepted: accepted_rx,
            worker,
        })
    }

    /// The description this group was joined from
    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    /// The shared group write half
    pub fn writer(&self) -> RspWriteHalf {
        self.writer.clone()
    }

    /// Wait for the next newly discovered remote sender's stream
    pub async fn accept(&mut self) -> Result<RspReadHalf, ConnectionError> {
        self.accepted.recv().await.ok_or(ConnectionError::Closed)
    }

    /// Leave the group, tearing down the socket worker
    pub fn close(&mut self) {
        self.worker.abort();
    }
}

impl Drop for RspGroup {
    fn drop(&mut self) {
        self.close();
    }
}

struct PeerState {
    reorder: RspReorder,
    deliver: mpsc::Sender<Bytes>,
}

async fn group_worker(
    socket: UdpSocket,
    group_addr: SocketAddr,
    mut outgoing: mpsc::Receiver<Bytes>,
    accepted: mpsc::Sender<RspReadHalf>,
) {
    let local_id: u64 = rand::random();
    let mut window = RspWindow::default();
    let mut peers: HashMap<u64, PeerState> = HashMap::new();
    let mut recv_buf = vec![0u8; MTU + 64];
    let mut ticker = tokio::time::interval(ACK_INTERVAL);

    loop {
        tokio::select! {
            chunk = outgoing.recv(), if window.has_room() => {
                let Some(chunk) = chunk else { break };
                for piece in chunk.chunks(MTU) {
                    let seq = window.push(Bytes::copy_from_slice(piece));
                    let datagram = encode_data(local_id, seq, piece);
                    if let Err(err) = socket.send_to(&datagram, group_addr).await {
                        tracing::warn!("RSP send failed: {err}");
                        return;
                    }
                }
            }
            received = socket.recv_from(&mut recv_buf) => {
                let Ok((len, _from)) = received else { break };
                handle_datagram(
                    &socket,
                    group_addr,
                    local_id,
                    &recv_buf[..len],
                    &mut window,
                    &mut peers,
                    &accepted,
                )
                .await;
            }
            _ = ticker.tick() => {
                window.expire_ackers(ACKER_TIMEOUT);
                // acknowledge progress and chase gaps for every known sender
                for (sender, peer) in peers.iter() {
                    if let Some(ack) = peer.reorder.ack_seq() {
                        let datagram = encode_control(KIND_ACK, local_id, *sender, &[ack]);
                        let _ = socket.send_to(&datagram, group_addr).await;
                    }
                    let missing = peer.reorder.missing();
                    if !missing.is_empty() {
                        let datagram = encode_control(KIND_NACK, local_id, *sender, &missing);
                        let _ = socket.send_to(&datagram, group_addr).await;
                    }
                }
            }
        }
    }
}

async fn handle_datagram(
    socket: &UdpSocket,
    group_addr: SocketAddr,
    local_id: u64,
    datagram: &[u8],
    window: &mut RspWindow,
    peers: &mut HashMap<u64, PeerState>,
    accepted: &mpsc::Sender<RspReadHalf>,
) {
    if datagram.len() < 17 {
        return;
    }
    let mut cursor = datagram;
    let kind = cursor.get_u8();
    let sender = cursor.get_u64();

    match kind {
        KIND_DATA => {
            if sender == local_id {
                // our own multicast loopback
                return;
            }
            let seq = cursor.get_u64();
            let payload = Bytes::copy_from_slice(cursor);

            if !peers.contains_key(&sender) {
                let (deliver, chunks) = mpsc::channel(64);
                peers.insert(
                    sender,
                    PeerState {
                        reorder: RspReorder::default(),
                        deliver,
                    },
                );
                let half = RspReadHalf {
                    chunks,
                    current: Bytes::new(),
                };
                if accepted.send(half).await.is_err() {
                    tracing::debug!("RSP group dropped while accepting sender {sender:#x}");
                }
            }
            let peer = peers.get_mut(&sender).expect("peer state just inserted");
            let mut reader_dropped = false;
            for ready in peer.reorder.insert(seq, payload) {
                if peer.deliver.send(ready).await.is_err() {
                    reader_dropped = true;
                    break;
                }
            }
            if reader_dropped {
                // reader half dropped; stop tracking the sender
                peers.remove(&sender);
            }
        }
        KIND_ACK | KIND_NACK => {
            if cursor.remaining() < 10 {
                return;
            }
            let target = cursor.get_u64();
            if target != local_id {
                return;
            }
            let count = cursor.get_u16() as usize;
            if cursor.remaining() < count * 8 {
                return;
            }
            if kind == KIND_ACK {
                if count == 1 {
                    window.acknowledge(sender, cursor.get_u64());
                }
            } else {
                for _ in 0..count {
                    let seq = cursor.get_u64();
                    if let Some(payload) = window.retransmit(seq) {
                        let datagram = encode_data(local_id, seq, &payload);
                        let _ = socket.send_to(&datagram, group_addr).await;
                    }
                }
            }
        }
        _ => {
            tracing::debug!("Discarding unknown RSP datagram kind {kind}");
        }
    }
}
