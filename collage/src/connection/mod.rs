// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Uniform byte-stream connections over heterogeneous transports
//!
//! A [Connection] is a bidirectional, ordered, loss-free byte pipe; the
//! transport behind it is selected by the [ConnectionDescription] it was
//! built from. Established connections split into a read half and a write
//! half so one task can receive while another sends.
//!
//! Closing a connection (or dropping either half) unblocks any pending read
//! with a failure result; shutdown is modeled as resource teardown, not as a
//! separate cancellation token.

pub mod buffer;
pub mod description;
pub mod pipe;
pub mod rsp;
pub mod tcp;

pub use buffer::BufferConnection;
pub use description::{
    default_host, ConnectionDescription, ConnectionKind, DEFAULT_PORT, ENV_SERVER,
};
pub use pipe::pair;
pub use rsp::{RspGroup, RspReadHalf, RspWriteHalf};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::io::DuplexStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::errors::ConnectionError;

/// Lifecycle of a connection
///
/// Establishment and listening are modeled as async calls in flight
/// ([Connection::connect], [Listener::bind]), so a materialized connection
/// is only ever connected or closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport attached
    Closed,
    /// Bidirectional byte stream available
    Connected,
}

/// The receiving half of an established connection
#[derive(Debug)]
pub enum ConnectionReadHalf {
    /// TCP/IP stream
    Tcp(OwnedReadHalf),
    /// In-process pipe
    Local(ReadHalf<DuplexStream>),
    /// Unix domain socket (named pipe)
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedReadHalf),
    /// One remote sender of a reliable multicast group
    Rsp(RspReadHalf),
}

impl ConnectionReadHalf {
    /// Fill `buf` completely, suspending until the bytes arrived
    ///
    /// An end-of-stream or transport error yields
    /// [ConnectionError::Closed] / [ConnectionError::Io]; partial data on a
    /// dying connection is never surfaced.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        let result = match self {
            Self::Tcp(half) => half.read_exact(buf).await.map(|_| ()),
            Self::Local(half) => half.read_exact(buf).await.map(|_| ()),
            #[cfg(unix)]
            Self::Unix(half) => half.read_exact(buf).await.map(|_| ()),
            Self::Rsp(half) => return half.read_exact(buf).await,
        };
        result.map_err(|err| {
            if err.kind() == std::io::ErrorKind::UnexpectedEof {
                ConnectionError::Closed
            } else {
                ConnectionError::Io(err)
            }
        })
    }
}

/// The sending half of an established connection
#[derive(Debug)]
pub enum ConnectionWriteHalf {
    /// TCP/IP stream
    Tcp(OwnedWriteHalf),
    /// In-process pipe
    Local(WriteHalf<DuplexStream>),
    /// Unix domain socket (named pipe)
    #[cfg(unix)]
    Unix(tokio::net::unix::OwnedWriteHalf),
    /// Reliable multicast group fan-out
    Rsp(RspWriteHalf),
}

impl ConnectionWriteHalf {
    /// Send all of `data`, looping over partial writes
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let result = match self {
            Self::Tcp(half) => half.write_all(data).await,
            Self::Local(half) => half.write_all(data).await,
            #[cfg(unix)]
            Self::Unix(half) => half.write_all(data).await,
            Self::Rsp(half) => return half.write_all(data).await,
        };
        result.map_err(ConnectionError::Io)
    }

    /// Flush buffered bytes to the transport
    pub async fn flush(&mut self) -> Result<(), ConnectionError> {
        let result = match self {
            Self::Tcp(half) => half.flush().await,
            Self::Local(half) => half.flush().await,
            #[cfg(unix)]
            Self::Unix(half) => half.flush().await,
            Self::Rsp(_) => Ok(()),
        };
        result.map_err(ConnectionError::Io)
    }
}

/// A bidirectional byte pipe to one peer
#[derive(Debug)]
pub struct Connection {
    description: ConnectionDescription,
    state: ConnectionState,
    read: Option<ConnectionReadHalf>,
    write: Option<ConnectionWriteHalf>,
}

impl Connection {
    /// Establish a client connection per the description's transport kind
    ///
    /// [ConnectionKind::Pipe] endpoints are created pairwise with
    /// [pipe::pair] instead; [ConnectionKind::Rsp] yields the group's
    /// sender role (reads come from [RspGroup::accept] on the listening
    /// side); [ConnectionKind::Infiniband] is not supported by this build.
    pub async fn connect(
        description: &ConnectionDescription,
    ) -> Result<Connection, ConnectionError> {
        match description.kind {
            ConnectionKind::TcpIp => tcp::connect(description).await,
            #[cfg(unix)]
            ConnectionKind::NamedPipe => pipe::connect_named(description).await,
            #[cfg(not(unix))]
            ConnectionKind::NamedPipe => Err(ConnectionError::Unsupported(description.kind)),
            ConnectionKind::Rsp => {
                let group = RspGroup::join(description).await?;
                Ok(Self::from_group_writer(group))
            }
            ConnectionKind::Pipe | ConnectionKind::Infiniband => {
                Err(ConnectionError::Unsupported(description.kind))
            }
        }
    }

    /// Adapt two unidirectional halves into one bidirectional connection
    pub fn from_halves(
        description: ConnectionDescription,
        read: ConnectionReadHalf,
        write: ConnectionWriteHalf,
    ) -> Self {
        Self {
            description,
            state: ConnectionState::Connected,
            read: Some(read),
            write: Some(write),
        }
    }

    fn from_group_writer(group: RspGroup) -> Self {
        let description = group.description().clone();
        let writer = group.writer();
        // the group handle owns the socket worker; keep it alive inside a
        // detached task for the lifetime of the write half
        crate::concurrency::spawn(async move {
            let mut group = group;
            while group.accept().await.is_ok() {}
        });
        Self {
            description,
            state: ConnectionState::Connected,
            read: None,
            write: Some(ConnectionWriteHalf::Rsp(writer)),
        }
    }

    /// The immutable description this connection was built from
    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Fill `buf` completely from the peer
    pub async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), ConnectionError> {
        match self.read.as_mut() {
            Some(half) => {
                let result = half.read_exact(buf).await;
                if result.is_err() {
                    self.close();
                }
                result
            }
            None => Err(ConnectionError::Closed),
        }
    }

    /// Send all of `data` to the peer
    pub async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        match self.write.as_mut() {
            Some(half) => {
                let result = half.write_all(data).await;
                if result.is_err() {
                    self.close();
                }
                result
            }
            None => Err(ConnectionError::Closed),
        }
    }

    /// Close the connection; idempotent, never blocks
    pub fn close(&mut self) {
        self.state = ConnectionState::Closed;
        drop(self.read.take());
        drop(self.write.take());
    }

    /// Split into read and write halves for concurrent use; [None] once
    /// closed
    pub fn take_halves(&mut self) -> Option<(ConnectionReadHalf, ConnectionWriteHalf)> {
        match (self.read.take(), self.write.take()) {
            (Some(read), Some(write)) => {
                self.state = ConnectionState::Closed;
                Some((read, write))
            }
            (read, write) => {
                self.read = read;
                self.write = write;
                None
            }
        }
    }
}

/// Kinds of bound listeners
#[derive(Debug)]
enum ListenerKind {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Rsp(RspGroup),
}

/// A bound server endpoint producing one [Connection] per peer
#[derive(Debug)]
pub struct Listener {
    description: ConnectionDescription,
    inner: ListenerKind,
}

impl Listener {
    /// Bind per the description's transport kind
    ///
    /// Fails on address-in-use or malformed descriptions. Port zero binds
    /// an ephemeral port, reflected in [Listener::description].
    pub async fn bind(description: &ConnectionDescription) -> Result<Self, ConnectionError> {
        match description.kind {
            ConnectionKind::TcpIp => {
                let (listener, bound) = tcp::bind(description).await?;
                Ok(Self {
                    description: bound,
                    inner: ListenerKind::Tcp(listener),
                })
            }
            #[cfg(unix)]
            ConnectionKind::NamedPipe => {
                let listener = pipe::bind_named(description)?;
                Ok(Self {
                    description: description.clone(),
                    inner: ListenerKind::Unix(listener),
                })
            }
            ConnectionKind::Rsp => {
                let group = RspGroup::join(description).await?;
                Ok(Self {
                    description: description.clone(),
                    inner: ListenerKind::Rsp(group),
                })
            }
            _ => Err(ConnectionError::Unsupported(description.kind)),
        }
    }

    /// The bound description (with the resolved port)
    pub fn description(&self) -> &ConnectionDescription {
        &self.description
    }

    /// Wait for and return the next peer connection
    pub async fn accept(&mut self) -> Result<Connection, ConnectionError> {
        match &mut self.inner {
            ListenerKind::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                tracing::debug!("Accepted TCP peer {addr}");
                let mut description = self.description.clone();
                description.hostname = addr.ip().to_string();
                description.port = addr.port();
                Ok(tcp::from_stream(stream, description))
            }
            #[cfg(unix)]
            ListenerKind::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                let (read, write) = stream.into_split();
                Ok(Connection::from_halves(
                    self.description.clone(),
                    ConnectionReadHalf::Unix(read),
                    ConnectionWriteHalf::Unix(write),
                ))
            }
            ListenerKind::Rsp(group) => {
                let read = group.accept().await?;
                Ok(Connection::from_halves(
                    self.description.clone(),
                    ConnectionReadHalf::Rsp(read),
                    ConnectionWriteHalf::Rsp(group.writer()),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tcp_connect_and_exchange() {
        let mut listener = Listener::bind(&ConnectionDescription::tcp("localhost", 0))
            .await
            .expect("Failed to bind");
        let port = listener.description().port;
        assert_ne!(port, 0);

        let client = crate::concurrency::spawn(async move {
            let mut conn = Connection::connect(&ConnectionDescription::tcp("127.0.0.1", port))
                .await
                .expect("Failed to connect");
            conn.send(b"hello").await.expect("Failed to send");
            conn
        });

        let mut accepted = listener.accept().await.expect("Failed to accept");
        let mut buf = [0u8; 5];
        accepted
            .recv_exact(&mut buf)
            .await
            .expect("Failed to receive");
        assert_eq!(&buf, b"hello");
        let _client = client.await.expect("Client task panicked");
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        // bind + drop to find a port nothing listens on
        let listener = Listener::bind(&ConnectionDescription::tcp("localhost", 0))
            .await
            .expect("Failed to bind");
        let port = listener.description().port;
        drop(listener);

        let result = Connection::connect(&ConnectionDescription::tcp("127.0.0.1", port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unsupported_transports_fail_cleanly() {
        let description = ConnectionDescription {
            kind: ConnectionKind::Infiniband,
            ..ConnectionDescription::default()
        };
        assert!(matches!(
            Connection::connect(&description).await,
            Err(ConnectionError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut one, _two) = pair();
        one.close();
        one.close();
        assert_eq!(one.state(), ConnectionState::Closed);
        let mut buf = [0u8; 1];
        assert!(one.recv_exact(&mut buf).await.is_err());
    }
}
