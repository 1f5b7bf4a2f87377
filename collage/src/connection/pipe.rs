// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Local pipe transports
//!
//! [pair] adapts two unidirectional in-process pipes into one bidirectional
//! [Connection] per endpoint; the named-pipe transport maps onto Unix domain
//! sockets.

use super::description::{ConnectionDescription, ConnectionKind};
use super::{Connection, ConnectionReadHalf, ConnectionWriteHalf};
use crate::errors::ConnectionError;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Create a connected in-process pipe pair
///
/// Each returned [Connection] reads what the other wrote; both carry a
/// [ConnectionKind::Pipe] description.
pub fn pair() -> (Connection, Connection) {
    let description = ConnectionDescription {
        kind: ConnectionKind::Pipe,
        hostname: "local".to_string(),
        ..ConnectionDescription::default()
    };

    let (one, two) = tokio::io::duplex(PIPE_CAPACITY);
    let (read_one, write_one) = tokio::io::split(one);
    let (read_two, write_two) = tokio::io::split(two);

    (
        Connection::from_halves(
            description.clone(),
            ConnectionReadHalf::Local(read_one),
            ConnectionWriteHalf::Local(write_one),
        ),
        Connection::from_halves(
            description,
            ConnectionReadHalf::Local(read_two),
            ConnectionWriteHalf::Local(write_two),
        ),
    )
}

/// Open a client connection to a named pipe
#[cfg(unix)]
pub(super) async fn connect_named(
    description: &ConnectionDescription,
) -> Result<Connection, ConnectionError> {
    let stream = tokio::net::UnixStream::connect(&description.filename).await?;
    let (read, write) = stream.into_split();
    Ok(Connection::from_halves(
        description.clone(),
        ConnectionReadHalf::Unix(read),
        ConnectionWriteHalf::Unix(write),
    ))
}

/// Bind a named pipe for listening
#[cfg(unix)]
pub(super) fn bind_named(
    description: &ConnectionDescription,
) -> Result<tokio::net::UnixListener, ConnectionError> {
    // a stale socket file from a previous run refuses the bind
    let _ = std::fs::remove_file(&description.filename);
    Ok(tokio::net::UnixListener::bind(&description.filename)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pair_is_bidirectional() {
        let (mut one, mut two) = pair();

        one.send(b"ping").await.expect("Failed to send");
        let mut buf = [0u8; 4];
        two.recv_exact(&mut buf).await.expect("Failed to receive");
        assert_eq!(&buf, b"ping");

        two.send(b"pong").await.expect("Failed to send");
        one.recv_exact(&mut buf).await.expect("Failed to receive");
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn closing_one_end_fails_the_reader() {
        let (one, mut two) = pair();
        drop(one);
        let mut buf = [0u8; 1];
        assert!(two.recv_exact(&mut buf).await.is_err());
    }
}
