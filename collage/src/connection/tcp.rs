// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! TCP/IP stream transport

use tokio::net::{TcpListener, TcpStream};

use super::description::ConnectionDescription;
use super::{Connection, ConnectionReadHalf, ConnectionWriteHalf};
use crate::errors::ConnectionError;

/// Open a client connection to the described host and port
pub(super) async fn connect(
    description: &ConnectionDescription,
) -> Result<Connection, ConnectionError> {
    let addr = format!("{}:{}", description.hostname, description.port);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    Ok(from_stream(stream, description.clone()))
}

/// Bind a listening socket; port zero selects an ephemeral port which is
/// written back into the returned description
pub(super) async fn bind(
    description: &ConnectionDescription,
) -> Result<(TcpListener, ConnectionDescription), ConnectionError> {
    let addr = format!("0.0.0.0:{}", description.port);
    let listener = TcpListener::bind(&addr).await?;
    let mut bound = description.clone();
    bound.port = listener.local_addr()?.port();
    Ok((listener, bound))
}

/// Wrap an established stream in a [Connection]
pub(super) fn from_stream(stream: TcpStream, description: ConnectionDescription) -> Connection {
    let _ = stream.set_nodelay(true);
    let (read, write) = stream.into_split();
    Connection::from_halves(
        description,
        ConnectionReadHalf::Tcp(read),
        ConnectionWriteHalf::Tcp(write),
    )
}
