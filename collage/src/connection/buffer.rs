// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! In-memory write sink for batching small sends
//!
//! A [BufferConnection] is not a network transport: it accumulates writes
//! into memory and later flushes them into a real write half as a single
//! send, so that a burst of small object-commit messages crosses the wire
//! atomically and with one syscall.

use bytes::{Bytes, BytesMut};

use super::ConnectionWriteHalf;
use crate::errors::ConnectionError;

/// Accumulates writes for a later atomic flush
#[derive(Debug, Default)]
pub struct BufferConnection {
    pending: BytesMut,
}

impl BufferConnection {
    /// Create an empty buffer sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes; never fails and never blocks
    pub fn write_all(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Bytes currently buffered
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the accumulated bytes, leaving the buffer empty
    pub fn take(&mut self) -> Bytes {
        self.pending.split().freeze()
    }

    /// Flush everything buffered into `target` as one write
    pub async fn flush_into(
        &mut self,
        target: &mut ConnectionWriteHalf,
    ) -> Result<(), ConnectionError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = self.take();
        target.write_all(&batch).await?;
        target.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_and_drains() {
        let mut buffer = BufferConnection::new();
        assert!(buffer.is_empty());
        buffer.write_all(b"one");
        buffer.write_all(b"two");
        assert_eq!(buffer.len(), 6);
        assert_eq!(buffer.take(), Bytes::from_static(b"onetwo"));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn flushes_as_single_send() {
        let (mut near, mut far) = super::super::pipe::pair();
        let mut buffer = BufferConnection::new();
        buffer.write_all(b"alpha");
        buffer.write_all(b"beta");

        let (_read, mut write) = near.take_halves().expect("Pipe should be open");
        buffer
            .flush_into(&mut write)
            .await
            .expect("Failed to flush");

        let mut received = [0u8; 9];
        far.recv_exact(&mut received)
            .await
            .expect("Failed to receive");
        assert_eq!(&received, b"alphabeta");
        assert!(buffer.is_empty());
    }
}
