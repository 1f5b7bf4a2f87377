// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Per-task FIFO of dispatchable commands
//!
//! A [CommandQueue] serializes all mutation of a node's or object's state
//! onto a single logical thread of control: every command bound to the queue
//! is executed by the one task popping it. FIFO order is preserved except
//! for explicit [CommandQueue::push_front] priority injection, which is
//! reserved for control messages such as "stop".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::command::Command;
use crate::concurrency::{Duration, Instant};

/// An unbounded, wakeup-driven command FIFO
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<Command>>,
    notify: Notify,
    closed: AtomicBool,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command, waking one blocked [CommandQueue::pop]
    pub fn push(&self, command: Command) {
        {
            let mut inner = self.inner.lock().expect("CommandQueue lock poisoned");
            inner.push_back(command);
        }
        self.notify.notify_one();
    }

    /// Prepend a priority command, waking one blocked [CommandQueue::pop]
    pub fn push_front(&self, command: Command) {
        {
            let mut inner = self.inner.lock().expect("CommandQueue lock poisoned");
            inner.push_front(command);
        }
        self.notify.notify_one();
    }

    /// Pop the front command, suspending until one is available
    ///
    /// Returns [None] on timeout or once the queue is closed, so the caller
    /// can re-check its exit condition. `None` as timeout means "indefinite".
    pub async fn pop(&self, timeout: Option<Duration>) -> Option<Command> {
        let deadline = timeout.map(|dur| Instant::now() + dur);
        loop {
            // arm the wakeup before checking, so a concurrent push cannot
            // slip between the check and the wait
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(command) = self.try_pop() {
                return Some(command);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.try_pop();
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Pop the front command if one is queued
    pub fn try_pop(&self) -> Option<Command> {
        let mut inner = self.inner.lock().expect("CommandQueue lock poisoned");
        inner.pop_front()
    }

    /// Close the queue: blocked and future [CommandQueue::pop] calls return
    /// [None] once drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether [CommandQueue::close] was called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.inner.lock().expect("CommandQueue lock poisoned").len()
    }

    /// Whether no commands are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::command::{CMD_NODE_CUSTOM, CMD_NODE_STOP};

    fn command(id: u32) -> Command {
        Command::node(id, Bytes::new())
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let queue = CommandQueue::new();
        queue.push(command(CMD_NODE_CUSTOM));
        queue.push(command(CMD_NODE_CUSTOM + 1));
        queue.push(command(CMD_NODE_CUSTOM + 2));

        for offset in 0..3 {
            let popped = queue.pop(None).await.expect("Queue should not be empty");
            assert_eq!(popped.command(), CMD_NODE_CUSTOM + offset);
        }
    }

    #[tokio::test]
    async fn push_front_takes_priority() {
        let queue = CommandQueue::new();
        queue.push(command(CMD_NODE_CUSTOM));
        queue.push_front(command(CMD_NODE_STOP));

        let first = queue.pop(None).await.expect("Queue should not be empty");
        assert_eq!(first.command(), CMD_NODE_STOP);
    }

    #[tokio::test]
    async fn pop_times_out_with_sentinel() {
        let queue = CommandQueue::new();
        let popped = queue.pop(Some(Duration::from_millis(20))).await;
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn close_wakes_blocked_pop() {
        let queue = Arc::new(CommandQueue::new());
        let waiter = {
            let queue = queue.clone();
            crate::concurrency::spawn(async move { queue.pop(None).await })
        };
        // let the waiter block first
        crate::concurrency::sleep(Duration::from_millis(10)).await;
        queue.close();
        let result = waiter.await.expect("Pop task panicked");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(CommandQueue::new());
        let waiter = {
            let queue = queue.clone();
            crate::concurrency::spawn(async move { queue.pop(Some(Duration::from_secs(5))).await })
        };
        crate::concurrency::sleep(Duration::from_millis(10)).await;
        queue.push(command(CMD_NODE_CUSTOM));
        let result = waiter.await.expect("Pop task panicked");
        assert_eq!(
            result.expect("Expected a command").command(),
            CMD_NODE_CUSTOM
        );
    }
}
