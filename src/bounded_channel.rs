// SPDX-License-Identifier: Apache-2.0

//! Bounded channels connecting harvester threads to the async pipeline.
//!
//! Thin wrapper over flume so that the same channel can be used with a
//! blocking send from a dedicated reader thread and an async recv on the
//! runtime. The bound is what turns publisher slowness into harvester
//! backpressure.

use flume::{Receiver, Sender};
use std::fmt;
use std::time::Duration;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        self.tx
            .send_async(item)
            .await
            .map_err(|_| SendError::Disconnected)
    }

    /// Blocking send for non-async contexts (harvester reader threads).
    /// Blocks until there is capacity in the channel.
    pub fn send_blocking(&self, item: T) -> Result<(), SendError> {
        self.tx.send(item).map_err(|_| SendError::Disconnected)
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Async receive. Returns None once all senders are dropped and the
    /// channel is drained, which is the pipeline's shutdown signal.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocking receive with timeout, for test helpers and drain loops.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::{SendError, bounded};
    use tokio_test::{assert_ok, assert_pending, assert_ready, task::spawn};

    #[tokio::test]
    async fn send_then_recv() {
        let (tx, mut rx) = bounded(2);

        assert_ok!(tx.send(1).await);
        assert_ok!(tx.send(2).await);

        assert_eq!(Some(1), rx.next().await);
        assert_eq!(Some(2), rx.next().await);
    }

    #[tokio::test]
    async fn recv_returns_none_when_senders_dropped() {
        let (tx, mut rx) = bounded::<u32>(1);

        let mut recv = spawn(async { rx.next().await });
        assert_pending!(recv.poll());

        drop(tx);
        assert_eq!(None, assert_ready!(recv.poll()));
    }

    #[tokio::test]
    async fn send_blocks_when_full() {
        let (tx, mut rx) = bounded(1);

        assert_ok!(tx.send(1).await);

        let mut send2 = spawn(async { tx.send(2).await });
        assert_pending!(send2.poll());

        assert_eq!(Some(1), rx.next().await);
        assert_ok!(assert_ready!(send2.poll()));
    }

    #[tokio::test]
    async fn send_fails_after_receiver_drop() {
        let (tx, rx) = bounded(1);
        drop(rx);

        let mut send = spawn(async { tx.send(1).await });
        assert_eq!(Err(SendError::Disconnected), assert_ready!(send.poll()));
    }

    #[test]
    fn blocking_send_and_try_recv() {
        let (tx, rx) = bounded(4);

        tx.send_blocking(7).unwrap();
        assert_eq!(Some(7), rx.try_recv());
        assert_eq!(None, rx.try_recv());
    }
}
