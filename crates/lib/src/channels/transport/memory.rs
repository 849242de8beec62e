//! In-process transport: events are pushed through a [`MemoryFeed`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use super::{Connection, Connector};
use crate::channels::inbound::RawEvent;
use crate::error::{BridgeError, Result};

#[derive(Debug)]
enum Frame {
    Event(RawEvent),
    Disconnect,
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryFeed {
    tx: mpsc::UnboundedSender<Frame>,
}

impl MemoryFeed {
    pub fn push(&self, event: RawEvent) {
        let _ = self.tx.send(Frame::Event(event));
    }

    /// Drop the current connection as if the sidecar went away.
    pub fn disconnect(&self) {
        let _ = self.tx.send(Frame::Disconnect);
    }
}

/// Connector over an unbounded queue. Only one connection reads the queue at a time.
#[derive(Clone)]
pub struct MemoryConnector {
    rx: Arc<AsyncMutex<mpsc::UnboundedReceiver<Frame>>>,
    feed: MemoryFeed,
    fail_remaining: Arc<AtomicU32>,
    attempts: Arc<Mutex<Vec<Instant>>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryFeed) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = MemoryFeed { tx };
        let connector = Self {
            rx: Arc::new(AsyncMutex::new(rx)),
            feed: feed.clone(),
            fail_remaining: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(Mutex::new(Vec::new())),
        };
        (connector, feed)
    }

    pub fn feed(&self) -> MemoryFeed {
        self.feed.clone()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// When each connect attempt happened, in order.
    pub fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Instant::now());
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::transport_msg("memory connect", "refused"));
        }
        let rx = self
            .rx
            .clone()
            .try_lock_owned()
            .map_err(|_| BridgeError::transport_msg("memory connect", "feed already attached"))?;
        Ok(Box::new(MemoryConnection { rx }))
    }
}

struct MemoryConnection {
    rx: OwnedMutexGuard<mpsc::UnboundedReceiver<Frame>>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn next_batch(&mut self) -> Result<Option<Vec<RawEvent>>> {
        match self.rx.recv().await {
            Some(Frame::Event(ev)) => Ok(Some(vec![ev])),
            Some(Frame::Disconnect) => Err(BridgeError::transport_msg("memory", "disconnected")),
            None => Ok(None),
        }
    }
}
