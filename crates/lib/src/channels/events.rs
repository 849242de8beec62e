//! Publish/subscribe registry for bridge events.
//!
//! Subscribers are grouped by [`EventKind`] and run in registration order. Each call is
//! isolated: an `Err` or a panic from one subscriber is logged and the rest still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::channels::inbound::InboundMessage;
use crate::channels::transport::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    Connection,
    FriendRequest,
}

#[derive(Debug, Clone)]
pub enum BridgeEvent {
    /// A normalized inbound message, published before dispatch.
    Message {
        account_id: String,
        message: InboundMessage,
    },
    /// Connected <-> Disconnected flip of an account's transport.
    Connection {
        account_id: String,
        state: ConnectionState,
    },
    FriendRequest {
        account_id: String,
        peer_id: String,
        hello: String,
    },
}

impl BridgeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message { .. } => EventKind::Message,
            Self::Connection { .. } => EventKind::Connection,
            Self::FriendRequest { .. } => EventKind::FriendRequest,
        }
    }

    pub fn account_id(&self) -> &str {
        match self {
            Self::Message { account_id, .. }
            | Self::Connection { account_id, .. }
            | Self::FriendRequest { account_id, .. } => account_id,
        }
    }
}

pub type Subscriber = Arc<dyn Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Subscriber)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, f: F) -> SubscriptionId
    where
        F: Fn(&BridgeEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut g = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        g.entry(kind).or_default().push((id, Arc::new(f)));
        id
    }

    /// Remove a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut g = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        for subs in g.values_mut() {
            if let Some(pos) = subs.iter().position(|(sid, _)| *sid == id) {
                subs.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver an event to every subscriber of its kind. Returns how many failed.
    pub fn publish(&self, event: &BridgeEvent) -> usize {
        // Snapshot so subscribers may (un)subscribe without deadlocking.
        let subs: Vec<Subscriber> = {
            let g = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
            g.get(&event.kind())
                .map(|v| v.iter().map(|(_, s)| s.clone()).collect())
                .unwrap_or_default()
        };
        let mut failed = 0;
        for sub in subs {
            match catch_unwind(AssertUnwindSafe(|| sub(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed += 1;
                    log::warn!(
                        "event subscriber failed (kind={:?} account={}): {}",
                        event.kind(),
                        event.account_id(),
                        e
                    );
                }
                Err(_) => {
                    failed += 1;
                    log::warn!(
                        "event subscriber panicked (kind={:?} account={})",
                        event.kind(),
                        event.account_id()
                    );
                }
            }
        }
        failed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        let g = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        g.get(&kind).map_or(0, Vec::len)
    }
}
