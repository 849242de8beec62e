//! Sidecar transport: owns the connection to the sidecar and keeps it alive.
//!
//! A [`Connector`] opens one [`Connection`] (a WebSocket session, a poll session, or an
//! in-memory queue). [`SidecarTransport`] drives it: connect, forward batches, and on
//! failure wait a fixed interval and connect again, forever, until cancelled.

mod memory;
mod poll;
mod stream;

pub use memory::{MemoryConnector, MemoryFeed};
pub use poll::PollConnector;
pub use stream::StreamConnector;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::channels::events::{BridgeEvent, EventBus};
use crate::channels::inbound::RawEvent;
use crate::channels::sidecar::SidecarClient;
use crate::config::{BridgeSettings, TransportMode};
use crate::error::{BridgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

/// Opens connections to one account's sidecar.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Strategy name for logs ("stream", "poll", "memory").
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Whether a stop may abort an in-flight read. Poll sessions finish their current call.
    fn interruptible(&self) -> bool {
        true
    }
}

/// One live session with the sidecar.
#[async_trait]
pub trait Connection: Send {
    /// Next batch of events (possibly empty). `Ok(None)` is a normal close.
    async fn next_batch(&mut self) -> Result<Option<Vec<RawEvent>>>;

    /// Close on an explicit stop.
    async fn close(&mut self) {}
}

/// Build the connector selected by configuration. The memory transport has no sidecar of
/// its own, so it needs a connector injected for the account.
pub fn connector_for(
    mode: TransportMode,
    client: SidecarClient,
    memory: Option<MemoryConnector>,
) -> Result<Arc<dyn Connector>> {
    Ok(match mode {
        TransportMode::Stream => Arc::new(StreamConnector::new(client)),
        TransportMode::Poll => Arc::new(PollConnector::new(client)),
        TransportMode::Memory => match memory {
            Some(connector) => Arc::new(connector),
            None => {
                return Err(BridgeError::Config(format!(
                    "memory transport requires an injected MemoryConnector for account {}",
                    client.account().account_id
                )))
            }
        },
    })
}

/// Delay between attempts for a mode: reconnect interval for streams, poll backoff otherwise.
pub fn retry_interval_for(mode: TransportMode, settings: &BridgeSettings) -> Duration {
    match mode {
        TransportMode::Stream => settings.reconnect_interval,
        TransportMode::Poll | TransportMode::Memory => settings.poll_backoff,
    }
}

/// Supervises one account's connection. At most one `run` is active at a time.
pub struct SidecarTransport {
    account_id: String,
    connector: Arc<dyn Connector>,
    retry_interval: Duration,
    events: Arc<EventBus>,
    state: watch::Sender<ConnectionState>,
    running: AtomicBool,
    connect_attempts: AtomicU64,
}

/// Clears the single-flight flag when `run` returns.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SidecarTransport {
    pub fn new(
        account_id: impl Into<String>,
        connector: Arc<dyn Connector>,
        retry_interval: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            account_id: account_id.into(),
            connector,
            retry_interval,
            events,
            state,
            running: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        let was_connected = prev == ConnectionState::Connected;
        let is_connected = next == ConnectionState::Connected;
        if was_connected != is_connected && next != ConnectionState::Connecting {
            log::info!(
                "sidecar {} account={} via {}",
                next.as_str(),
                self.account_id,
                self.connector.name()
            );
            self.events.publish(&BridgeEvent::Connection {
                account_id: self.account_id.clone(),
                state: next,
            });
        }
    }

    /// Run the connect/forward/retry loop until `cancel` fires or `tx` is closed.
    /// Fails immediately if another `run` is already active for this transport.
    pub async fn run(&self, tx: mpsc::Sender<RawEvent>, cancel: CancellationToken) -> Result<()> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::transport_msg(
                format!("account {}", self.account_id),
                "transport already running",
            ));
        }
        let _guard = RunGuard(&self.running);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            let started = Instant::now();
            match self.connector.connect().await {
                Ok(mut conn) => {
                    self.set_state(ConnectionState::Connected);
                    match self.forward(conn.as_mut(), &tx, &cancel).await {
                        SessionEnd::Stopped => {
                            conn.close().await;
                            self.set_state(ConnectionState::Disconnected);
                            break;
                        }
                        SessionEnd::Closed => {
                            log::info!(
                                "sidecar connection closed account={} after {}ms",
                                self.account_id,
                                started.elapsed().as_millis()
                            );
                        }
                        SessionEnd::Failed(e) => {
                            log::warn!(
                                "sidecar connection lost account={} after {}ms: {}",
                                self.account_id,
                                started.elapsed().as_millis(),
                                e
                            );
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "sidecar connect failed account={} via {}; retrying in {}ms: {}",
                        self.account_id,
                        self.connector.name(),
                        self.retry_interval.as_millis(),
                        e
                    );
                }
            }
            self.set_state(ConnectionState::Disconnected);
            if tx.is_closed() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        log::debug!("sidecar transport stopped account={}", self.account_id);
        Ok(())
    }

    async fn forward(
        &self,
        conn: &mut dyn Connection,
        tx: &mpsc::Sender<RawEvent>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let interruptible = self.connector.interruptible();
        loop {
            if cancel.is_cancelled() {
                return SessionEnd::Stopped;
            }
            let next = if interruptible {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return SessionEnd::Stopped,
                    next = conn.next_batch() => next,
                }
            } else {
                conn.next_batch().await
            };
            match next {
                Ok(Some(batch)) => {
                    if !batch.is_empty() {
                        log::debug!("events={} account={}", batch.len(), self.account_id);
                    }
                    for ev in batch {
                        if tx.send(ev).await.is_err() {
                            log::debug!(
                                "inbound consumer closed, stopping transport account={}",
                                self.account_id
                            );
                            return SessionEnd::Stopped;
                        }
                    }
                }
                Ok(None) => return SessionEnd::Closed,
                Err(e) => return SessionEnd::Failed(e),
            }
        }
    }
}

enum SessionEnd {
    Stopped,
    Closed,
    Failed(BridgeError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::events::EventKind;
    use std::sync::Mutex;

    fn transport(connector: MemoryConnector, interval: Duration, bus: Arc<EventBus>) -> Arc<SidecarTransport> {
        Arc::new(SidecarTransport::new("default", Arc::new(connector), interval, bus))
    }

    #[test]
    fn memory_mode_without_injected_connector_is_a_config_error() {
        let settings = BridgeSettings::default();
        let client = || {
            SidecarClient::new(
                Arc::new(crate::config::Account::new("work", "http://127.0.0.1:9")),
                &settings,
            )
        };
        let err = connector_for(TransportMode::Memory, client(), None)
            .err()
            .expect("memory without a connector");
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
        assert!(err.to_string().contains("work"));

        let (connector, _feed) = MemoryConnector::new();
        let ok = connector_for(TransportMode::Memory, client(), Some(connector)).unwrap();
        assert_eq!(ok.name(), "memory");
        assert_eq!(
            connector_for(TransportMode::Poll, client(), None).unwrap().name(),
            "poll"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_connect_succeeds_then_yields_events_once() {
        let (connector, feed) = MemoryConnector::new();
        connector.fail_next(3);
        feed.push(RawEvent::message("p1", "one", 1.0));
        feed.push(RawEvent::message("p1", "two", 2.0));
        let interval = Duration::from_millis(50);
        let t = transport(connector.clone(), interval, Arc::new(EventBus::new()));

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let t = t.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { t.run(tx, cancel).await })
        };

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.text, "one");
        assert_eq!(second.text, "two");
        assert_eq!(t.connect_attempts(), 4);
        assert_eq!(t.state(), ConnectionState::Connected);

        let times = connector.attempt_times();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= interval, "gap {:?} shorter than interval", gap);
            assert!(gap < interval + Duration::from_millis(5), "gap {:?}", gap);
        }

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(t.state(), ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_disconnect_and_notifies_observers() {
        let (connector, feed) = MemoryConnector::new();
        let bus = Arc::new(EventBus::new());
        let flips = Arc::new(Mutex::new(Vec::new()));
        let f = flips.clone();
        bus.subscribe(EventKind::Connection, move |ev| {
            if let BridgeEvent::Connection { state, .. } = ev {
                f.lock().unwrap().push(*state);
            }
            Ok(())
        });
        let t = transport(connector.clone(), Duration::from_millis(100), bus);

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let t = t.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { t.run(tx, cancel).await })
        };

        feed.push(RawEvent::message("p1", "before", 1.0));
        assert_eq!(rx.recv().await.unwrap().text, "before");
        feed.disconnect();
        feed.push(RawEvent::message("p1", "after", 2.0));
        assert_eq!(rx.recv().await.unwrap().text, "after");
        assert_eq!(t.connect_attempts(), 2);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(
            *flips.lock().unwrap(),
            vec![
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test]
    async fn second_run_is_rejected_while_active() {
        let (connector, _feed) = MemoryConnector::new();
        let t = transport(connector, Duration::from_millis(10), Arc::new(EventBus::new()));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = {
            let t = t.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { t.run(tx, cancel).await })
        };
        let mut state = t.watch_state();
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let err = t.run(tx, cancel.clone()).await.unwrap_err();
        assert!(err.is_transport());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_during_backoff_returns_promptly() {
        let (connector, _feed) = MemoryConnector::new();
        connector.fail_next(u32::MAX);
        let t = transport(connector, Duration::from_secs(3600), Arc::new(EventBus::new()));
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let task = {
            let t = t.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { t.run(tx, cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run returns after cancel")
            .unwrap()
            .unwrap();
        assert_eq!(t.connect_attempts(), 1);
    }
}
