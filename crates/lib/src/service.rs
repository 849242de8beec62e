//! Bridge service: explicitly constructed handle owning every per-account loop.
//!
//! Each enabled account gets two tasks. The transport task keeps the sidecar connection
//! alive and pushes raw events into a channel. The worker task takes them in arrival
//! order: normalize, publish, route, drop replays, dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channels::events::{BridgeEvent, EventBus};
use crate::channels::inbound::{now_ms, EventNormalizer, RawEvent};
use crate::channels::registry::{AccountHandle, AccountRegistry};
use crate::channels::sidecar::{OutboundSender, SidecarClient};
use crate::channels::transport::{
    connector_for, retry_interval_for, ConnectionState, Connector, MemoryConnector,
    SidecarTransport,
};
use crate::config::{self, Account, BridgeSettings, Config, TransportMode};
use crate::dispatch::{DispatchCoordinator, DispatchOutcome, ReplyPipeline};
use crate::error::{BridgeError, Result};
use crate::routing::{resolve_route, ConfigRouteResolver, RouteResolver, CHANNEL_ID};
use crate::session::{JsonSessionStore, SessionStore, SessionTracker};

/// Raw events buffered between an account's transport and its worker.
const INBOUND_BUFFER: usize = 64;

/// What happened to one raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    /// Published as a friend request; not dispatched.
    FriendRequest,
    /// Same upstream message id as the previous event of the session.
    Replay,
    Dispatched(DispatchOutcome),
}

pub struct BridgeService {
    accounts: Vec<Arc<Account>>,
    settings: BridgeSettings,
    resolver: Arc<dyn RouteResolver>,
    tracker: Arc<SessionTracker>,
    coordinator: Arc<DispatchCoordinator>,
    events: Arc<EventBus>,
    registry: AccountRegistry,
    memory: Mutex<HashMap<String, MemoryConnector>>,
    senders: HashMap<String, Arc<dyn OutboundSender>>,
    cancel: CancellationToken,
    transport_tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BridgeService {
    pub fn new(
        accounts: Vec<Account>,
        settings: BridgeSettings,
        pipeline: Arc<dyn ReplyPipeline>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let tracker = Arc::new(SessionTracker::new(store));
        let coordinator = Arc::new(DispatchCoordinator::new(
            pipeline,
            tracker.clone(),
            settings.dispatch_timeout,
        ));
        Self {
            accounts: accounts.into_iter().map(Arc::new).collect(),
            settings,
            resolver: Arc::new(ConfigRouteResolver::new(&Default::default())),
            tracker,
            coordinator,
            events: Arc::new(EventBus::new()),
            registry: AccountRegistry::new(),
            memory: Mutex::new(HashMap::new()),
            senders: HashMap::new(),
            cancel: CancellationToken::new(),
            transport_tasks: AsyncMutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Accounts, settings and environment overrides from `config`; JSON session store.
    pub fn from_config(config: &Config, pipeline: Arc<dyn ReplyPipeline>) -> Result<Self> {
        let accounts = config::resolve_accounts(config)?;
        let settings = config::resolve_settings(config);
        let store = Arc::new(JsonSessionStore::new(config.session.store.clone()));
        Ok(Self::new(accounts, settings, pipeline, store)
            .with_resolver(Arc::new(ConfigRouteResolver::new(&config.agents))))
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn RouteResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Feed for an account when the transport mode is `memory`.
    pub fn with_memory_connector(self, account_id: impl Into<String>, connector: MemoryConnector) -> Self {
        self.memory
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.into(), connector);
        self
    }

    /// Replace the sidecar client as an account's outbound sender.
    pub fn with_sender(mut self, account_id: impl Into<String>, sender: Arc<dyn OutboundSender>) -> Self {
        self.senders.insert(account_id.into(), sender);
        self
    }

    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn accounts(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    /// Health-check every enabled account, then start its loop. An unhealthy sidecar, or the
    /// memory transport without an injected connector, fails start before anything is spawned. Calling start twice is a no-op; a stopped service
    /// cannot be restarted.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("bridge service already started");
            return Ok(());
        }
        let enabled: Vec<Arc<Account>> = self
            .accounts
            .iter()
            .filter(|a| {
                if !a.enabled {
                    log::info!("account {} disabled, skipping", a.account_id);
                }
                a.enabled
            })
            .cloned()
            .collect();
        if enabled.is_empty() {
            log::warn!("no enabled beagle accounts");
        }

        let clients: Vec<SidecarClient> = enabled
            .iter()
            .map(|a| SidecarClient::new(a.clone(), &self.settings))
            .collect();
        if self.settings.transport != TransportMode::Memory {
            for client in &clients {
                client.health().await.map_err(|e| {
                    self.started.store(false, Ordering::SeqCst);
                    BridgeError::SidecarUnhealthy {
                        account_id: client.account().account_id.clone(),
                        reason: e.to_string(),
                    }
                })?;
            }
        }

        let mode = self.settings.transport;
        let mut ready = Vec::with_capacity(clients.len());
        {
            let mut memory = self.memory.lock().unwrap_or_else(|e| e.into_inner());
            for client in clients {
                let injected = memory.remove(&client.account().account_id);
                match connector_for(mode, client.clone(), injected) {
                    Ok(connector) => ready.push((client, connector)),
                    Err(e) => {
                        self.started.store(false, Ordering::SeqCst);
                        return Err(e);
                    }
                }
            }
        }

        for (client, connector) in ready {
            self.start_account(client, connector).await;
        }
        Ok(())
    }

    async fn start_account(&self, client: SidecarClient, connector: Arc<dyn Connector>) {
        let account_id = client.account().account_id.clone();
        let sender: Arc<dyn OutboundSender> = match self.senders.get(&account_id) {
            Some(s) => s.clone(),
            None => Arc::new(client.clone()),
        };
        let mode = self.settings.transport;
        let transport = Arc::new(SidecarTransport::new(
            account_id.clone(),
            connector,
            retry_interval_for(mode, &self.settings),
            self.events.clone(),
        ));
        let cancel = self.cancel.child_token();
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);

        let worker = AccountWorker {
            account_id: account_id.clone(),
            normalizer: EventNormalizer::new(self.settings.timestamp_threshold),
            resolver: self.resolver.clone(),
            tracker: self.tracker.clone(),
            coordinator: self.coordinator.clone(),
            events: self.events.clone(),
            sender: sender.clone(),
        };
        tokio::spawn(worker.run(rx, cancel.clone()));

        let t = transport.clone();
        let c = cancel.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = t.run(tx, c).await {
                log::warn!("transport for account {} did not start: {}", t.account_id(), e);
            }
        });
        self.transport_tasks.lock().await.push(handle);

        log::info!(
            "beagle account {} started via {} transport",
            account_id,
            mode.as_str()
        );
        self.registry
            .register(Arc::new(RunningAccount {
                account_id,
                transport,
                sender,
                cancel,
            }))
            .await;
    }

    /// Close transports and abandon pending reconnects. In-flight dispatches finish on their own.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.registry.stop_all().await;
        let tasks = std::mem::take(&mut *self.transport_tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(self.settings.request_timeout, task)
                .await
                .is_err()
            {
                log::debug!("transport still finishing an in-flight call after stop");
            }
        }
        log::info!("bridge service stopped");
    }

    /// Outbound sender of a running account (`None` id resolves to `default` or the only account).
    pub async fn sender_for(&self, account_id: Option<&str>) -> Option<Arc<dyn OutboundSender>> {
        self.registry.resolve(account_id).await.map(|h| h.sender())
    }

    pub async fn account_states(&self) -> Vec<(String, ConnectionState)> {
        self.registry.states().await
    }
}

struct RunningAccount {
    account_id: String,
    transport: Arc<SidecarTransport>,
    sender: Arc<dyn OutboundSender>,
    cancel: CancellationToken,
}

impl AccountHandle for RunningAccount {
    fn account_id(&self) -> &str {
        &self.account_id
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn state(&self) -> ConnectionState {
        self.transport.state()
    }

    fn sender(&self) -> Arc<dyn OutboundSender> {
        self.sender.clone()
    }
}

struct AccountWorker {
    account_id: String,
    normalizer: EventNormalizer,
    resolver: Arc<dyn RouteResolver>,
    tracker: Arc<SessionTracker>,
    coordinator: Arc<DispatchCoordinator>,
    events: Arc<EventBus>,
    sender: Arc<dyn OutboundSender>,
}

impl AccountWorker {
    async fn run(self, mut rx: mpsc::Receiver<RawEvent>, cancel: CancellationToken) {
        loop {
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                raw = rx.recv() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };
            self.process_event(raw).await;
        }
        log::debug!("event worker stopped account={}", self.account_id);
    }

    async fn process_event(&self, raw: RawEvent) -> EventDisposition {
        if raw.is_friend_request() {
            log::info!("friend request account={} peer={}", self.account_id, raw.peer);
            self.events.publish(&BridgeEvent::FriendRequest {
                account_id: self.account_id.clone(),
                peer_id: raw.peer,
                hello: raw.text,
            });
            return EventDisposition::FriendRequest;
        }

        let message = self.normalizer.normalize(&raw, now_ms());
        self.events.publish(&BridgeEvent::Message {
            account_id: self.account_id.clone(),
            message: message.clone(),
        });
        let route = resolve_route(
            self.resolver.as_ref(),
            CHANNEL_ID,
            &self.account_id,
            &message.peer_id,
        );
        let upstream_id = raw.msg_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
        if let Some(id) = upstream_id {
            if self.tracker.is_replay(&route.session_key, id) {
                log::debug!(
                    "dropping replayed message account={} peer={} id={}",
                    self.account_id,
                    message.peer_id,
                    id
                );
                return EventDisposition::Replay;
            }
        }
        let outcome = self
            .coordinator
            .dispatch(&message, &route, self.sender.clone())
            .await;
        EventDisposition::Dispatched(outcome)
    }
}
