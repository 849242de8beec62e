//! Session tracking for inbound conversations.
//!
//! The store keeps one entry per session key (last update time, last message id and the
//! last context payload). Writes are best-effort: a failing store is logged and never
//! blocks dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, RwLock};

use crate::dispatch::InboundContext;

/// What the store remembers about one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntry {
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_context: Option<serde_json::Value>,
}

impl SessionEntry {
    fn from_context(ctx: &InboundContext) -> Self {
        Self {
            updated_at: ctx.timestamp,
            last_message_id: Some(ctx.message_sid.clone()),
            last_context: serde_json::to_value(ctx).ok(),
        }
    }
}

/// Session-store contract. Entries are scoped by agent, keyed by session key.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn read_entry(&self, agent_id: &str, session_key: &str)
        -> anyhow::Result<Option<SessionEntry>>;

    async fn record_inbound_session(
        &self,
        agent_id: &str,
        session_key: &str,
        ctx: &InboundContext,
    ) -> anyhow::Result<()>;
}

/// In-process store.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: RwLock<HashMap<(String, String), SessionEntry>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn read_entry(
        &self,
        agent_id: &str,
        session_key: &str,
    ) -> anyhow::Result<Option<SessionEntry>> {
        let g = self.entries.read().await;
        Ok(g.get(&(agent_id.to_string(), session_key.to_string())).cloned())
    }

    async fn record_inbound_session(
        &self,
        agent_id: &str,
        session_key: &str,
        ctx: &InboundContext,
    ) -> anyhow::Result<()> {
        let mut g = self.entries.write().await;
        g.insert(
            (agent_id.to_string(), session_key.to_string()),
            SessionEntry::from_context(ctx),
        );
        Ok(())
    }
}

/// Store path for an agent. `template` may contain `{agentId}` and a leading `~/`.
/// Default: `~/.beagle/agents/<agentId>/sessions.json`.
pub fn resolve_store_path(template: Option<&str>, agent_id: &str) -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    match template.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => {
            let t = t.replace("{agentId}", agent_id);
            match t.strip_prefix("~/") {
                Some(rest) => home.join(rest),
                None => PathBuf::from(t),
            }
        }
        None => home
            .join(".beagle")
            .join("agents")
            .join(agent_id)
            .join("sessions.json"),
    }
}

/// JSON file per agent: `{ sessionKey: SessionEntry }`. Read-modify-write, last write wins.
pub struct JsonSessionStore {
    template: Option<String>,
    write_lock: AsyncMutex<()>,
}

impl JsonSessionStore {
    pub fn new(template: Option<String>) -> Self {
        Self {
            template,
            write_lock: AsyncMutex::new(()),
        }
    }

    pub fn path_for(&self, agent_id: &str) -> PathBuf {
        resolve_store_path(self.template.as_deref(), agent_id)
    }

    async fn load(path: &Path) -> anyhow::Result<BTreeMap<String, SessionEntry>> {
        match tokio::fs::read_to_string(path).await {
            Ok(s) if s.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn read_entry(
        &self,
        agent_id: &str,
        session_key: &str,
    ) -> anyhow::Result<Option<SessionEntry>> {
        let entries = Self::load(&self.path_for(agent_id)).await?;
        Ok(entries.get(session_key).cloned())
    }

    async fn record_inbound_session(
        &self,
        agent_id: &str,
        session_key: &str,
        ctx: &InboundContext,
    ) -> anyhow::Result<()> {
        let path = self.path_for(agent_id);
        let _g = self.write_lock.lock().await;
        let mut entries = Self::load(&path).await.unwrap_or_else(|e| {
            log::warn!("session store {} unreadable, starting fresh: {}", path.display(), e);
            BTreeMap::new()
        });
        entries.insert(session_key.to_string(), SessionEntry::from_context(ctx));
        let json = serde_json::to_string_pretty(&entries)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, json).await?;
        Ok(())
    }
}

/// Best-effort wrapper over a [`SessionStore`], plus replay detection.
pub struct SessionTracker {
    store: Arc<dyn SessionStore>,
    /// session key -> last upstream message id.
    last_ids: Mutex<HashMap<String, String>>,
}

impl SessionTracker {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            last_ids: Mutex::new(HashMap::new()),
        }
    }

    pub async fn read_session_updated_at(&self, agent_id: &str, session_key: &str) -> Option<i64> {
        match self.store.read_entry(agent_id, session_key).await {
            Ok(entry) => entry.map(|e| e.updated_at),
            Err(e) => {
                log::warn!("session read failed session={}: {:#}", session_key, e);
                None
            }
        }
    }

    /// Never fails; errors are logged.
    pub async fn record_inbound_session(&self, agent_id: &str, session_key: &str, ctx: &InboundContext) {
        if let Err(e) = self
            .store
            .record_inbound_session(agent_id, session_key, ctx)
            .await
        {
            log::warn!(
                "session record failed session={} peer={}: {:#}",
                session_key,
                ctx.sender_id,
                e
            );
        }
    }

    /// True when `message_id` equals the last upstream id seen for this session.
    /// Records the id either way.
    pub fn is_replay(&self, session_key: &str, message_id: &str) -> bool {
        let mut g = self.last_ids.lock().unwrap_or_else(|e| e.into_inner());
        match g.insert(session_key.to_string(), message_id.to_string()) {
            Some(prev) => prev == message_id,
            None => false,
        }
    }
}
