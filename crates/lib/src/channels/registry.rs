//! Account registry: look up running accounts by id.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::channels::sidecar::OutboundSender;
use crate::channels::transport::ConnectionState;

/// Handle to a running account (stop, send, current state).
pub trait AccountHandle: Send + Sync {
    fn account_id(&self) -> &str;
    /// Stop the account's transport. Idempotent.
    fn stop(&self);
    fn state(&self) -> ConnectionState;
    fn sender(&self) -> Arc<dyn OutboundSender>;
}

/// Registry of account ids to handles. Shared by the service and the gateway.
#[derive(Clone)]
pub struct AccountRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn AccountHandle>>>>,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handle; an existing handle with the same id is stopped.
    pub async fn register(&self, handle: Arc<dyn AccountHandle>) {
        let mut g = self.inner.write().await;
        if let Some(old) = g.insert(handle.account_id().to_string(), handle) {
            log::info!("replacing running account {}", old.account_id());
            old.stop();
        }
    }

    pub async fn get(&self, account_id: &str) -> Option<Arc<dyn AccountHandle>> {
        let g = self.inner.read().await;
        g.get(account_id).cloned()
    }

    /// Resolve an optional account id: explicit id, else `default`, else the only account.
    pub async fn resolve(&self, account_id: Option<&str>) -> Option<Arc<dyn AccountHandle>> {
        let g = self.inner.read().await;
        match account_id {
            Some(id) => g.get(id).cloned(),
            None => g
                .get(crate::config::DEFAULT_ACCOUNT_ID)
                .cloned()
                .or_else(|| (g.len() == 1).then(|| g.values().next().cloned()).flatten()),
        }
    }

    pub async fn ids(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut ids: Vec<String> = g.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// `(account_id, state)` for every registered account, sorted by id.
    pub async fn states(&self) -> Vec<(String, ConnectionState)> {
        let g = self.inner.read().await;
        let mut out: Vec<_> = g
            .values()
            .map(|h| (h.account_id().to_string(), h.state()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Stop and remove every handle.
    pub async fn stop_all(&self) {
        let mut g = self.inner.write().await;
        for (_, handle) in g.drain() {
            handle.stop();
        }
    }
}
