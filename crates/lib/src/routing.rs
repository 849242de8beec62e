//! Routing: (channel, account, peer) -> agent and session key.
//!
//! Agent selection walks the configured bindings from most to least specific and
//! falls back to the default agent. The session key never depends on the agent.

use crate::config::{AgentBinding, AgentsConfig};

/// Channel id used in session keys and context payloads.
pub const CHANNEL_ID: &str = "beagle";

/// Agent picked for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRoute {
    pub agent_id: String,
    pub account_id: String,
}

/// Routing context for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteContext {
    pub agent_id: String,
    pub session_key: String,
    pub account_id: String,
}

/// `"<channel>:<accountId>:<peerId>"`.
pub fn session_key(channel: &str, account_id: &str, peer_id: &str) -> String {
    format!("{}:{}:{}", channel, account_id, peer_id)
}

/// Agent-selection policy.
pub trait RouteResolver: Send + Sync {
    fn resolve_agent_route(&self, channel: &str, account_id: &str, peer: &str) -> AgentRoute;
}

/// Build the full context for an event.
pub fn resolve_route(
    resolver: &dyn RouteResolver,
    channel: &str,
    account_id: &str,
    peer: &str,
) -> RouteContext {
    let route = resolver.resolve_agent_route(channel, account_id, peer);
    RouteContext {
        session_key: session_key(channel, &route.account_id, peer),
        agent_id: route.agent_id,
        account_id: route.account_id,
    }
}

/// Resolver backed by `agents.bindings` from config.
#[derive(Debug, Clone)]
pub struct ConfigRouteResolver {
    default_agent: String,
    bindings: Vec<AgentBinding>,
}

impl ConfigRouteResolver {
    pub fn new(agents: &AgentsConfig) -> Self {
        Self {
            default_agent: agents.default_agent.clone(),
            bindings: agents.bindings.clone(),
        }
    }

    fn find(&self, pred: impl Fn(&AgentBinding) -> bool) -> Option<&AgentBinding> {
        self.bindings.iter().find(|b| pred(b))
    }
}

impl RouteResolver for ConfigRouteResolver {
    fn resolve_agent_route(&self, _channel: &str, account_id: &str, peer: &str) -> AgentRoute {
        let acct = |b: &AgentBinding| b.account_id.as_deref() == Some(account_id);
        let peer_is = |b: &AgentBinding| b.peer.as_deref() == Some(peer);
        let binding = self
            .find(|b| peer_is(b) && acct(b))
            .or_else(|| self.find(|b| peer_is(b) && b.account_id.is_none()))
            .or_else(|| self.find(|b| acct(b) && b.peer.is_none()));
        AgentRoute {
            agent_id: binding
                .map(|b| b.agent_id.clone())
                .unwrap_or_else(|| self.default_agent.clone()),
            account_id: account_id.to_string(),
        }
    }
}
