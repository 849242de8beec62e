//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.beagle/config.json`) and environment.
//! Every field is optional; defaults match the sidecar's stock setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::BridgeError;

/// Account id used when no accounts are configured.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Sidecar base URL when an account does not set one.
pub const DEFAULT_SIDECAR_BASE_URL: &str = "http://127.0.0.1:39091";

/// Raw timestamps above this are treated as over-scaled and divided by 1000.
pub const DEFAULT_TIMESTAMP_THRESHOLD: i64 = 10_000_000_000_000;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Local HTTP surface (status + outbound send).
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Channel settings; only `beagle` today.
    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Agent routing and the reply runtime endpoint.
    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Gateway bind and port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the HTTP surface (default 39190).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
}

fn default_gateway_port() -> u16 {
    39190
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub beagle: BeagleChannelConfig,
}

/// How events are pulled from the sidecar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Persistent WebSocket on `/events`.
    Stream,
    /// Long-poll `GET /events`.
    #[default]
    Poll,
    /// In-process queue; events are injected through a `MemoryFeed`.
    Memory,
}

impl TransportMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "stream" | "ws" | "websocket" => Some(Self::Stream),
            "poll" | "polling" => Some(Self::Poll),
            "memory" => Some(Self::Memory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::Poll => "poll",
            Self::Memory => "memory",
        }
    }
}

/// Beagle channel config: transport strategy, intervals, and accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeagleChannelConfig {
    #[serde(default)]
    pub transport: TransportMode,

    /// Delay before reopening a closed WebSocket. Overridden by BEAGLE_RECONNECT_INTERVAL_MS.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Delay after a failed poll. Overridden by BEAGLE_POLL_BACKOFF_MS.
    #[serde(default = "default_poll_backoff_ms")]
    pub poll_backoff_ms: u64,

    /// Long-poll wait the sidecar may hold a request for.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// Timeout for send / sendMedia / health calls.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Raw event timestamps strictly above this are divided by 1000.
    #[serde(default = "default_timestamp_threshold")]
    pub timestamp_threshold: i64,

    /// Accounts by id. Empty means a single `default` account.
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountConfig>,
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_poll_backoff_ms() -> u64 {
    1000
}

fn default_poll_timeout_secs() -> u64 {
    25
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_timestamp_threshold() -> i64 {
    DEFAULT_TIMESTAMP_THRESHOLD
}

impl Default for BeagleChannelConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::default(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            poll_backoff_ms: default_poll_backoff_ms(),
            poll_timeout_secs: default_poll_timeout_secs(),
            request_timeout_ms: default_request_timeout_ms(),
            timestamp_threshold: default_timestamp_threshold(),
            accounts: BTreeMap::new(),
        }
    }
}

/// One sidecar endpoint as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub sidecar_base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub auth_token: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            sidecar_base_url: None,
            enabled: true,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfig {
    /// Budget for one reply-pipeline run. Overridden by BEAGLE_DISPATCH_TIMEOUT_MS.
    #[serde(default = "default_dispatch_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_dispatch_timeout_ms() -> u64 {
    30_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_dispatch_timeout_ms(),
        }
    }
}

/// Agent routing: default agent, explicit bindings, and the reply runtime endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default = "default_agent_id")]
    pub default_agent: String,

    /// Base URL of the agent runtime (`POST {runtimeUrl}/dispatch`). Overridden by BEAGLE_RUNTIME_URL.
    pub runtime_url: Option<String>,

    /// HTTP timeout for one runtime call. Defaults to twice the dispatch timeout, so a
    /// dispatch abandoned on timeout still ends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,

    /// First match wins: peer+account, then peer, then account.
    #[serde(default)]
    pub bindings: Vec<AgentBinding>,
}

fn default_agent_id() -> String {
    "main".to_string()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_agent: default_agent_id(),
            runtime_url: None,
            request_timeout_ms: None,
            bindings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentBinding {
    pub agent_id: String,
    pub account_id: Option<String>,
    pub peer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Session store path; `{agentId}` is replaced with the routed agent id.
    pub store: Option<String>,
}

/// A resolved sidecar endpoint. Immutable for the lifetime of its loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub account_id: String,
    /// Base URL without trailing slash.
    pub sidecar_base_url: String,
    pub enabled: bool,
    pub auth_token: Option<String>,
}

impl Account {
    pub fn new(account_id: impl Into<String>, sidecar_base_url: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            sidecar_base_url: sidecar_base_url.into().trim_end_matches('/').to_string(),
            enabled: true,
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// Transport and dispatch settings after env overrides.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub transport: TransportMode,
    pub reconnect_interval: Duration,
    pub poll_backoff: Duration,
    pub poll_timeout: Duration,
    pub request_timeout: Duration,
    pub timestamp_threshold: i64,
    pub dispatch_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl BridgeSettings {
    /// Settings from the config file only (no environment).
    pub fn from_config(config: &Config) -> Self {
        let beagle = &config.channels.beagle;
        Self {
            transport: beagle.transport,
            reconnect_interval: Duration::from_millis(beagle.reconnect_interval_ms),
            poll_backoff: Duration::from_millis(beagle.poll_backoff_ms),
            poll_timeout: Duration::from_secs(beagle.poll_timeout_secs),
            request_timeout: Duration::from_millis(beagle.request_timeout_ms),
            timestamp_threshold: beagle.timestamp_threshold,
            dispatch_timeout: Duration::from_millis(config.dispatch.timeout_ms),
        }
    }
}

/// Non-empty trimmed value of an environment variable.
fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Parse a millisecond override; an unparseable value is ignored with a warning.
fn parse_ms_override(name: &str, raw: Option<String>) -> Option<u64> {
    let raw = raw?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(ms),
        Err(_) => {
            log::warn!("ignoring {}={:?}: not a millisecond count", name, raw);
            None
        }
    }
}

/// Resolve transport/dispatch settings: env BEAGLE_* overrides config.
pub fn resolve_settings(config: &Config) -> BridgeSettings {
    let mut settings = BridgeSettings::from_config(config);
    if let Some(ms) = parse_ms_override(
        "BEAGLE_DISPATCH_TIMEOUT_MS",
        env_override("BEAGLE_DISPATCH_TIMEOUT_MS"),
    ) {
        settings.dispatch_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_ms_override(
        "BEAGLE_RECONNECT_INTERVAL_MS",
        env_override("BEAGLE_RECONNECT_INTERVAL_MS"),
    ) {
        settings.reconnect_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = parse_ms_override(
        "BEAGLE_POLL_BACKOFF_MS",
        env_override("BEAGLE_POLL_BACKOFF_MS"),
    ) {
        settings.poll_backoff = Duration::from_millis(ms);
    }
    if let Some(raw) = env_override("BEAGLE_TRANSPORT") {
        match TransportMode::parse(&raw) {
            Some(mode) => settings.transport = mode,
            None => log::warn!("ignoring BEAGLE_TRANSPORT={:?}: unknown transport", raw),
        }
    }
    settings
}

/// Resolve the agent runtime URL: env BEAGLE_RUNTIME_URL overrides config.
pub fn resolve_runtime_url(config: &Config) -> Option<String> {
    env_override("BEAGLE_RUNTIME_URL").or_else(|| {
        config
            .agents
            .runtime_url
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// HTTP timeout for runtime calls: `agents.requestTimeoutMs`, else twice the dispatch timeout.
pub fn resolve_runtime_timeout(config: &Config, settings: &BridgeSettings) -> Duration {
    config
        .agents
        .request_timeout_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.dispatch_timeout.saturating_mul(2))
}

/// Resolve accounts from config. No configured accounts yields the single `default` account.
/// BEAGLE_SIDECAR_URL and BEAGLE_AUTH_TOKEN override the `default` account.
pub fn resolve_accounts(config: &Config) -> Result<Vec<Account>, BridgeError> {
    let mut accounts = accounts_from_config(config)?;
    let url = env_override("BEAGLE_SIDECAR_URL");
    let token = env_override("BEAGLE_AUTH_TOKEN");
    if let Some(default) = accounts
        .iter_mut()
        .find(|a| a.account_id == DEFAULT_ACCOUNT_ID)
    {
        if let Some(url) = url {
            default.sidecar_base_url = validate_base_url(DEFAULT_ACCOUNT_ID, &url)?;
        }
        if token.is_some() {
            default.auth_token = token;
        }
    }
    Ok(accounts)
}

fn accounts_from_config(config: &Config) -> Result<Vec<Account>, BridgeError> {
    let configured = &config.channels.beagle.accounts;
    if configured.is_empty() {
        return Ok(vec![Account::new(DEFAULT_ACCOUNT_ID, DEFAULT_SIDECAR_BASE_URL)]);
    }
    configured
        .iter()
        .map(|(id, acc)| {
            let url = acc
                .sidecar_base_url
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(DEFAULT_SIDECAR_BASE_URL);
            Ok(Account {
                account_id: id.clone(),
                sidecar_base_url: validate_base_url(id, url)?,
                enabled: acc.enabled,
                auth_token: acc
                    .auth_token
                    .as_ref()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            })
        })
        .collect()
}

fn validate_base_url(account_id: &str, url: &str) -> Result<String, BridgeError> {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_string())
    } else {
        Err(BridgeError::Config(format!(
            "account {}: sidecarBaseUrl must be http(s), got {:?}",
            account_id, url
        )))
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("BEAGLE_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".beagle").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the default path (or BEAGLE_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
