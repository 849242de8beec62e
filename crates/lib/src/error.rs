//! Bridge error taxonomy.
//!
//! Transport failures are recovered inside the account loop, per-event failures inside
//! event processing. Only `SidecarUnhealthy` and `Config` escape `BridgeService::start`.

/// Result type for bridge operations.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Plain classification of a [`BridgeError`], for matching without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TransportFailure,
    MalformedEvent,
    DispatchTimeout,
    DispatchFailure,
    InvalidMediaReference,
    SidecarUnhealthy,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Connect, read, or send failed at the network level. Retried by the transport loop.
    #[error("sidecar transport failed: {context}: {source}")]
    TransportFailure {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A raw payload from the sidecar could not be parsed. The event is dropped.
    #[error("malformed sidecar event: {0}")]
    MalformedEvent(String),

    /// The reply pipeline did not finish inside the dispatch budget.
    #[error("dispatch timeout after {timeout_ms}ms")]
    DispatchTimeout { timeout_ms: u64 },

    /// The reply pipeline returned an error or panicked.
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    /// sendMedia needs exactly one of mediaPath / mediaUrl.
    #[error("invalid media reference: {0}")]
    InvalidMediaReference(String),

    /// The sidecar did not answer GET /health with 200 at startup.
    #[error("sidecar for account {account_id} is not healthy: {reason}")]
    SidecarUnhealthy { account_id: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransportFailure { .. } => ErrorKind::TransportFailure,
            Self::MalformedEvent(_) => ErrorKind::MalformedEvent,
            Self::DispatchTimeout { .. } => ErrorKind::DispatchTimeout,
            Self::DispatchFailure(_) => ErrorKind::DispatchFailure,
            Self::InvalidMediaReference(_) => ErrorKind::InvalidMediaReference,
            Self::SidecarUnhealthy { .. } => ErrorKind::SidecarUnhealthy,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    #[must_use]
    pub fn transport(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::TransportFailure {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Transport failure without an underlying error value (e.g. a non-2xx status).
    #[must_use]
    pub fn transport_msg(context: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::TransportFailure {
            context: context.into(),
            source: message.into(),
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::TransportFailure
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        Self::transport("sidecar http request", e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::transport("sidecar websocket", e)
    }
}
