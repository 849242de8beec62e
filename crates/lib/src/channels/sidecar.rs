//! Sidecar HTTP client: health, send, sendMedia, and long-poll event retrieval.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::channels::inbound::{lenient_number, lenient_string, now_ms, normalize_timestamp, RawEvent};
use crate::config::{Account, BridgeSettings};
use crate::error::{BridgeError, Result};

/// Extra slack on top of the long-poll wait before the HTTP client gives up.
const POLL_GRACE: Duration = Duration::from_secs(5);

/// Result of a successful text send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: String,
    pub timestamp_ms: i64,
}

/// Media to send. Exactly one of `media_path` / `media_url` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl MediaMessage {
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            media_type: guess_media_type(&url).to_string(),
            media_url: Some(url),
            ..Self::default()
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into()).filter(|c: &String| !c.is_empty());
        self
    }

    /// Usage check done before any network call.
    pub fn validate(&self) -> Result<()> {
        let path = self.media_path.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let url = self.media_url.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match (path, url) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(BridgeError::InvalidMediaReference(
                "both mediaPath and mediaUrl are set".to_string(),
            )),
            (None, None) => Err(BridgeError::InvalidMediaReference(
                "one of mediaPath or mediaUrl is required".to_string(),
            )),
        }
    }
}

/// Coarse media type from a URL or path extension.
pub fn guess_media_type(reference: &str) -> &'static str {
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let ext = path
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" | "jpg" | "jpeg" | "gif" | "webp" | "bmp" => "image",
        "mp4" | "mov" | "webm" | "mkv" => "video",
        "mp3" | "ogg" | "wav" | "m4a" | "opus" => "audio",
        _ => "file",
    }
}

/// Sends text and media to a peer. Implemented by [`SidecarClient`]; tests substitute recorders.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send_text(&self, peer_id: &str, text: &str) -> Result<SentMessage>;

    async fn send_media(&self, peer_id: &str, media: &MediaMessage) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    peer: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    message_id: String,
    #[serde(default, deserialize_with = "lenient_number")]
    timestamp: f64,
    #[serde(default = "default_true")]
    success: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct SendMediaRequest<'a> {
    peer: &'a str,
    #[serde(flatten)]
    media: &'a MediaMessage,
}

/// HTTP client for one account's sidecar.
#[derive(Clone)]
pub struct SidecarClient {
    account: Arc<Account>,
    client: reqwest::Client,
    request_timeout: Duration,
    poll_timeout: Duration,
    timestamp_threshold: i64,
}

impl SidecarClient {
    pub fn new(account: Arc<Account>, settings: &BridgeSettings) -> Self {
        Self {
            account,
            client: reqwest::Client::new(),
            request_timeout: settings.request_timeout,
            poll_timeout: settings.poll_timeout,
            timestamp_threshold: settings.timestamp_threshold,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.account.sidecar_base_url, path)
    }

    /// `Bearer <token>` when the account has one.
    pub fn bearer(&self) -> Option<String> {
        let token = self.account.auth_token.as_deref()?;
        Some(format!("Bearer {}", token))
    }

    fn auth_header(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.bearer()?).ok()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .timeout(self.request_timeout);
        if let Some(auth) = self.auth_header() {
            req = req.header(AUTHORIZATION, auth);
        }
        req
    }

    /// WebSocket URL for streamed mode: http(s) -> ws(s), plus `/events`.
    pub fn events_ws_url(&self) -> String {
        let base = &self.account.sidecar_base_url;
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.clone()
        };
        format!("{}/events", ws)
    }

    /// GET /health; Ok only on 200.
    pub async fn health(&self) -> Result<()> {
        let res = self.request(reqwest::Method::GET, "/health").send().await?;
        if res.status() != reqwest::StatusCode::OK {
            return Err(BridgeError::transport_msg(
                "health",
                format!("status {}", res.status()),
            ));
        }
        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        match self.health().await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("sidecar health check failed account={}: {}", self.account.account_id, e);
                false
            }
        }
    }

    /// Long poll: GET /events?timeout=N. Returns zero or more events.
    pub async fn poll_events(&self) -> Result<Vec<RawEvent>> {
        let mut req = self
            .client
            .get(self.url("/events"))
            .query(&[("timeout", self.poll_timeout.as_secs())])
            .timeout(self.poll_timeout + POLL_GRACE);
        if let Some(auth) = self.auth_header() {
            req = req.header(AUTHORIZATION, auth);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BridgeError::transport_msg(
                "poll events",
                format!("{} {}", status, body),
            ));
        }
        let body = res.text().await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        RawEvent::parse_batch(&body)
    }
}

#[async_trait]
impl OutboundSender for SidecarClient {
    /// POST /send {peer, text}.
    async fn send_text(&self, peer_id: &str, text: &str) -> Result<SentMessage> {
        let body = SendRequest {
            peer: peer_id,
            text,
        };
        let res = self
            .request(reqwest::Method::POST, "/send")
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BridgeError::transport_msg(
                "send",
                format!("{} {}", status, body),
            ));
        }
        let data: SendResponse = res.json().await?;
        if !data.success {
            return Err(BridgeError::transport_msg(
                "send",
                "sidecar reported success: false",
            ));
        }
        Ok(SentMessage {
            message_id: data.message_id,
            timestamp_ms: normalize_timestamp(data.timestamp, now_ms(), self.timestamp_threshold),
        })
    }

    /// POST /sendMedia. Validates the media reference before touching the network.
    async fn send_media(&self, peer_id: &str, media: &MediaMessage) -> Result<()> {
        media.validate()?;
        let body = SendMediaRequest {
            peer: peer_id,
            media,
        };
        let res = self
            .request(reqwest::Method::POST, "/sendMedia")
            .json(&body)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(BridgeError::transport_msg(
                "sendMedia",
                format!("{} {}", status, body),
            ));
        }
        Ok(())
    }
}
