//! Inbound events from the sidecar and their canonical form.
//!
//! The sidecar emits `{peer, text, ts, msgId?}` frames where `ts` may be seconds,
//! milliseconds, or an over-scaled value. [`EventNormalizer`] turns them into
//! [`InboundMessage`] without ever failing on missing or oddly-typed fields.

use serde::{Deserialize, Deserializer};

use crate::config::DEFAULT_TIMESTAMP_THRESHOLD;
use crate::error::BridgeError;

/// Frame type for friend requests; everything else is a chat message.
const FRIEND_REQUEST_TYPE: &str = "friendRequest";

/// Event payload as emitted by the sidecar. Transient.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default, deserialize_with = "lenient_string")]
    pub peer: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub text: String,
    /// Seconds or milliseconds, depending on the sidecar build.
    #[serde(default, deserialize_with = "lenient_number")]
    pub ts: f64,
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub msg_id: Option<String>,
    /// `"friendRequest"` for friend requests; absent for messages.
    #[serde(default, rename = "type", deserialize_with = "lenient_opt_string")]
    pub kind: Option<String>,
}

impl RawEvent {
    pub fn message(peer: impl Into<String>, text: impl Into<String>, ts: f64) -> Self {
        Self {
            peer: peer.into(),
            text: text.into(),
            ts,
            ..Self::default()
        }
    }

    pub fn with_msg_id(mut self, id: impl Into<String>) -> Self {
        self.msg_id = Some(id.into());
        self
    }

    /// Parse one WebSocket frame. Only non-object JSON is malformed; missing fields default.
    pub fn parse(text: &str) -> Result<Self, BridgeError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| BridgeError::MalformedEvent(e.to_string()))?;
        Self::from_value(value)
    }

    /// Parse a long-poll response body: a JSON array of events. Non-object items are skipped.
    pub fn parse_batch(body: &str) -> Result<Vec<Self>, BridgeError> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| BridgeError::MalformedEvent(e.to_string()))?;
        let serde_json::Value::Array(items) = value else {
            return Err(BridgeError::MalformedEvent(
                "poll response is not an array".to_string(),
            ));
        };
        Ok(items
            .into_iter()
            .filter_map(|item| match Self::from_value(item) {
                Ok(ev) => Some(ev),
                Err(e) => {
                    log::warn!("dropping poll item: {}", e);
                    None
                }
            })
            .collect())
    }

    fn from_value(value: serde_json::Value) -> Result<Self, BridgeError> {
        if !value.is_object() {
            return Err(BridgeError::MalformedEvent(format!(
                "expected object, got {}",
                value
            )));
        }
        serde_json::from_value(value).map_err(|e| BridgeError::MalformedEvent(e.to_string()))
    }

    pub fn is_friend_request(&self) -> bool {
        self.kind.as_deref() == Some(FRIEND_REQUEST_TYPE)
    }
}

/// Canonical inbound message. `timestamp_ms` is always epoch milliseconds after normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub peer_id: String,
    pub text: String,
    pub timestamp_ms: i64,
    pub message_id: String,
}

/// Applies the single timestamp rule and fills in missing message ids.
#[derive(Debug, Clone, Copy)]
pub struct EventNormalizer {
    threshold: i64,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMESTAMP_THRESHOLD)
    }
}

impl EventNormalizer {
    pub fn new(threshold: i64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    pub fn normalize(&self, raw: &RawEvent, now_ms: i64) -> InboundMessage {
        InboundMessage {
            peer_id: raw.peer.clone(),
            text: raw.text.clone(),
            timestamp_ms: normalize_timestamp(raw.ts, now_ms, self.threshold),
            message_id: raw
                .msg_id
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(synthesize_message_id),
        }
    }
}

/// `ts > threshold` is divided by 1000 (floor); anything else passes through.
/// A non-positive or non-finite result becomes `now_ms`.
pub fn normalize_timestamp(ts: f64, now_ms: i64, threshold: i64) -> i64 {
    if !ts.is_finite() {
        return now_ms;
    }
    let scaled = if ts > threshold as f64 {
        (ts / 1000.0).floor()
    } else {
        ts.floor()
    };
    // f64 -> i64 casts saturate.
    let ts = scaled as i64;
    if ts <= 0 {
        now_ms
    } else {
        ts
    }
}

/// Opaque id for events the sidecar sent without `msgId`. Unique per process.
pub fn synthesize_message_id() -> String {
    format!("beagle-{}", uuid::Uuid::new_v4())
}

/// Current wall clock as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(lenient_opt_string(d)?.unwrap_or_default())
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

pub(crate) fn lenient_number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    let value = serde_json::Value::deserialize(d)?;
    Ok(match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}
