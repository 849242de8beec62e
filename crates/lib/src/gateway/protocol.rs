//! Gateway HTTP request/response bodies.

use serde::{Deserialize, Serialize};

use crate::channels::sidecar::MediaMessage;

/// `POST /send` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendParams {
    #[serde(default)]
    pub account_id: Option<String>,
    pub peer: String,
    pub text: String,
}

/// `POST /sendMedia` body: peer plus a flat [`MediaMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMediaParams {
    #[serde(default)]
    pub account_id: Option<String>,
    pub peer: String,
    #[serde(flatten)]
    pub media: MediaMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub ok: bool,
    pub error: String,
}

/// `GET /` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub runtime: String,
    pub port: u16,
    pub accounts: Vec<AccountStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub account_id: String,
    pub state: String,
}
