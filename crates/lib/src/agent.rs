//! HTTP reply pipeline: hand the context to the agent runtime and deliver what comes back.
//!
//! `POST {runtimeUrl}/dispatch` with `{ctx, cfg}`; the runtime answers
//! `{payloads: [...], queuedFinal}`. Payloads are delivered in order and the first
//! delivery error aborts the rest.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dispatch::{DispatchReceipt, InboundContext, ReplyDeliverer, ReplyPayload, ReplyPipeline};

#[derive(Debug, Serialize)]
struct DispatchRequest<'a> {
    ctx: &'a InboundContext,
    cfg: &'a serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchResponse {
    #[serde(default)]
    payloads: Vec<ReplyPayload>,
    #[serde(default)]
    queued_final: bool,
}

pub struct HttpReplyPipeline {
    client: reqwest::Client,
    runtime_url: String,
    cfg: serde_json::Value,
    request_timeout: Option<Duration>,
}

impl HttpReplyPipeline {
    /// `cfg` is passed through to the runtime untouched.
    pub fn new(runtime_url: impl Into<String>, cfg: serde_json::Value) -> Self {
        Self {
            client: reqwest::Client::new(),
            runtime_url: runtime_url.into().trim_end_matches('/').to_string(),
            cfg,
            request_timeout: None,
        }
    }

    /// Per-request HTTP timeout. Bounds a call that outlives its dispatch budget.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn runtime_url(&self) -> &str {
        &self.runtime_url
    }
}

#[async_trait]
impl ReplyPipeline for HttpReplyPipeline {
    async fn dispatch_reply(&self, ctx: InboundContext, deliver: ReplyDeliverer) -> Result<DispatchReceipt> {
        let url = format!("{}/dispatch", self.runtime_url);
        let mut req = self.client.post(&url).json(&DispatchRequest {
            ctx: &ctx,
            cfg: &self.cfg,
        });
        if let Some(t) = self.request_timeout {
            req = req.timeout(t);
        }
        let res = req
            .send()
            .await
            .with_context(|| format!("POST {}", url))?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("agent runtime returned {}: {}", status, body);
        }
        let text = res.text().await.context("reading runtime response")?;
        let data: DispatchResponse = if text.trim().is_empty() {
            DispatchResponse::default()
        } else {
            serde_json::from_str(&text).context("parsing runtime response")?
        };

        log::debug!(
            "runtime returned {} payload(s) session={} queued_final={}",
            data.payloads.len(),
            ctx.session_key,
            data.queued_final
        );
        for payload in &data.payloads {
            if let Err(e) = deliver.deliver(payload).await {
                deliver.report_error(&payload.kind, &e);
                return Err(e.into());
            }
        }
        Ok(DispatchReceipt {
            queued_final: data.queued_final,
        })
    }
}
