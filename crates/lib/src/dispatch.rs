//! Dispatch of normalized inbound messages to the reply pipeline.
//!
//! [`DispatchCoordinator::dispatch`] builds the context payload, records the session,
//! and runs the pipeline in its own task raced against the dispatch timeout. The task
//! is detached on timeout, never aborted. Nothing escapes as an error: every failure
//! becomes a [`DispatchOutcome`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channels::inbound::InboundMessage;
use crate::channels::sidecar::{MediaMessage, OutboundSender};
use crate::error::{BridgeError, Result};
use crate::routing::{RouteContext, CHANNEL_ID};
use crate::session::SessionTracker;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { queued_final: bool },
    TimedOut,
    Failed(String),
}

impl DispatchOutcome {
    /// The taxonomy error for a non-delivered outcome.
    pub fn error(&self, timeout: Duration) -> Option<BridgeError> {
        match self {
            Self::Delivered { .. } => None,
            Self::TimedOut => Some(BridgeError::DispatchTimeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Self::Failed(reason) => Some(BridgeError::DispatchFailure(reason.clone())),
        }
    }
}

/// Context payload handed to the reply pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InboundContext {
    pub body: String,
    pub body_for_agent: String,
    pub raw_body: String,
    pub command_body: String,
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub account_id: String,
    pub agent_id: String,
    pub chat_type: String,
    pub conversation_label: String,
    pub sender_id: String,
    pub provider: String,
    pub surface: String,
    pub message_sid: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_timestamp: Option<i64>,
    pub originating_channel: String,
    pub originating_to: String,
}

impl InboundContext {
    pub fn build(message: &InboundMessage, route: &RouteContext, previous_timestamp: Option<i64>) -> Self {
        let address = format!("{}:{}", CHANNEL_ID, message.peer_id);
        Self {
            body: message.text.clone(),
            body_for_agent: message.text.clone(),
            raw_body: message.text.clone(),
            command_body: message.text.clone(),
            from: address.clone(),
            to: address.clone(),
            session_key: route.session_key.clone(),
            account_id: route.account_id.clone(),
            agent_id: route.agent_id.clone(),
            chat_type: "direct".to_string(),
            conversation_label: message.peer_id.clone(),
            sender_id: message.peer_id.clone(),
            provider: CHANNEL_ID.to_string(),
            surface: CHANNEL_ID.to_string(),
            message_sid: message.message_id.clone(),
            timestamp: message.timestamp_ms,
            previous_timestamp,
            originating_channel: CHANNEL_ID.to_string(),
            originating_to: address,
        }
    }
}

/// One outbound payload produced by the reply pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPayload {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

fn default_kind() -> String {
    "final".to_string()
}

impl Default for ReplyPayload {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            text: None,
            media_url: None,
            media_urls: Vec::new(),
        }
    }
}

impl ReplyPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// `mediaUrl`, else the first of `mediaUrls`.
    pub fn media(&self) -> Option<&str> {
        self.media_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.media_urls.iter().map(String::as_str).find(|u| !u.trim().is_empty()))
    }
}

/// Delivery sink bound to one peer. Media wins over text; an empty payload is a no-op.
#[derive(Clone)]
pub struct ReplyDeliverer {
    sender: Arc<dyn OutboundSender>,
    account_id: String,
    peer_id: String,
}

impl ReplyDeliverer {
    pub fn new(sender: Arc<dyn OutboundSender>, account_id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            sender,
            account_id: account_id.into(),
            peer_id: peer_id.into(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Errors propagate to the pipeline.
    pub async fn deliver(&self, payload: &ReplyPayload) -> Result<()> {
        let text = payload.text.as_deref().unwrap_or("");
        log::info!(
            "deliver kind={} account={} peer={} text_len={}",
            payload.kind,
            self.account_id,
            self.peer_id,
            text.len()
        );
        if let Some(url) = payload.media() {
            let media = MediaMessage::from_url(url).with_caption(text);
            return self.sender.send_media(&self.peer_id, &media).await;
        }
        if !text.is_empty() {
            self.sender.send_text(&self.peer_id, text).await?;
        }
        Ok(())
    }

    /// Pipeline-side error hook; logs only.
    pub fn report_error(&self, kind: &str, err: &dyn std::fmt::Display) {
        log::warn!(
            "reply failed ({}) account={} peer={}: {}",
            kind,
            self.account_id,
            self.peer_id,
            err
        );
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub queued_final: bool,
}

/// Downstream reply pipeline: produce zero or more payloads through `deliver`.
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    async fn dispatch_reply(
        &self,
        ctx: InboundContext,
        deliver: ReplyDeliverer,
    ) -> anyhow::Result<DispatchReceipt>;
}

pub struct DispatchCoordinator {
    pipeline: Arc<dyn ReplyPipeline>,
    tracker: Arc<SessionTracker>,
    timeout: Duration,
}

impl DispatchCoordinator {
    pub fn new(pipeline: Arc<dyn ReplyPipeline>, tracker: Arc<SessionTracker>, timeout: Duration) -> Self {
        Self {
            pipeline,
            tracker,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn dispatch(
        &self,
        message: &InboundMessage,
        route: &RouteContext,
        sender: Arc<dyn OutboundSender>,
    ) -> DispatchOutcome {
        let started = Instant::now();
        let previous = self
            .tracker
            .read_session_updated_at(&route.agent_id, &route.session_key)
            .await;
        let ctx = InboundContext::build(message, route, previous);

        {
            let tracker = self.tracker.clone();
            let ctx = ctx.clone();
            let agent_id = route.agent_id.clone();
            let session_key = route.session_key.clone();
            tokio::spawn(async move {
                tracker
                    .record_inbound_session(&agent_id, &session_key, &ctx)
                    .await;
            });
        }

        let deliverer = ReplyDeliverer::new(sender, &route.account_id, &message.peer_id);
        let pipeline = self.pipeline.clone();
        let mut task = tokio::spawn(async move { pipeline.dispatch_reply(ctx, deliverer).await });

        let outcome = match tokio::time::timeout(self.timeout, &mut task).await {
            // `task` is dropped below without abort; the pipeline keeps running detached.
            Err(_) => DispatchOutcome::TimedOut,
            Ok(Ok(Ok(receipt))) => DispatchOutcome::Delivered {
                queued_final: receipt.queued_final,
            },
            Ok(Ok(Err(e))) => DispatchOutcome::Failed(format!("{:#}", e)),
            Ok(Err(join)) => DispatchOutcome::Failed(if join.is_panic() {
                "reply pipeline panicked".to_string()
            } else {
                join.to_string()
            }),
        };

        let duration_ms = started.elapsed().as_millis();
        match outcome.error(self.timeout) {
            None => log::info!(
                "dispatched account={} peer={} session={} duration_ms={} outcome={:?}",
                route.account_id,
                message.peer_id,
                route.session_key,
                duration_ms,
                outcome
            ),
            Some(e) => log::warn!(
                "{} account={} peer={} session={} duration_ms={}",
                e,
                route.account_id,
                message.peer_id,
                route.session_key,
                duration_ms
            ),
        }
        outcome
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channels::sidecar::SentMessage;
    use crate::session::MemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Sent {
        Text(String, String),
        Media(String, MediaMessage),
    }

    #[derive(Default)]
    pub(crate) struct RecordingSender {
        pub sent: Mutex<Vec<Sent>>,
    }

    impl RecordingSender {
        pub fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutboundSender for RecordingSender {
        async fn send_text(&self, peer_id: &str, text: &str) -> Result<SentMessage> {
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Text(peer_id.into(), text.into()));
            Ok(SentMessage {
                message_id: "out-1".into(),
                timestamp_ms: 1,
            })
        }

        async fn send_media(&self, peer_id: &str, media: &MediaMessage) -> Result<()> {
            media.validate()?;
            self.sent
                .lock()
                .unwrap()
                .push(Sent::Media(peer_id.into(), media.clone()));
            Ok(())
        }
    }

    /// Echoes the body back as text.
    pub(crate) struct EchoPipeline;

    #[async_trait]
    impl ReplyPipeline for EchoPipeline {
        async fn dispatch_reply(&self, ctx: InboundContext, deliver: ReplyDeliverer) -> anyhow::Result<DispatchReceipt> {
            deliver.deliver(&ReplyPayload::text(format!("echo: {}", ctx.body))).await?;
            Ok(DispatchReceipt { queued_final: true })
        }
    }

    /// Fails (error, then panic) for the first two calls, then echoes.
    pub(crate) struct FlakyPipeline {
        calls: AtomicUsize,
    }

    impl FlakyPipeline {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ReplyPipeline for FlakyPipeline {
        async fn dispatch_reply(&self, ctx: InboundContext, deliver: ReplyDeliverer) -> anyhow::Result<DispatchReceipt> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => anyhow::bail!("runtime exploded"),
                1 => panic!("runtime panicked"),
                _ => EchoPipeline.dispatch_reply(ctx, deliver).await,
            }
        }
    }

    struct HangingPipeline;

    #[async_trait]
    impl ReplyPipeline for HangingPipeline {
        async fn dispatch_reply(&self, _: InboundContext, _: ReplyDeliverer) -> anyhow::Result<DispatchReceipt> {
            std::future::pending::<()>().await;
            Ok(DispatchReceipt::default())
        }
    }

    fn message(text: &str) -> InboundMessage {
        InboundMessage {
            peer_id: "p1".into(),
            text: text.into(),
            timestamp_ms: 1_700_000_000_000,
            message_id: "m-1".into(),
        }
    }

    fn route() -> RouteContext {
        RouteContext {
            agent_id: "main".into(),
            session_key: "beagle:default:p1".into(),
            account_id: "default".into(),
        }
    }

    fn coordinator(pipeline: Arc<dyn ReplyPipeline>, timeout: Duration) -> DispatchCoordinator {
        let tracker = Arc::new(SessionTracker::new(Arc::new(MemorySessionStore::new())));
        DispatchCoordinator::new(pipeline, tracker, timeout)
    }

    #[test]
    fn context_payload_fields() {
        let ctx = InboundContext::build(&message("hi"), &route(), Some(5));
        let v = serde_json::to_value(&ctx).unwrap();
        assert_eq!(v["Body"], "hi");
        assert_eq!(v["BodyForAgent"], "hi");
        assert_eq!(v["From"], "beagle:p1");
        assert_eq!(v["SessionKey"], "beagle:default:p1");
        assert_eq!(v["ChatType"], "direct");
        assert_eq!(v["Provider"], "beagle");
        assert_eq!(v["MessageSid"], "m-1");
        assert_eq!(v["Timestamp"], 1_700_000_000_000i64);
        assert_eq!(v["PreviousTimestamp"], 5);
        assert_eq!(v["OriginatingTo"], "beagle:p1");
    }

    #[test]
    fn default_payload_is_final() {
        assert_eq!(ReplyPayload::default().kind, "final");
        let media = ReplyPayload {
            media_url: Some("http://x/a.png".into()),
            ..ReplyPayload::default()
        };
        assert_eq!(media.kind, "final");
        let parsed: ReplyPayload = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, ReplyPayload::default());
    }

    #[tokio::test]
    async fn deliver_prefers_media_with_caption() {
        let sender = Arc::new(RecordingSender::default());
        let d = ReplyDeliverer::new(sender.clone(), "default", "p1");
        d.deliver(&ReplyPayload {
            text: Some("look".into()),
            media_urls: vec!["http://x/a.png".into(), "http://x/b.png".into()],
            ..ReplyPayload::default()
        })
        .await
        .unwrap();
        d.deliver(&ReplyPayload::text("plain")).await.unwrap();
        d.deliver(&ReplyPayload::default()).await.unwrap();

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            Sent::Media(peer, m) => {
                assert_eq!(peer, "p1");
                assert_eq!(m.media_url.as_deref(), Some("http://x/a.png"));
                assert_eq!(m.caption.as_deref(), Some("look"));
            }
            other => panic!("expected media, got {:?}", other),
        }
        assert_eq!(sent[1], Sent::Text("p1".into(), "plain".into()));
    }

    #[tokio::test]
    async fn failures_become_outcomes_and_next_event_still_dispatches() {
        let c = coordinator(
            Arc::new(FlakyPipeline::new()),
            Duration::from_secs(5),
        );
        let sender = Arc::new(RecordingSender::default());

        let first = c.dispatch(&message("one"), &route(), sender.clone()).await;
        assert!(matches!(first, DispatchOutcome::Failed(ref r) if r.contains("runtime exploded")));
        let second = c.dispatch(&message("two"), &route(), sender.clone()).await;
        assert_eq!(second, DispatchOutcome::Failed("reply pipeline panicked".into()));
        let third = c.dispatch(&message("three"), &route(), sender.clone()).await;
        assert_eq!(third, DispatchOutcome::Delivered { queued_final: true });
        assert_eq!(sender.sent(), vec![Sent::Text("p1".into(), "echo: three".into())]);
    }

    #[tokio::test]
    async fn hanging_pipeline_times_out_on_budget() {
        let c = coordinator(Arc::new(HangingPipeline), Duration::from_millis(50));
        let started = Instant::now();
        let outcome = c
            .dispatch(&message("hi"), &route(), Arc::new(RecordingSender::default()))
            .await;
        let elapsed = started.elapsed();
        assert_eq!(outcome, DispatchOutcome::TimedOut);
        assert!(elapsed >= Duration::from_millis(50), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(100), "{:?}", elapsed);
        assert_eq!(
            outcome.error(c.timeout()).unwrap().kind(),
            crate::error::ErrorKind::DispatchTimeout
        );
    }

    #[tokio::test]
    async fn delivery_error_propagates_to_failed() {
        struct BadMedia;

        #[async_trait]
        impl ReplyPipeline for BadMedia {
            async fn dispatch_reply(&self, _: InboundContext, deliver: ReplyDeliverer) -> anyhow::Result<DispatchReceipt> {
                let payload = ReplyPayload {
                    media_url: Some("http://x/a.png".into()),
                    ..ReplyPayload::default()
                };
                deliver.deliver(&payload).await?;
                Ok(DispatchReceipt { queued_final: true })
            }
        }

        struct FailingSender;

        #[async_trait]
        impl OutboundSender for FailingSender {
            async fn send_text(&self, _: &str, _: &str) -> Result<SentMessage> {
                Err(BridgeError::transport_msg("send", "connection refused"))
            }

            async fn send_media(&self, _: &str, _: &MediaMessage) -> Result<()> {
                Err(BridgeError::transport_msg("sendMedia", "connection refused"))
            }
        }

        let c = coordinator(Arc::new(BadMedia), Duration::from_secs(5));
        let outcome = c.dispatch(&message("hi"), &route(), Arc::new(FailingSender)).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(ref r) if r.contains("connection refused")));
    }
}
