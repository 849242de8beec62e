//! Shared fixtures: an in-process fake sidecar and a capturing reply pipeline.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bridge::dispatch::{DispatchReceipt, InboundContext, ReplyDeliverer, ReplyPayload, ReplyPipeline};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

#[derive(Clone)]
pub struct FakeSidecar {
    pub base_url: String,
    pub queued: Arc<Mutex<VecDeque<Value>>>,
    /// (path, body) of every /send and /sendMedia call.
    pub sent: Arc<Mutex<Vec<(String, Value)>>>,
    pub auth: Arc<Mutex<Vec<Option<String>>>>,
    pub healthy: Arc<AtomicBool>,
    pub fail_sends: Arc<AtomicBool>,
    pub fail_polls: Arc<AtomicUsize>,
    pub poll_calls: Arc<AtomicUsize>,
    /// Every /send and /sendMedia request, including failed ones.
    pub send_calls: Arc<AtomicUsize>,
    pub ws_connections: Arc<AtomicUsize>,
    frames: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

impl FakeSidecar {
    /// Bind on a free port with `/events` served as long-poll (`ws == false`) or WebSocket.
    pub async fn spawn(ws: bool) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake sidecar");
        let addr = listener.local_addr().expect("local_addr");
        let (frames, _) = broadcast::channel(64);
        let (kick, _) = broadcast::channel(4);
        let sidecar = Self {
            base_url: format!("http://{}", addr),
            queued: Default::default(),
            sent: Default::default(),
            auth: Default::default(),
            healthy: Arc::new(AtomicBool::new(true)),
            fail_sends: Default::default(),
            fail_polls: Default::default(),
            poll_calls: Default::default(),
            send_calls: Default::default(),
            ws_connections: Default::default(),
            frames,
            kick,
        };
        let events = if ws { get(events_ws) } else { get(events_poll) };
        let app = Router::new()
            .route("/health", get(health))
            .route("/send", post(send))
            .route("/sendMedia", post(send_media))
            .route("/events", events)
            .with_state(sidecar.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        sidecar
    }

    /// Queue for the next poll, or broadcast to connected WebSockets.
    pub fn push(&self, event: Value) {
        self.queued.lock().unwrap().push_back(event.clone());
        let _ = self.frames.send(event.to_string());
    }

    /// Close every open WebSocket from the server side.
    pub fn kick(&self) {
        let _ = self.kick.send(());
    }

    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(path, _)| path == "/send")
            .map(|(_, body)| body["text"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn record_auth(&self, headers: &HeaderMap) {
        let value = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        self.auth.lock().unwrap().push(value);
    }
}

async fn health(State(s): State<FakeSidecar>, headers: HeaderMap) -> StatusCode {
    s.record_auth(&headers);
    if s.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn send(State(s): State<FakeSidecar>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    s.record_auth(&headers);
    s.send_calls.fetch_add(1, Ordering::SeqCst);
    if s.fail_sends.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "sidecar down").into_response();
    }
    let n = {
        let mut sent = s.sent.lock().unwrap();
        sent.push(("/send".to_string(), body));
        sent.len()
    };
    Json(json!({ "messageId": format!("out-{}", n), "timestamp": 1_700_000_000, "success": true }))
        .into_response()
}

async fn send_media(State(s): State<FakeSidecar>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    s.record_auth(&headers);
    s.send_calls.fetch_add(1, Ordering::SeqCst);
    if s.fail_sends.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "sidecar down").into_response();
    }
    s.sent.lock().unwrap().push(("/sendMedia".to_string(), body));
    Json(json!({ "success": true })).into_response()
}

async fn events_poll(State(s): State<FakeSidecar>, headers: HeaderMap) -> Response {
    s.record_auth(&headers);
    s.poll_calls.fetch_add(1, Ordering::SeqCst);
    let failing = s
        .fail_polls
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return (StatusCode::INTERNAL_SERVER_ERROR, "not ready").into_response();
    }
    let batch: Vec<Value> = s.queued.lock().unwrap().drain(..).collect();
    if batch.is_empty() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Json(Value::Array(batch)).into_response()
}

async fn events_ws(State(s): State<FakeSidecar>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    s.record_auth(&headers);
    ws.on_upgrade(move |socket| ws_session(socket, s))
}

async fn ws_session(mut socket: WebSocket, s: FakeSidecar) {
    let mut frames = s.frames.subscribe();
    let mut kick = s.kick.subscribe();
    s.ws_connections.fetch_add(1, Ordering::SeqCst);
    loop {
        tokio::select! {
            frame = frames.recv() => match frame {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Agent runtime stand-in: answers `POST /dispatch` with a fixed reply and records requests.
#[derive(Clone)]
pub struct FakeRuntime {
    pub base_url: String,
    /// Body of every /dispatch request.
    pub requests: Arc<Mutex<Vec<Value>>>,
    pub reply: Arc<Mutex<(StatusCode, Value)>>,
    /// Accept the request and never answer.
    pub hang: Arc<AtomicBool>,
}

impl FakeRuntime {
    pub async fn spawn(reply: Value) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake runtime");
        let addr = listener.local_addr().expect("local_addr");
        let runtime = Self {
            base_url: format!("http://{}", addr),
            requests: Default::default(),
            reply: Arc::new(Mutex::new((StatusCode::OK, reply))),
            hang: Default::default(),
        };
        let app = Router::new()
            .route("/dispatch", post(runtime_dispatch))
            .with_state(runtime.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        runtime
    }

    pub fn respond_with(&self, status: StatusCode, body: Value) {
        *self.reply.lock().unwrap() = (status, body);
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }
}

async fn runtime_dispatch(State(r): State<FakeRuntime>, Json(body): Json<Value>) -> Response {
    r.requests.lock().unwrap().push(body);
    if r.hang.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }
    let (status, reply) = r.reply.lock().unwrap().clone();
    (status, Json(reply)).into_response()
}

/// Echoes each body as text and reports the context on a channel.
pub struct CapturePipeline {
    tx: mpsc::UnboundedSender<InboundContext>,
}

impl CapturePipeline {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<InboundContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl ReplyPipeline for CapturePipeline {
    async fn dispatch_reply(&self, ctx: InboundContext, deliver: ReplyDeliverer) -> anyhow::Result<DispatchReceipt> {
        deliver
            .deliver(&ReplyPayload::text(format!("echo: {}", ctx.body)))
            .await?;
        let _ = self.tx.send(ctx);
        Ok(DispatchReceipt { queued_final: true })
    }
}

/// Receive with a deadline so a broken pipeline fails the test instead of hanging it.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for dispatch")
        .expect("channel closed")
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 5s");
}
