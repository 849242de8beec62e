//! Integration test: serve the gateway over a running service on a free port and drive
//! its endpoints with reqwest against a fake sidecar.

mod common;

use bridge::config::{Account, BridgeSettings, TransportMode};
use bridge::gateway;
use bridge::service::BridgeService;
use bridge::session::MemorySessionStore;
use common::{eventually, CapturePipeline, FakeSidecar};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

struct Running {
    url: String,
    sidecar: FakeSidecar,
    stop: oneshot::Sender<()>,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

async fn start_gateway() -> Running {
    let sidecar = FakeSidecar::spawn(false).await;
    let (pipeline, _ctxs) = CapturePipeline::new();
    let settings = BridgeSettings {
        transport: TransportMode::Poll,
        poll_timeout: Duration::from_secs(1),
        request_timeout: Duration::from_secs(2),
        ..BridgeSettings::default()
    };
    let service = Arc::new(BridgeService::new(
        vec![Account::new("default", &sidecar.base_url)],
        settings,
        pipeline,
        Arc::new(MemorySessionStore::new()),
    ));
    service.start().await.expect("start");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let url = format!("http://{}", listener.local_addr().expect("local_addr"));
    let (stop, stopped) = oneshot::channel::<()>();
    let server = tokio::spawn(gateway::serve_gateway(listener, service, async move {
        let _ = stopped.await;
    }));
    Running {
        url,
        sidecar,
        stop,
        server,
    }
}

#[tokio::test]
async fn status_reports_connected_account() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();
    let url = format!("{}/", gw.url);

    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        if let Ok(resp) = client.get(&url).send().await {
            last = resp.json().await.expect("parse JSON");
            if last["accounts"][0]["state"] == "connected" {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(last["runtime"], "running");
    assert_eq!(last["accounts"][0]["accountId"], "default");
    assert_eq!(last["accounts"][0]["state"], "connected", "{}", last);

    let _ = gw.stop.send(());
    gw.server.await.expect("join").expect("gateway exits cleanly");
}

#[tokio::test]
async fn send_endpoints_map_errors() {
    let gw = start_gateway().await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/send", gw.url))
        .json(&json!({ "peer": "p1", "text": "hello" }))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.expect("json");
    assert_eq!(body["ok"], true);
    assert_eq!(body["messageId"], "out-1");
    assert_eq!(body["timestamp"], 1_700_000_000i64);
    eventually(|| gw.sidecar.sent_texts() == vec!["hello".to_string()]).await;

    let resp = client
        .post(format!("{}/sendMedia", gw.url))
        .json(&json!({ "peer": "p1", "mediaUrl": "http://x/a.png", "mediaPath": "/tmp/a.png", "mediaType": "image" }))
        .send()
        .await
        .expect("sendMedia");
    assert_eq!(resp.status(), 400);
    assert!(gw.sidecar.sent().iter().all(|(path, _)| path != "/sendMedia"));

    let resp = client
        .post(format!("{}/sendMedia", gw.url))
        .json(&json!({ "peer": "p1", "mediaUrl": "http://x/a.png", "mediaType": "image", "caption": "look" }))
        .send()
        .await
        .expect("sendMedia");
    assert_eq!(resp.status(), 200);
    let media = gw
        .sidecar
        .sent()
        .into_iter()
        .find(|(path, _)| path == "/sendMedia")
        .expect("media forwarded");
    assert_eq!(media.1["peer"], "p1");
    assert_eq!(media.1["caption"], "look");

    let resp = client
        .post(format!("{}/send", gw.url))
        .json(&json!({ "accountId": "nope", "peer": "p1", "text": "x" }))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 404);

    gw.sidecar.fail_sends.store(true, Ordering::SeqCst);
    let resp = client
        .post(format!("{}/send", gw.url))
        .json(&json!({ "peer": "p1", "text": "x" }))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), 502);

    let _ = gw.stop.send(());
    gw.server.await.expect("join").expect("gateway exits cleanly");
}
