//! Streamed transport: one WebSocket to `<base>/events`, one JSON event per text frame.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{Connection, Connector};
use crate::channels::inbound::RawEvent;
use crate::channels::sidecar::SidecarClient;
use crate::error::{BridgeError, Result};

pub struct StreamConnector {
    client: SidecarClient,
}

impl StreamConnector {
    pub fn new(client: SidecarClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for StreamConnector {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let url = self.client.events_ws_url();
        let mut request = url.as_str().into_client_request()?;
        if let Some(bearer) = self.client.bearer() {
            let value = HeaderValue::from_str(&bearer)
                .map_err(|e| BridgeError::transport("websocket auth header", e))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        let timeout = self.client.request_timeout();
        let (ws, _) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                BridgeError::transport_msg(
                    format!("websocket connect {}", url),
                    format!("timed out after {}ms", timeout.as_millis()),
                )
            })??;
        log::debug!("websocket open {}", url);
        Ok(Box::new(StreamSession { ws }))
    }
}

struct StreamSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

fn parse_frame(text: &str) -> Option<RawEvent> {
    match RawEvent::parse(text) {
        Ok(ev) => Some(ev),
        Err(e) => {
            log::warn!("dropping sidecar frame: {}", e);
            None
        }
    }
}

#[async_trait]
impl Connection for StreamSession {
    async fn next_batch(&mut self) -> Result<Option<Vec<RawEvent>>> {
        loop {
            match self.ws.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(Message::Text(text))) => {
                    if let Some(ev) = parse_frame(&text) {
                        return Ok(Some(vec![ev]));
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if let Some(ev) = parse_frame(&String::from_utf8_lossy(&bytes)) {
                        return Ok(Some(vec![ev]));
                    }
                }
                // Pongs are queued by tungstenite and flushed on the next read.
                Some(Ok(_)) => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("websocket close: {}", e);
        }
    }
}
