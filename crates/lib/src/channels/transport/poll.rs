//! Long-poll transport: repeated `GET /events?timeout=N`.

use async_trait::async_trait;

use super::{Connection, Connector};
use crate::channels::inbound::RawEvent;
use crate::channels::sidecar::SidecarClient;
use crate::error::Result;

pub struct PollConnector {
    client: SidecarClient,
}

impl PollConnector {
    pub fn new(client: SidecarClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for PollConnector {
    fn name(&self) -> &'static str {
        "poll"
    }

    /// The first successful poll counts as the connection; its events are kept for the session.
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let first = self.client.poll_events().await?;
        Ok(Box::new(PollSession {
            client: self.client.clone(),
            pending: Some(first),
        }))
    }

    fn interruptible(&self) -> bool {
        false
    }
}

struct PollSession {
    client: SidecarClient,
    pending: Option<Vec<RawEvent>>,
}

#[async_trait]
impl Connection for PollSession {
    async fn next_batch(&mut self) -> Result<Option<Vec<RawEvent>>> {
        if let Some(batch) = self.pending.take() {
            return Ok(Some(batch));
        }
        self.client.poll_events().await.map(Some)
    }
}
