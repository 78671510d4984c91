//! Fetching external state for watch-groups

use crate::clock::Clock;
use crate::errors::{NotifierError, Result};
use crate::snapshot::{ExternalSnapshot, ServerStatusPayload};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Produces a snapshot for a watch-group key.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<ExternalSnapshot>;
}

/// Polls a game-server status endpoint at `{base_url}/{key}`.
#[derive(Clone)]
pub struct HttpStatusFetcher {
    client: Client,
    base_url: String,
    timeout: Duration,
    discount_host_player: bool,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HttpStatusFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStatusFetcher")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("discount_host_player", &self.discount_host_player)
            .finish()
    }
}

impl HttpStatusFetcher {
    pub fn new(
        base_url: String,
        http_timeout: Duration,
        discount_host_player: bool,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("state_notifier/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(NotifierError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: http_timeout,
            discount_host_player,
            clock,
        })
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }
}

#[async_trait]
impl Fetcher for HttpStatusFetcher {
    async fn fetch(&self, key: &str) -> Result<ExternalSnapshot> {
        let url = self.url_for(key);
        debug!("Fetching status for {} from {}", key, url);

        let response = timeout(self.timeout, self.client.get(&url).send())
            .await
            .map_err(|_| NotifierError::fetch(key, "request timeout"))?
            .map_err(|e| NotifierError::fetch(key, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifierError::fetch(
                key,
                format!("unexpected response status {}", status.as_u16()),
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| NotifierError::fetch(key, e.to_string()))?;
        let payload: ServerStatusPayload = serde_json::from_str(&body)
            .map_err(|e| NotifierError::fetch(key, format!("malformed status document: {}", e)))?;

        ExternalSnapshot::from_server_status(
            key,
            payload,
            self.clock.now(),
            self.discount_host_player,
        )
    }
}
