//! Notification payloads and the sinks that deliver them

use crate::errors::{NotifierError, Result};
use crate::status::{Presence, StatusLabel};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Where a notification goes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Audience {
    Channel(String),
    User(String),
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Audience::Channel(id) => write!(f, "channel:{}", id),
            Audience::User(id) => write!(f, "user:{}", id),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    Transition {
        from: Option<StatusLabel>,
        to: StatusLabel,
        presence: Presence,
        activity: String,
    },
    NearingExpiry,
    Expired,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    /// Watch-group key or subject id this is about
    pub subject: String,
    pub kind: NotificationKind,
    pub text: String,
    pub color: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(subject: String, kind: NotificationKind, text: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            subject,
            kind,
            text,
            color: None,
            created_at,
        }
    }

    pub fn with_color(mut self, color: u32) -> Self {
        self.color = Some(color);
        self
    }
}

/// Fire-and-forget delivery. Failures are the sink's own business.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, audience: &Audience, notification: &Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, audience: &Audience, notification: &Notification) {
        info!(
            audience = %audience,
            subject = %notification.subject,
            "Notification: {}",
            notification.text
        );
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<(Audience, Notification)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Audience, Notification)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, audience: &Audience, notification: &Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((audience.clone(), notification.clone()));
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    audience: &'a Audience,
    notification: &'a Notification,
}

/// Posts notifications as JSON to a chat gateway.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    webhook_url: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
}

impl WebhookSink {
    pub fn new(
        webhook_url: String,
        http_timeout: Duration,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("state_notifier/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(NotifierError::Http)?;

        Ok(Self {
            client,
            webhook_url,
            timeout: http_timeout,
            max_retries,
            retry_backoff_ms,
        })
    }

    /// Deliver with retries and exponential backoff.
    pub async fn deliver(&self, audience: &Audience, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            audience,
            notification,
        };

        let mut attempt = 0;
        let mut last_error = None;

        while attempt <= self.max_retries {
            match self.deliver_attempt(&payload).await {
                Ok(()) => {
                    debug!(
                        "Delivered notification {} (attempt {})",
                        notification.id,
                        attempt + 1
                    );
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt <= self.max_retries {
                        let backoff_ms = self.backoff_ms(attempt);
                        warn!(
                            "Failed to deliver notification {} (attempt {}), retrying in {}ms: {}",
                            notification.id, attempt, backoff_ms, e
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| NotifierError::Notify("All retry attempts failed".to_string())))
    }

    fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self
            .retry_backoff_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if base >= 4 {
            rand::rng().random_range(0..=base / 4)
        } else {
            0
        };
        base.saturating_add(jitter)
    }

    async fn deliver_attempt(&self, payload: &WebhookPayload<'_>) -> Result<()> {
        let response = timeout(
            self.timeout,
            self.client.post(&self.webhook_url).json(payload).send(),
        )
        .await
        .map_err(|_| NotifierError::Notify("Request timeout".to_string()))?
        .map_err(NotifierError::Http)?;

        handle_response(response).await
    }
}

async fn handle_response(response: Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    let message = match status.as_u16() {
        400 => format!("Bad request: {}", body),
        401 | 403 => format!("Not authorized to post: {}", body),
        404 => format!("Webhook not found: {}", body),
        429 => format!("Rate limited: {}", body),
        500..=599 => format!("Gateway server error {}: {}", status, body),
        _ => format!("Unexpected response {}: {}", status, body),
    };
    Err(NotifierError::Notify(message))
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, audience: &Audience, notification: &Notification) {
        if let Err(e) = self.deliver(audience, notification).await {
            error!(
                "Dropping notification {} for {}: {}",
                notification.id, audience, e
            );
        }
    }
}
