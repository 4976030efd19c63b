//! Telegram Bot API delivery.

use super::DeliverySink;
use crate::error::DeliveryError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, instrument, warn};

const API_BASE: &str = "https://api.telegram.org";

/// Posts messages through `sendMessage` with link previews enabled.
pub struct TelegramSink {
    http: reqwest::Client,
    endpoint: String,
}

impl TelegramSink {
    pub fn new(token: &str) -> Result<Self, DeliveryError> {
        Self::with_base(API_BASE, token)
    }

    /// Point the sink at another Bot API server (self-hosted or a test
    /// double).
    pub fn with_base(base: &str, token: &str) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/bot{}/sendMessage", base.trim_end_matches('/'), token),
        })
    }
}

impl std::fmt::Debug for TelegramSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The endpoint embeds the bot token.
        f.debug_struct("TelegramSink").finish_non_exhaustive()
    }
}

/// Map a non-success Bot API answer to a delivery error.
pub fn classify_response(status: StatusCode, body: &Value) -> DeliveryError {
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description");
    let msg = format!("telegram returned {status}: {description}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryError::Transient(msg)
    } else {
        DeliveryError::Permanent(msg)
    }
}

#[async_trait]
impl DeliverySink for TelegramSink {
    #[instrument(level = "info", skip_all, fields(chat_id = %destination, chars = text.chars().count()))]
    async fn send(&self, destination: &str, text: &str) -> Result<(), DeliveryError> {
        let payload = json!({
            "chat_id": destination,
            "text": text,
            "disable_web_page_preview": false,
        });
        let resp = self.http.post(&self.endpoint).json(&payload).send().await?;

        let status = resp.status();
        if status.is_success() {
            debug!("Message delivered");
            return Ok(());
        }
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        let err = classify_response(status, &body);
        warn!(status = %status, error = %err, "Telegram rejected message");
        Err(err)
    }
}
