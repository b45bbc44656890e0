use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;

use crate::telegram::types::{ApiEnvelope, ChatId, Update};

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("telegram API error: {0}")]
    Api(String),
}

/// Thin client over the Telegram Bot HTTP API.
pub struct TelegramClient {
    http: Client,
    base: String,
}

impl TelegramClient {
    pub fn new(http: Client, bot_token: &str) -> Self {
        Self {
            http,
            base: format!("{DEFAULT_API_BASE}/bot{bot_token}"),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>, bot_token: &str) -> Self {
        self.base = format!("{}/bot{bot_token}", api_base.into());
        self
    }

    /// Delivers one plain-text message to a chat.
    pub async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<(), TelegramError> {
        let _: serde_json::Value = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                }),
            )
            .await?;
        Ok(())
    }

    /// Long-polls for incoming updates. `timeout_secs` is the server-side
    /// hold; the request returns earlier when updates arrive.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> Result<Vec<Update>, TelegramError> {
        let mut body = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = json!(offset);
        }

        self.call("getUpdates", body).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, TelegramError> {
        let url = format!("{}/{method}", self.base);
        let response = self.http.post(&url).json(&body).send().await?;
        let raw = response.text().await?;
        let envelope: ApiEnvelope<T> = serde_json::from_str(&raw).map_err(TelegramError::Decode)?;

        if !envelope.ok {
            return Err(TelegramError::Api(
                envelope
                    .description
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }

        envelope
            .result
            .ok_or_else(|| TelegramError::Api("missing result in ok response".to_string()))
    }
}
