//! Minimal Telegram Bot API client: `sendMessage` and long-polled `getUpdates`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::transport::{MessageTransport, OutboundMessage, SentMessage, TransportError};
use crate::utils::error::{AppError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<u16>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct MessageResult {
    message_id: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<IncomingMessage>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IncomingMessage {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub message_thread_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub first_name: Option<String>,
}

pub struct TelegramClient {
    client: Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(AppError::Validation("Telegram bot token is empty".into()));
        }
        let client = Client::builder()
            .user_agent(concat!("shelf-scout/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> std::result::Result<T, TransportError> {
        let response = self
            .client
            .post(format!("{}/{}", self.base_url, method))
            .json(payload)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.without_url().to_string()))?;
        let parsed: Option<ApiResponse<T>> = serde_json::from_str(&body).ok();

        let retry_after = parsed
            .as_ref()
            .and_then(|r| r.parameters.as_ref())
            .and_then(|p| p.retry_after)
            .map(Duration::from_secs);
        let error_code = parsed.as_ref().and_then(|r| r.error_code);

        if status == StatusCode::TOO_MANY_REQUESTS || error_code == Some(429) {
            return Err(TransportError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(TransportError::Server {
                status: status.as_u16(),
                body,
            });
        }

        match parsed {
            Some(ApiResponse {
                ok: true,
                result: Some(result),
                ..
            }) => Ok(result),
            Some(ApiResponse { description, .. }) => Err(TransportError::Rejected(
                description.unwrap_or_else(|| format!("{} failed with status {}", method, status)),
            )),
            None => Err(TransportError::Server {
                status: status.as_u16(),
                body,
            }),
        }
    }

    /// Long-polls for new updates. `offset` is the last seen `update_id + 1`.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_secs: u64,
    ) -> std::result::Result<Vec<Update>, TransportError> {
        let mut payload = json!({
            "timeout": timeout_secs,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }
        let wait = Duration::from_secs(timeout_secs) + REQUEST_TIMEOUT;
        self.call("getUpdates", &payload, wait).await
    }
}

#[async_trait]
impl MessageTransport for TelegramClient {
    async fn send(&self, message: &OutboundMessage) -> std::result::Result<SentMessage, TransportError> {
        let mut payload = json!({
            "chat_id": message.recipient,
            "text": message.text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(thread_id) = message.thread_id {
            payload["message_thread_id"] = json!(thread_id);
        }

        let result: MessageResult = self.call("sendMessage", &payload, REQUEST_TIMEOUT).await?;
        debug!(recipient = %message.recipient, message_id = result.message_id, "Message sent");
        Ok(SentMessage {
            message_id: Some(result.message_id.to_string()),
        })
    }
}
