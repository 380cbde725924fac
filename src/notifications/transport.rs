use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub recipient: String,
    /// HTML-formatted body.
    pub text: String,
    pub thread_id: Option<i64>,
}

impl OutboundMessage {
    pub fn new(recipient: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            text: text.into(),
            thread_id: None,
        }
    }

    pub fn in_thread(mut self, thread_id: Option<i64>) -> Self {
        self.thread_id = thread_id;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("rate limited by messaging service (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("messaging service error {status}: {body}")]
    Server { status: u16, body: String },

    #[error("message rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    /// Rejections (bad chat id, blocked bot, malformed HTML) never succeed on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, TransportError>;
}

/// Writes messages to the log instead of a chat. Used when no bot token is set.
pub struct ConsoleTransport;

impl ConsoleTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageTransport for ConsoleTransport {
    async fn send(&self, message: &OutboundMessage) -> Result<SentMessage, TransportError> {
        info!(
            recipient = %message.recipient,
            thread_id = ?message.thread_id,
            "NOTIFY: {}",
            message.text
        );
        Ok(SentMessage::default())
    }
}
