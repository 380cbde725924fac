use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

use super::transport::{MessageTransport, OutboundMessage};

/// Where operator-facing alerts go: exhausted deliveries, sustained upstream
/// failure, route exhaustion and session start/stop.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, message: &str);
}

pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, message: &str) {
        warn!(alert = true, "{}", message);
    }
}

/// Sends alerts to the operator chat, and logs them either way.
pub struct TransportAlertSink {
    transport: Arc<dyn MessageTransport>,
    recipient: String,
    thread_id: Option<i64>,
}

impl TransportAlertSink {
    pub fn new(transport: Arc<dyn MessageTransport>, recipient: impl Into<String>, thread_id: Option<i64>) -> Self {
        Self {
            transport,
            recipient: recipient.into(),
            thread_id,
        }
    }
}

#[async_trait]
impl AlertSink for TransportAlertSink {
    async fn alert(&self, message: &str) {
        warn!(alert = true, "{}", message);
        let outbound = OutboundMessage::new(&self.recipient, message).in_thread(self.thread_id);
        if let Err(e) = self.transport.send(&outbound).await {
            error!(recipient = %self.recipient, "Failed to deliver operator alert: {}", e);
        }
    }
}
