use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ControlChannel, Requester};
use crate::notifications::telegram::{IncomingMessage, TelegramClient};
use crate::notifications::{MessageTransport, OutboundMessage, TransportError};

const ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Feeds bot commands from `getUpdates` into the control channel and posts
/// each reply back to the chat, in the same forum topic.
pub struct TelegramCommandSource {
    client: Arc<TelegramClient>,
    control: Arc<ControlChannel>,
    allowed_chats: HashSet<String>,
    poll_timeout_secs: u64,
}

impl TelegramCommandSource {
    pub fn new(
        client: Arc<TelegramClient>,
        control: Arc<ControlChannel>,
        allowed_chats: &[String],
        poll_timeout_secs: u64,
    ) -> Self {
        Self {
            client,
            control,
            allowed_chats: allowed_chats.iter().cloned().collect(),
            poll_timeout_secs,
        }
    }

    fn is_allowed(&self, chat_id: &str) -> bool {
        self.allowed_chats.is_empty() || self.allowed_chats.contains(chat_id)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Listening for bot commands");
        let mut offset: Option<i64> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let updates = tokio::select! {
                _ = shutdown.changed() => break,
                updates = self.client.get_updates(offset, self.poll_timeout_secs) => updates,
            };

            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        if let Some(message) = update.message {
                            self.handle_message(message).await;
                        }
                    }
                }
                Err(e) => {
                    let pause = match &e {
                        TransportError::RateLimited { retry_after: Some(wait) } => *wait,
                        _ => ERROR_PAUSE,
                    };
                    warn!("Polling bot updates failed: {}", e);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
        info!("Stopped listening for bot commands");
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn handle_message(&self, message: IncomingMessage) {
        let Some(text) = message.text.as_deref() else {
            return;
        };
        if !text.trim_start().starts_with('/') {
            return;
        }

        let chat_id = message.chat.id.to_string();
        if !self.is_allowed(&chat_id) {
            debug!(chat_id = %chat_id, "Ignoring command from chat that is not allowed");
            return;
        }

        let name = message
            .from
            .as_ref()
            .and_then(|u| u.username.clone().or_else(|| u.first_name.clone()));
        let requester = Requester::new(chat_id.clone(), name);
        let reply = self.control.handle(&requester, text).await;

        let outbound = OutboundMessage::new(chat_id, reply.text).in_thread(message.message_thread_id);
        if let Err(e) = self.client.send(&outbound).await {
            warn!(chat_id = %outbound.recipient, "Failed to send command reply: {}", e);
        }
    }
}
