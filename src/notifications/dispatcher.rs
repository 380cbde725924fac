use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, info, warn};

use super::alerts::AlertSink;
use super::subscribers::SubscriberRegistry;
use super::transport::{MessageTransport, OutboundMessage, SentMessage, TransportError};
use crate::config::NotificationsConfig;
use crate::models::{AvailabilityState, DeliveryRecord, StateChangeEvent, Subscriber};
use crate::store::StateStore;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Total attempts per subscriber, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retention: chrono::Duration,
}

impl From<&NotificationsConfig> for DispatchSettings {
    fn from(config: &NotificationsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: config.max_delay(),
            retention: config.retention(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryOutcome {
    Delivered,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct NotificationDispatcher {
    transport: Arc<dyn MessageTransport>,
    subscribers: Arc<SubscriberRegistry>,
    store: Arc<dyn StateStore>,
    alerts: Arc<dyn AlertSink>,
    settings: DispatchSettings,
}

impl NotificationDispatcher {
    pub fn new(
        transport: Arc<dyn MessageTransport>,
        subscribers: Arc<SubscriberRegistry>,
        store: Arc<dyn StateStore>,
        alerts: Arc<dyn AlertSink>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            transport,
            subscribers,
            store,
            alerts,
            settings,
        }
    }

    /// Handles events one at a time until every sender is gone.
    pub async fn run(&self, mut events: mpsc::Receiver<StateChangeEvent>) {
        info!("Notification dispatcher started");
        while let Some(event) = events.recv().await {
            self.handle(&event).await;
        }
        info!("Notification dispatcher stopped");
    }

    pub fn spawn(self: Arc<Self>, events: mpsc::Receiver<StateChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(events).await })
    }

    pub async fn handle(&self, event: &StateChangeEvent) -> DispatchReport {
        let now = Utc::now();
        match self.store.prune_deliveries(now - self.settings.retention).await {
            Ok(0) => {}
            Ok(pruned) => debug!("Pruned {} old delivery record(s)", pruned),
            Err(e) => warn!("Failed to prune delivery records: {}", e),
        }

        let subscribers = self.subscribers.interested_in(&event.target).await;
        let text = format_event(event);

        let outcomes = join_all(
            subscribers
                .iter()
                .map(|subscriber| self.deliver(subscriber, event, &text)),
        )
        .await;

        let mut report = DispatchReport::default();
        for outcome in outcomes {
            match outcome {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::Skipped => report.skipped += 1,
                DeliveryOutcome::Failed => report.failed += 1,
            }
        }

        if let Err(e) = self.store.complete_event(event.id).await {
            error!(event_id = %event.id, "Failed to mark event complete: {}", e);
        }

        info!(
            target_id = %event.target,
            event_id = %event.id,
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "Event dispatched"
        );
        report
    }

    async fn deliver(&self, subscriber: &Subscriber, event: &StateChangeEvent, text: &str) -> DeliveryOutcome {
        let recipient = subscriber.recipient.as_str();
        let since = Utc::now() - self.settings.retention;

        match self.store.has_delivered(recipient, event.id, since).await {
            Ok(true) => {
                debug!(recipient, event_id = %event.id, "Already delivered, skipping");
                metrics::counter!("scout_deliveries_total", "result" => "skipped").increment(1);
                return DeliveryOutcome::Skipped;
            }
            Ok(false) => {}
            // at-least-once: a failed lookup must not drop the notification
            Err(e) => warn!(recipient, "Delivery lookup failed, sending anyway: {}", e),
        }

        let message = OutboundMessage::new(recipient, text).in_thread(subscriber.thread_id);
        let mut result = self.send_with_retry(&message).await;

        if let (Err(TransportError::Rejected(reason)), Some(thread_id)) = (&result, subscriber.thread_id) {
            warn!(recipient, thread_id, "Topic rejected the message ({}), posting to the main chat", reason);
            result = self.send_with_retry(&message.clone().in_thread(None)).await;
        }

        let (record, outcome) = match result {
            Ok(SentMessage { message_id }) => (
                DeliveryRecord::delivered(recipient, event.id, message_id),
                DeliveryOutcome::Delivered,
            ),
            Err(e) => {
                error!(recipient, event_id = %event.id, "Delivery failed: {}", e);
                self.alerts
                    .alert(&format!(
                        "Could not notify {} about {}: {}",
                        subscriber.name.as_deref().unwrap_or(recipient),
                        event.target,
                        e
                    ))
                    .await;
                (
                    DeliveryRecord::failed(recipient, event.id, e.to_string()),
                    DeliveryOutcome::Failed,
                )
            }
        };

        let label = if outcome == DeliveryOutcome::Delivered { "delivered" } else { "failed" };
        metrics::counter!("scout_deliveries_total", "result" => label).increment(1);

        if let Err(e) = self.store.record_delivery(&record).await {
            error!(recipient, event_id = %event.id, "Failed to record delivery: {}", e);
        }
        outcome
    }

    /// Sends with exponential backoff. A rate-limited attempt waits at least as
    /// long as the service asked before the next one.
    async fn send_with_retry(&self, message: &OutboundMessage) -> Result<SentMessage, TransportError> {
        // from_millis(2) doubles each step; factor scales the first wait to base_delay
        let factor = (self.settings.base_delay.as_millis() as u64 / 2).max(1);
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.settings.max_delay)
            .take(self.settings.max_attempts.saturating_sub(1) as usize);

        loop {
            let err = match self.transport.send(message).await {
                Ok(sent) => return Ok(sent),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            let Some(backoff) = delays.next() else {
                return Err(err);
            };

            let wait = match &err {
                TransportError::RateLimited {
                    retry_after: Some(retry_after),
                } => backoff.max(*retry_after),
                _ => backoff,
            };
            debug!(recipient = %message.recipient, ?wait, "Retrying send after: {}", err);
            tokio::time::sleep(wait).await;
        }
    }
}

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

pub fn format_event(event: &StateChangeEvent) -> String {
    let icon = match event.current {
        AvailabilityState::Available => "✅",
        AvailabilityState::Unavailable => "❌",
        AvailabilityState::Unknown => "❔",
    };

    let mut text = format!(
        "{} <b>{}</b> is now {}",
        icon,
        escape_html(&event.display_name),
        event.current
    );
    if event.is_first_observation() {
        text.push_str(" (first check)");
    } else {
        text.push_str(&format!(" (was {})", event.previous));
    }
    text.push_str(&format!(
        "\nProduct <code>{}</code> at store <code>{}</code>\n<i>{}</i>",
        escape_html(&event.target.product_id),
        escape_html(&event.target.location_id),
        event.observed_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    text
}
