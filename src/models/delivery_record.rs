use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::generate_id;

/// Outcome of delivering one event to one subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRecord {
    pub id: String,
    pub subscriber: String,
    pub event_id: Uuid,
    pub delivered_at: DateTime<Utc>,
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl DeliveryRecord {
    pub fn delivered(subscriber: &str, event_id: Uuid, message_id: Option<String>) -> Self {
        Self {
            id: generate_id(),
            subscriber: subscriber.to_string(),
            event_id,
            delivered_at: Utc::now(),
            success: true,
            message_id,
            error: None,
        }
    }

    pub fn failed(subscriber: &str, event_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            subscriber: subscriber.to_string(),
            event_id,
            delivered_at: Utc::now(),
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}
