//! Persistence for targets, their last-known state, the event outbox,
//! delivery records and subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::{AvailabilityState, DeliveryRecord, StateChangeEvent, Subscriber, Target, TargetId};
use crate::utils::error::Result;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Last-known availability of a target as of its most recent transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedState {
    pub state: AvailabilityState,
    pub changed_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_target(&self, target: &Target) -> Result<()>;

    /// Deletes the target together with its persisted state.
    async fn remove_target(&self, id: &TargetId) -> Result<()>;

    async fn load_targets(&self) -> Result<Vec<Target>>;

    async fn load_states(&self) -> Result<HashMap<TargetId, PersistedState>>;

    /// Stores the new state and enqueues the event in one atomic step.
    async fn record_transition(&self, event: &StateChangeEvent) -> Result<()>;

    /// Outbox events not yet marked complete, oldest first.
    async fn pending_events(&self) -> Result<Vec<StateChangeEvent>>;

    async fn complete_event(&self, event_id: Uuid) -> Result<()>;

    /// Whether a successful delivery of `event_id` to `subscriber` exists at or after `since`.
    async fn has_delivered(&self, subscriber: &str, event_id: Uuid, since: DateTime<Utc>) -> Result<bool>;

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()>;

    /// Drops delivery records older than `before`, returning how many were removed.
    async fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn save_subscriber(&self, subscriber: &Subscriber) -> Result<()>;

    async fn remove_subscriber(&self, recipient: &str) -> Result<()>;

    async fn load_subscribers(&self) -> Result<Vec<Subscriber>>;
}
