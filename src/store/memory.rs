use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{PersistedState, StateStore};
use crate::models::{DeliveryRecord, StateChangeEvent, Subscriber, Target, TargetId};
use crate::utils::error::Result;

#[derive(Default)]
struct Inner {
    targets: BTreeMap<TargetId, Target>,
    states: HashMap<TargetId, PersistedState>,
    outbox: Vec<(StateChangeEvent, bool)>,
    deliveries: Vec<DeliveryRecord>,
    subscribers: BTreeMap<String, Subscriber>,
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn delivery_records(&self) -> Vec<DeliveryRecord> {
        self.inner.read().await.deliveries.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save_target(&self, target: &Target) -> Result<()> {
        self.inner
            .write()
            .await
            .targets
            .insert(target.id(), target.clone());
        Ok(())
    }

    async fn remove_target(&self, id: &TargetId) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.targets.remove(id);
        inner.states.remove(id);
        Ok(())
    }

    async fn load_targets(&self) -> Result<Vec<Target>> {
        Ok(self.inner.read().await.targets.values().cloned().collect())
    }

    async fn load_states(&self) -> Result<HashMap<TargetId, PersistedState>> {
        Ok(self.inner.read().await.states.clone())
    }

    async fn record_transition(&self, event: &StateChangeEvent) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.states.insert(
            event.target.clone(),
            PersistedState {
                state: event.current,
                changed_at: event.observed_at,
            },
        );
        if !inner.outbox.iter().any(|(e, _)| e.id == event.id) {
            inner.outbox.push((event.clone(), false));
        }
        Ok(())
    }

    async fn pending_events(&self) -> Result<Vec<StateChangeEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .outbox
            .iter()
            .filter(|(_, done)| !done)
            .map(|(event, _)| event.clone())
            .collect())
    }

    async fn complete_event(&self, event_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.outbox.iter_mut().find(|(e, _)| e.id == event_id) {
            entry.1 = true;
        }
        Ok(())
    }

    async fn has_delivered(&self, subscriber: &str, event_id: Uuid, since: DateTime<Utc>) -> Result<bool> {
        Ok(self.inner.read().await.deliveries.iter().any(|r| {
            r.success && r.subscriber == subscriber && r.event_id == event_id && r.delivered_at >= since
        }))
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        self.inner.write().await.deliveries.push(record.clone());
        Ok(())
    }

    async fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let len = inner.deliveries.len();
        inner.deliveries.retain(|r| r.delivered_at >= before);
        Ok((len - inner.deliveries.len()) as u64)
    }

    async fn save_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        self.inner
            .write()
            .await
            .subscribers
            .insert(subscriber.recipient.clone(), subscriber.clone());
        Ok(())
    }

    async fn remove_subscriber(&self, recipient: &str) -> Result<()> {
        self.inner.write().await.subscribers.remove(recipient);
        Ok(())
    }

    async fn load_subscribers(&self) -> Result<Vec<Subscriber>> {
        Ok(self.inner.read().await.subscribers.values().cloned().collect())
    }
}
