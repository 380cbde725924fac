use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::models::{Follows, Scope, Subscriber, TargetId};
use crate::store::StateStore;
use crate::utils::error::{AppError, Result};

/// In-memory view of subscribers, written through to the store.
pub struct SubscriberRegistry {
    subscribers: RwLock<BTreeMap<String, Subscriber>>,
    store: Arc<dyn StateStore>,
}

impl SubscriberRegistry {
    /// Loads persisted subscribers and adds configured ones that are not yet known.
    /// For known recipients the configured forum topic wins.
    pub async fn load(store: Arc<dyn StateStore>, configured: Vec<Subscriber>) -> Result<Self> {
        let mut subscribers: BTreeMap<String, Subscriber> = store
            .load_subscribers()
            .await?
            .into_iter()
            .map(|s| (s.recipient.clone(), s))
            .collect();

        for subscriber in configured {
            match subscribers.get_mut(&subscriber.recipient) {
                Some(existing) if existing.thread_id == subscriber.thread_id => {}
                Some(existing) => {
                    existing.thread_id = subscriber.thread_id;
                    store.save_subscriber(existing).await?;
                }
                None => {
                    store.save_subscriber(&subscriber).await?;
                    subscribers.insert(subscriber.recipient.clone(), subscriber);
                }
            }
        }

        info!("Loaded {} subscriber(s)", subscribers.len());
        Ok(Self {
            subscribers: RwLock::new(subscribers),
            store,
        })
    }

    pub async fn subscribe(&self, recipient: &str, name: Option<String>, scope: &Scope) -> Result<Subscriber> {
        let mut subscribers = self.subscribers.write().await;
        let subscriber = match subscribers.get(recipient) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.follow(scope);
                if name.is_some() {
                    updated.name = name;
                }
                updated
            }
            None => Subscriber::new(recipient, name, scope),
        };

        self.store.save_subscriber(&subscriber).await?;
        subscribers.insert(recipient.to_string(), subscriber.clone());
        info!(recipient, scope = %scope, "Subscribed");
        Ok(subscriber)
    }

    /// Returns false when the recipient was not following `scope`.
    pub async fn unsubscribe(&self, recipient: &str, scope: &Scope) -> Result<bool> {
        let mut subscribers = self.subscribers.write().await;
        let Some(existing) = subscribers.get(recipient) else {
            return Ok(false);
        };

        let mut updated = existing.clone();
        match scope {
            Scope::All => {}
            Scope::Target(id) => {
                if updated.follows == Follows::All {
                    return Err(AppError::Command(
                        "you follow all targets; use /unsubscribe all, then subscribe to the ones you want".into(),
                    ));
                }
                if !updated.unfollow(id) {
                    return Ok(false);
                }
            }
        }

        if matches!(scope, Scope::All) || updated.follows_nothing() {
            self.store.remove_subscriber(recipient).await?;
            subscribers.remove(recipient);
        } else {
            self.store.save_subscriber(&updated).await?;
            subscribers.insert(recipient.to_string(), updated);
        }
        info!(recipient, scope = %scope, "Unsubscribed");
        Ok(true)
    }

    pub async fn interested_in(&self, target: &TargetId) -> Vec<Subscriber> {
        self.subscribers
            .read()
            .await
            .values()
            .filter(|s| s.is_interested(target))
            .cloned()
            .collect()
    }

    pub async fn get(&self, recipient: &str) -> Option<Subscriber> {
        self.subscribers.read().await.get(recipient).cloned()
    }

    pub async fn len(&self) -> usize {
        self.subscribers.read().await.len()
    }
}
