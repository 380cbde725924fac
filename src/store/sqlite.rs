use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{PersistedState, StateStore};
use crate::models::{AvailabilityState, DeliveryRecord, StateChangeEvent, Subscriber, Target, TargetId};
use crate::utils::error::{AppError, Result};

pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct StateRow {
    product_id: String,
    location_id: String,
    state: String,
    changed_at: String,
}

#[derive(FromRow)]
struct OutboxRow {
    event_id: String,
    product_id: String,
    location_id: String,
    display_name: String,
    previous_state: String,
    current_state: String,
    observed_at: String,
}

#[derive(FromRow)]
struct SubscriberRow {
    recipient: String,
    name: Option<String>,
    follows: String,
    thread_id: Option<i64>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies migrations.
    ///
    /// `url` looks like `sqlite://shelf-scout.db` or `sqlite::memory:`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("State store ready at {}", url);

        Ok(Self { pool })
    }
}

// Fixed-width UTC RFC 3339, so text order matches time order.
fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AppError::Storage(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_state(raw: &str) -> Result<AvailabilityState> {
    raw.parse().map_err(AppError::Storage)
}

impl TryFrom<OutboxRow> for StateChangeEvent {
    type Error = AppError;

    fn try_from(row: OutboxRow) -> Result<Self> {
        Ok(StateChangeEvent {
            id: Uuid::parse_str(&row.event_id)
                .map_err(|e| AppError::Storage(format!("bad event id '{}': {}", row.event_id, e)))?,
            target: TargetId::new(row.product_id, row.location_id),
            display_name: row.display_name,
            previous: parse_state(&row.previous_state)?,
            current: parse_state(&row.current_state)?,
            observed_at: parse_time(&row.observed_at)?,
        })
    }
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn save_target(&self, target: &Target) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO targets (product_id, location_id, display_name, enabled, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (product_id, location_id) DO UPDATE SET
                display_name = excluded.display_name,
                enabled = excluded.enabled
            "#,
        )
        .bind(&target.product_id)
        .bind(&target.location_id)
        .bind(&target.display_name)
        .bind(target.enabled)
        .bind(format_time(&Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_target(&self, id: &TargetId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM targets WHERE product_id = ? AND location_id = ?")
            .bind(&id.product_id)
            .bind(&id.location_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM target_states WHERE product_id = ? AND location_id = ?")
            .bind(&id.product_id)
            .bind(&id.location_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn load_targets(&self) -> Result<Vec<Target>> {
        let targets = sqlx::query_as::<_, Target>(
            "SELECT product_id, location_id, display_name, enabled FROM targets ORDER BY product_id, location_id",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(targets)
    }

    async fn load_states(&self) -> Result<HashMap<TargetId, PersistedState>> {
        let rows = sqlx::query_as::<_, StateRow>(
            "SELECT product_id, location_id, state, changed_at FROM target_states",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<(TargetId, PersistedState)> {
                let state = PersistedState {
                    state: parse_state(&row.state)?,
                    changed_at: parse_time(&row.changed_at)?,
                };
                Ok((TargetId::new(row.product_id, row.location_id), state))
            })
            .collect()
    }

    async fn record_transition(&self, event: &StateChangeEvent) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO target_states (product_id, location_id, state, changed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (product_id, location_id) DO UPDATE SET
                state = excluded.state,
                changed_at = excluded.changed_at
            "#,
        )
        .bind(&event.target.product_id)
        .bind(&event.target.location_id)
        .bind(event.current.as_str())
        .bind(format_time(&event.observed_at))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO event_outbox
                (event_id, product_id, location_id, display_name, previous_state, current_state, observed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.id.to_string())
        .bind(&event.target.product_id)
        .bind(&event.target.location_id)
        .bind(&event.display_name)
        .bind(event.previous.as_str())
        .bind(event.current.as_str())
        .bind(format_time(&event.observed_at))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(target_id = %event.target, event_id = %event.id, "Recorded transition");
        Ok(())
    }

    async fn pending_events(&self) -> Result<Vec<StateChangeEvent>> {
        let rows = sqlx::query_as::<_, OutboxRow>(
            r#"
            SELECT event_id, product_id, location_id, display_name, previous_state, current_state, observed_at
            FROM event_outbox
            WHERE completed_at IS NULL
            ORDER BY seq
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StateChangeEvent::try_from).collect()
    }

    async fn complete_event(&self, event_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE event_outbox SET completed_at = ? WHERE event_id = ? AND completed_at IS NULL")
            .bind(format_time(&Utc::now()))
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn has_delivered(&self, subscriber: &str, event_id: Uuid, since: DateTime<Utc>) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM delivery_records
            WHERE subscriber = ? AND event_id = ? AND success = 1 AND delivered_at >= ?
            LIMIT 1
            "#,
        )
        .bind(subscriber)
        .bind(event_id.to_string())
        .bind(format_time(&since))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delivery_records (id, subscriber, event_id, delivered_at, success, message_id, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.subscriber)
        .bind(record.event_id.to_string())
        .bind(format_time(&record.delivered_at))
        .bind(record.success)
        .bind(record.message_id.as_deref())
        .bind(record.error.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn prune_deliveries(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM delivery_records WHERE delivered_at < ?")
            .bind(format_time(&before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn save_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subscribers (recipient, name, follows, thread_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (recipient) DO UPDATE SET
                name = excluded.name,
                follows = excluded.follows,
                thread_id = excluded.thread_id
            "#,
        )
        .bind(&subscriber.recipient)
        .bind(subscriber.name.as_deref())
        .bind(serde_json::to_string(&subscriber.follows)?)
        .bind(subscriber.thread_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_subscriber(&self, recipient: &str) -> Result<()> {
        sqlx::query("DELETE FROM subscribers WHERE recipient = ?")
            .bind(recipient)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_subscribers(&self) -> Result<Vec<Subscriber>> {
        let rows = sqlx::query_as::<_, SubscriberRow>(
            "SELECT recipient, name, follows, thread_id FROM subscribers ORDER BY recipient",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<Subscriber> {
                Ok(Subscriber {
                    recipient: row.recipient,
                    name: row.name,
                    follows: serde_json::from_str(&row.follows)?,
                    thread_id: row.thread_id,
                })
            })
            .collect()
    }
}
