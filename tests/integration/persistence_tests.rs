use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use super::*;
use shelf_scout::models::{Observation, Scope, StateChangeEvent, Subscriber};
use shelf_scout::store::{SqliteStore, StateStore};

async fn open(dir: &TempDir) -> anyhow::Result<Arc<SqliteStore>> {
    let url = format!("sqlite://{}/scout.db", dir.path().display());
    Ok(Arc::new(SqliteStore::connect(&url, 2).await?))
}

/// Real-time polling; SQLite work happens off the runtime so virtual time is not used here.
async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_restart_with_persisted_state_emits_no_event() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let first = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[A]))
        .subscriber(Subscriber::new("42", None, &Scope::All))
        .build()
        .await?;
    let summary = first.supervisor.restore(vec![target()]).await?;
    assert_eq!(summary.started, 1);

    assert!(eventually(|| first.transport.sent().len() == 1).await);
    let states_before = first.store.load_states().await?;
    first.stop().await;

    let second = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[A]))
        .build()
        .await?;
    let summary = second.supervisor.restore(vec![target()]).await?;
    assert_eq!(summary.replayed, 0);

    assert!(eventually(|| second.fetcher.calls() >= 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(second.transport.sent().is_empty());
    assert_eq!(second.store.load_states().await?, states_before);
    assert!(second.store.pending_events().await?.is_empty());

    let listed = second.supervisor.list().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status.state, A);

    second.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_undelivered_events_are_replayed_on_restore() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let store = open(&dir).await?;

    // crash between committing the transition and notifying anyone
    store.save_target(&target()).await?;
    let event = StateChangeEvent::new(
        &target(),
        AvailabilityState::Unknown,
        &Observation::now(AvailabilityState::Available),
    );
    store.record_transition(&event).await?;
    drop(store);

    let harness = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[A]))
        .subscriber(Subscriber::new("42", None, &Scope::All))
        .build()
        .await?;
    let summary = harness.supervisor.restore(vec![]).await?;
    assert_eq!(summary.replayed, 1);

    assert!(eventually(|| harness.transport.sent().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.transport.sent().len(), 1);
    assert!(harness.store.pending_events().await?.is_empty());

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_paused_target_stays_paused_after_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let first = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[U]))
        .build()
        .await?;
    first.supervisor.restore(vec![target()]).await?;
    first.supervisor.pause(&Scope::Target(target().id())).await?;
    first.stop().await;

    let second = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[U]))
        .build()
        .await?;
    let summary = second.supervisor.restore(vec![target()]).await?;

    assert_eq!(summary.started, 0);
    let listed = second.supervisor.list().await;
    assert!(!listed[0].enabled);
    assert!(!listed[0].running);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(second.fetcher.calls(), 0);

    second.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_subscriptions_survive_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;

    let first = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[]))
        .build()
        .await?;
    first
        .subscribers
        .subscribe("42", Some("ada".into()), &Scope::Target(target().id()))
        .await?;
    first.stop().await;

    let second = HarnessBuilder::new(open(&dir).await?, ScriptedFetcher::states(&[]))
        .build()
        .await?;
    let restored = second.subscribers.get("42").await.expect("subscriber persisted");
    assert_eq!(restored.name.as_deref(), Some("ada"));
    assert!(restored.is_interested(&target().id()));

    second.stop().await;
    Ok(())
}
