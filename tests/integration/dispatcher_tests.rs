use std::sync::Arc;

use super::*;
use shelf_scout::models::{Observation, Scope, StateChangeEvent, Subscriber, TargetId};
use shelf_scout::store::MemoryStore;

fn available_event() -> StateChangeEvent {
    StateChangeEvent::new(
        &target(),
        AvailabilityState::Unknown,
        &Observation::now(AvailabilityState::Available),
    )
}

#[tokio::test]
async fn test_redelivered_event_succeeds_at_most_once_per_subscriber() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let harness = HarnessBuilder::new(store.clone(), ScriptedFetcher::states(&[]))
        .subscriber(Subscriber::new("1", None, &Scope::All))
        .subscriber(Subscriber::new("2", None, &Scope::Target(target().id())))
        .build()
        .await?;

    let event = available_event();
    harness.store.record_transition(&event).await?;

    let first = harness.dispatcher.handle(&event).await;
    let second = harness.dispatcher.handle(&event).await;
    let third = harness.dispatcher.handle(&event).await;

    assert_eq!(first.delivered, 2);
    assert_eq!(second.skipped, 2);
    assert_eq!(third.skipped, 2);
    assert_eq!(harness.transport.sent().len(), 2);

    for recipient in ["1", "2"] {
        let successes = store
            .delivery_records()
            .await
            .into_iter()
            .filter(|r| r.subscriber == recipient && r.event_id == event.id && r.success)
            .count();
        assert_eq!(successes, 1, "subscriber {}", recipient);
    }
    assert!(harness.store.pending_events().await?.is_empty());

    harness.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failures_are_retried() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let harness = HarnessBuilder::new(store.clone(), ScriptedFetcher::states(&[]))
        .transport(RecordingTransport::failing(2))
        .subscriber(Subscriber::new("1", None, &Scope::All))
        .build()
        .await?;

    let report = harness.dispatcher.handle(&available_event()).await;

    assert_eq!(report.delivered, 1);
    assert_eq!(harness.transport.sent().len(), 1);
    assert!(harness.alerts.messages.lock().unwrap().is_empty());
    let records = store.delivery_records().await;
    assert_eq!(records.len(), 1);
    assert!(records[0].success);

    harness.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_alert_the_operator() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let harness = HarnessBuilder::new(store.clone(), ScriptedFetcher::states(&[]))
        .transport(RecordingTransport::failing(10))
        .subscriber(Subscriber::new("1", Some("ada".into()), &Scope::All))
        .build()
        .await?;

    let event = available_event();
    let report = harness.dispatcher.handle(&event).await;

    assert_eq!(report.failed, 1);
    let alerts = harness.alerts.messages.lock().unwrap().clone();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("ada"));

    let records = store.delivery_records().await;
    assert!(!records[0].success);

    // a failed attempt does not block a later redelivery
    let retry = harness.dispatcher.handle(&event).await;
    assert_eq!(retry.skipped, 0);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_events_reach_only_interested_subscribers() -> anyhow::Result<()> {
    let harness = HarnessBuilder::new(Arc::new(MemoryStore::new()), ScriptedFetcher::states(&[]))
        .subscriber(Subscriber::new("fan", None, &Scope::Target(target().id())))
        .subscriber(Subscriber::new(
            "elsewhere",
            None,
            &Scope::Target(TargetId::new("MU793LL/A", "R001")),
        ))
        .build()
        .await?;

    harness.dispatcher.handle(&available_event()).await;

    let sent = harness.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "fan");
    assert!(sent[0].text.contains("<b>iPhone 15 Pro</b>"));

    harness.stop().await;
    Ok(())
}
