use std::sync::Arc;
use std::time::Duration;

use super::*;
use shelf_scout::control::Requester;
use shelf_scout::store::MemoryStore;

#[tokio::test(start_paused = true)]
async fn test_chat_commands_drive_monitoring_and_alerts() -> anyhow::Result<()> {
    let harness = HarnessBuilder::new(Arc::new(MemoryStore::new()), ScriptedFetcher::states(&[U, U, A]))
        .build()
        .await?;
    let ada = Requester::new("1001", Some("ada".into()));

    let reply = harness.control.handle(&ada, "/add MU793LL/A R409 iPhone 15 Pro").await;
    assert!(!reply.is_error, "{}", reply.text);

    let reply = harness.control.handle(&ada, "/subscribe MU793LL/A R409").await;
    assert!(!reply.is_error, "{}", reply.text);

    let transport = harness.transport.clone();
    let restocked = wait_until(INTERVAL * 5, move || {
        transport
            .sent()
            .iter()
            .any(|m| m.recipient == "1001" && m.text.contains("is now AVAILABLE"))
    })
    .await;
    assert!(restocked);

    let status = harness.control.handle(&ada, "/status").await;
    assert!(status.text.contains(": AVAILABLE (polling)"), "{}", status.text);
    assert!(status.text.contains("iPhone 15 Pro"));

    harness.stop().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_invalid_commands_leave_state_untouched() -> anyhow::Result<()> {
    let harness = HarnessBuilder::new(Arc::new(MemoryStore::new()), ScriptedFetcher::states(&[U]))
        .build()
        .await?;
    let ada = Requester::new("1001", None);

    for text in ["/add", "/remove MU793LL/A", "/pause a b c", "/launch", "/subscribe MU793LL/A R409"] {
        let reply = harness.control.handle(&ada, text).await;
        assert!(reply.is_error, "{} should fail", text);
    }

    assert!(harness.supervisor.list().await.is_empty());
    assert_eq!(harness.subscribers.len().await, 0);
    assert!(!harness.supervisor.global_policy().paused);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(harness.fetcher.calls(), 0);

    harness.stop().await;
    Ok(())
}
