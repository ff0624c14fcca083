use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use fieldsync::{
    ConnectivityMonitor, NetworkStatus, Store, SyncNotification, SyncReport, WriteOutcome,
    testing::InMemoryRemoteStore,
};
use serde_json::json;
use tokio::sync::broadcast;

async fn next_sync_report(
    rx: &mut broadcast::Receiver<SyncNotification>,
) -> Result<SyncReport> {
    let wait = async {
        loop {
            if let SyncNotification::SyncComplete(report) = rx.recv().await? {
                return Ok::<_, anyhow::Error>(report);
            }
        }
    };
    match tokio::time::timeout(Duration::from_secs(5), wait).await {
        Ok(report) => report,
        Err(_) => bail!("no sync completed within 5s"),
    }
}

#[tokio::test]
async fn offline_edits_reach_the_remote_once_back_online() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let monitor = ConnectivityMonitor::new(NetworkStatus::Offline);
    let store = Store::builder(remote.clone())
        .connectivity(monitor.clone())
        .build()
        .await?;
    let mut events = store.subscribe();
    let _auto = store.spawn_auto_sync();

    assert_eq!(
        store.create("faults", "f1", &json!({"title": "leak"})).await?,
        WriteOutcome::Queued
    );
    store
        .update("faults", "f1", &json!({"title": "big leak"}))
        .await?;
    store.create("faults", "f2", &json!({"title": "typo"})).await?;
    store.delete("faults", "f2").await?;
    store.create("faults", "f3", &json!({"title": "crack"})).await?;

    assert_eq!(store.pending_count().await?, 2);
    assert_eq!(remote.write_calls(), 0);

    let offline = store.read_view("faults").await?;
    assert_eq!(offline.ids().collect::<Vec<_>>(), vec!["f1", "f3"]);
    assert_eq!(offline.get("f1").expect("f1").body["title"], "big leak");

    monitor.set_online();
    let report = next_sync_report(&mut events).await?;

    assert_eq!(report.success_count, 2);
    assert_eq!(report.failure_count, 0);
    assert_eq!(store.pending_count().await?, 0);
    assert_eq!(remote.creates(), 2);
    assert_eq!(remote.copies_of("faults", "f1"), 1);
    assert_eq!(remote.copies_of("faults", "f2"), 0);
    assert_eq!(remote.body("faults", "f1"), Some(json!({"title": "big leak"})));

    let online = store.read_view("faults").await?;
    assert_eq!(online.ids().collect::<Vec<_>>(), vec!["f1", "f3"]);
    Ok(())
}

#[tokio::test]
async fn flapping_connectivity_leaves_failed_items_for_the_next_transition() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let monitor = ConnectivityMonitor::new(NetworkStatus::Offline);
    let store = Store::builder(remote.clone())
        .connectivity(monitor.clone())
        .build()
        .await?;
    let mut events = store.subscribe();
    let _auto = store.spawn_auto_sync();

    store.create("faults", "f1", &json!({"title": "leak"})).await?;
    remote.set_unreachable(true);

    monitor.set_online();
    let report = next_sync_report(&mut events).await?;
    assert_eq!(report.failure_count, 1);
    assert_eq!(store.pending().await?[0].retry_count, 1);

    monitor.set_offline();
    remote.set_unreachable(false);
    monitor.set_online();
    let report = next_sync_report(&mut events).await?;
    assert_eq!(report.success_count, 1);
    assert_eq!(store.pending_count().await?, 0);
    Ok(())
}

#[tokio::test]
async fn online_writes_bypass_the_queue() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let monitor = ConnectivityMonitor::new(NetworkStatus::Online);
    let store = Store::builder(remote.clone())
        .connectivity(monitor)
        .build()
        .await?;

    assert_eq!(
        store.create("faults", "f1", &json!({"title": "leak"})).await?,
        WriteOutcome::Applied
    );
    assert_eq!(
        store.update("faults", "f1", &json!({"title": "fixed"})).await?,
        WriteOutcome::Applied
    );
    assert_eq!(store.delete("faults", "f1").await?, WriteOutcome::Applied);

    assert_eq!(store.pending_count().await?, 0);
    assert_eq!(remote.len("faults"), 0);
    Ok(())
}
