use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use fieldsync::{
    ConnectivityMonitor, NetworkStatus, Store, WriteOutcome,
    merge::{MergeDecision, RecordSource},
    testing::InMemoryRemoteStore,
};
use serde::Deserialize;
use serde_json::json;

// Unknown connectivity: writes are queued, reads still try the remote.
async fn store_with(remote: Arc<InMemoryRemoteStore>) -> Result<Store> {
    Ok(Store::builder(remote).build().await?)
}

#[tokio::test]
async fn pending_delete_hides_remote_copy() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.seed("faults", "f1", json!({"title": "leak"}));
    remote.seed("faults", "f2", json!({"title": "crack"}));
    remote.set_updated_at("faults", "f1", Utc::now() + Duration::hours(1));
    let store = store_with(remote).await?;

    assert_eq!(store.delete("faults", "f1").await?, WriteOutcome::Queued);

    let view = store.read_view("faults").await?;
    assert_eq!(view.ids().collect::<Vec<_>>(), vec!["f2"]);
    assert_eq!(view.trace[0].decision, MergeDecision::Masked);
    Ok(())
}

#[tokio::test]
async fn local_edit_overlays_older_remote_copy() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.seed("faults", "f1", json!({"title": "leak"}));
    remote.set_updated_at("faults", "f1", Utc::now() - Duration::hours(1));
    let store = store_with(remote).await?;

    store
        .update("faults", "f1", &json!({"title": "big leak"}))
        .await?;

    let view = store.read_view("faults").await?;
    let f1 = view.get("f1").expect("record");
    assert_eq!(f1.body["title"], "big leak");
    assert!(matches!(f1.source, RecordSource::Pending(_)));
    Ok(())
}

#[tokio::test]
async fn newer_remote_edit_wins_the_tie_break() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.seed("faults", "f1", json!({"title": "leak"}));
    let store = store_with(remote.clone()).await?;

    store
        .update("faults", "f1", &json!({"title": "local"}))
        .await?;
    remote.overwrite("faults", "f1", json!({"title": "remote"}));
    remote.set_updated_at("faults", "f1", Utc::now() + Duration::minutes(5));

    let view = store.read_view("faults").await?;
    assert_eq!(view.get("f1").expect("record").body["title"], "remote");
    assert_eq!(view.stale_count(), 1);
    assert_eq!(store.pending_count().await?, 1);
    Ok(())
}

#[tokio::test]
async fn queued_creates_appear_after_remote_records() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.seed("faults", "f1", json!({"title": "leak"}));
    let store = store_with(remote).await?;

    store.create("faults", "n2", &json!({"title": "b"})).await?;
    store.create("faults", "n1", &json!({"title": "a"})).await?;

    let view = store.read_view("faults").await?;
    assert_eq!(view.ids().collect::<Vec<_>>(), vec!["f1", "n2", "n1"]);
    Ok(())
}

#[tokio::test]
async fn offline_reads_use_the_last_snapshot() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.seed("faults", "f1", json!({"title": "leak"}));
    let monitor = ConnectivityMonitor::new(NetworkStatus::Unknown);
    let store = Store::builder(remote.clone())
        .connectivity(monitor.clone())
        .build()
        .await?;

    assert_eq!(store.read_view("faults").await?.len(), 1);

    monitor.set_offline();
    remote.seed("faults", "f2", json!({"title": "unseen"}));
    let view = store.read_view("faults").await?;
    assert_eq!(view.ids().collect::<Vec<_>>(), vec!["f1"]);

    monitor.set_status(NetworkStatus::Unknown);
    remote.set_unreachable(true);
    let view = store.read_view("faults").await?;
    assert_eq!(view.ids().collect::<Vec<_>>(), vec!["f1"]);
    Ok(())
}

#[derive(Debug, Deserialize, PartialEq)]
struct Fault {
    title: String,
    severity: String,
    schema_version: i32,
}

#[tokio::test]
async fn old_records_are_upcast_before_decoding() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    remote.seed("faults", "f1", json!({"title": "leak"}));
    let store = Store::builder(remote)
        .upcaster(fieldsync::record_upcaster!(from "faults", 1 => 2, |value| {
            value["severity"] = json!("minor");
            Ok(value)
        }))
        .build()
        .await?;
    store
        .create("faults", "f2", &json!({"title": "crack", "severity": "major", "schema_version": 2}))
        .await?;

    let faults: Vec<Fault> = store.read("faults").await?;
    assert_eq!(
        faults,
        vec![
            Fault {
                title: "leak".into(),
                severity: "minor".into(),
                schema_version: 2,
            },
            Fault {
                title: "crack".into(),
                severity: "major".into(),
                schema_version: 2,
            },
        ]
    );

    let one: Option<Fault> = store.get("faults", "f1").await?;
    assert_eq!(one.map(|f| f.severity).as_deref(), Some("minor"));
    Ok(())
}

#[tokio::test]
async fn edit_made_while_its_record_is_sent_still_wins() -> Result<()> {
    let remote = Arc::new(InMemoryRemoteStore::new());
    let store = store_with(remote.clone()).await?;
    store.create("faults", "f1", &json!({"v": 1})).await?;
    remote.set_latency(std::time::Duration::from_millis(100));

    let running = tokio::spawn({
        let store = store.clone();
        async move { store.drain().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    assert_eq!(
        store.update("faults", "f1", &json!({"v": 2})).await?,
        WriteOutcome::Queued
    );
    running.await??;
    remote.set_latency(std::time::Duration::ZERO);

    // The drain wrote v1 after the edit was queued; the edit must still show.
    assert_eq!(remote.body("faults", "f1"), Some(json!({"v": 1})));
    let view = store.read_view("faults").await?;
    assert_eq!(view.get("f1").expect("record").body["v"], 2);
    assert_eq!(view.stale_count(), 0);
    Ok(())
}
