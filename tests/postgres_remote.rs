use std::sync::Arc;

use anyhow::Result;
use fieldsync::{
    LocalQueue, PendingMutation, PgRemoteStore, RemoteStore, SyncConfig, Synchronizer,
    schema::SchemaManager,
};
use serde_json::json;
use sqlx::PgPool;
use testcontainers::{
    GenericImage, ImageExt,
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
};

#[tokio::test]
async fn pg_remote_store_round_trip() -> Result<()> {
    let image = GenericImage::new("postgres", "16-alpine")
        .with_exposed_port(5432.tcp())
        .with_wait_for(WaitFor::message_on_stderr(
            "database system is ready to accept connections",
        ))
        .with_env_var("POSTGRES_USER", "postgres")
        .with_env_var("POSTGRES_PASSWORD", "postgres");
    let container = image.start().await?;
    let host = container.get_host().await?;
    let port = container.get_host_port_ipv4(5432).await?;
    let url = format!("postgres://postgres:postgres@{host}:{port}/postgres?sslmode=disable");

    let pool = PgPool::connect(&url).await?;
    let applied = fieldsync::testing::migrate_remote_schema(&pool).await?;
    assert!(!applied.is_empty());
    assert!(SchemaManager::new(pool.clone()).plan().await?.is_empty());

    let remote = PgRemoteStore::new(pool);
    remote.ping().await?;

    // create is keyed on the local id, so a replay lands on the same row
    let key = remote.create("faults", "f1", &json!({"v": 1})).await?;
    let again = remote.create("faults", "f1", &json!({"v": 2})).await?;
    assert_eq!(key, again);
    assert_eq!(remote.find_by_local_id("faults", "f1").await?, Some(key.clone()));
    assert_eq!(remote.find_by_local_id("sites", "f1").await?, None);

    remote.update("faults", &key, &json!({"v": 3})).await?;
    let docs = remote.list("faults").await?;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].local_id, "f1");
    assert_eq!(docs[0].body, json!({"v": 3}));
    assert!(docs[0].updated_at.is_some());

    remote.delete("faults", &key).await?;
    assert!(remote.delete("faults", &key).await.unwrap_err().is_not_found());
    assert!(remote
        .update("faults", "not-a-key", &json!({}))
        .await
        .unwrap_err()
        .is_not_found());

    // drain a local queue into the table
    let queue = LocalQueue::open_in_memory().await?;
    queue
        .put(PendingMutation::create("faults", "f2", json!({"title": "leak"})))
        .await?;
    queue
        .put(PendingMutation::delete("faults", "missing"))
        .await?;
    let remote = Arc::new(remote);
    let sync = Synchronizer::new(queue.clone(), remote.clone(), SyncConfig::default());
    let report = sync.drain().await?.report().expect("ran");

    assert_eq!(report.success_count, 2);
    assert_eq!(queue.pending_count().await?, 0);
    let docs = remote.list("faults").await?;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].body["title"], "leak");
    Ok(())
}
