use crate::{
    Error, Result,
    connectivity::{ConnectivityMonitor, NetworkStatus},
    error::WithContext,
    merge::{MergedView, merge_view},
    metrics,
    mutation::{Action, PendingMutation},
    notify::{Notifier, SyncNotification},
    queue::{LocalQueue, LocalQueueOptions},
    remote::{RemoteDocument, RemoteError, RemoteStore},
    sync::{BackoffPolicy, DrainOutcome, SyncConfig, Synchronizer, with_timeout},
    upcasting::{Upcaster, UpcasterRegistry},
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::{
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tracing::{debug, warn};

/// Where a write ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Confirmed by the remote store.
    Applied,
    /// Recorded in the local queue for the next drain.
    Queued,
}

type SnapshotCache = Arc<RwLock<HashMap<String, Vec<RemoteDocument>>>>;
type RecordKey = (String, String);
type WriteLocks = Arc<std::sync::Mutex<HashMap<RecordKey, Arc<Mutex<()>>>>>;

/// Offline-first entry point: writes go straight to the remote when possible and to
/// the local queue otherwise; reads overlay pending writes on the remote snapshot.
#[derive(Clone)]
pub struct Store {
    queue: LocalQueue,
    remote: Arc<dyn RemoteStore>,
    monitor: ConnectivityMonitor,
    sync: Arc<Synchronizer>,
    upcasters: Arc<UpcasterRegistry>,
    snapshots: SnapshotCache,
    write_locks: WriteLocks,
}

impl Store {
    pub fn builder(remote: Arc<dyn RemoteStore>) -> StoreBuilder {
        StoreBuilder::new(remote)
    }

    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn synchronizer(&self) -> &Arc<Synchronizer> {
        &self.sync
    }

    pub fn upcasters(&self) -> &UpcasterRegistry {
        &self.upcasters
    }

    pub async fn create<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        record: &T,
    ) -> Result<WriteOutcome> {
        let payload = serde_json::to_value(record)?;
        self.write(PendingMutation::create(collection, id, payload))
            .await
    }

    pub async fn update<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        record: &T,
    ) -> Result<WriteOutcome> {
        let payload = serde_json::to_value(record)?;
        self.write(PendingMutation::update(collection, id, payload))
            .await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<WriteOutcome> {
        self.write(PendingMutation::delete(collection, id)).await
    }

    /// Writes to one record run one at a time, so the queue check below and the
    /// write it decides on cannot interleave with another write to that record.
    async fn write(&self, mutation: PendingMutation) -> Result<WriteOutcome> {
        let key = (mutation.collection.clone(), mutation.id.clone());
        let lock = self.record_lock(&key);
        let outcome = {
            let _held = lock.lock().await;
            self.write_one(mutation).await
        };
        self.release_record_lock(key, lock);
        outcome
    }

    fn record_lock(&self, key: &RecordKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    fn release_record_lock(&self, key: RecordKey, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map and this caller hold it: nobody is waiting.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
    }

    async fn write_one(&self, mutation: PendingMutation) -> Result<WriteOutcome> {
        // A queued entry for the same record must be applied first, so later writes
        // coalesce into it instead of overtaking it.
        if self.monitor.is_online()
            && self
                .queue
                .get(&mutation.collection, &mutation.id)
                .await?
                .is_none()
        {
            match self.apply_direct(&mutation).await {
                Ok(()) => {
                    metrics::record_direct_write();
                    return Ok(WriteOutcome::Applied);
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        collection = %mutation.collection,
                        id = %mutation.id,
                        action = %mutation.action,
                        error = %err,
                        "direct write failed; queueing"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        self.queue.put(mutation).await?;
        Ok(WriteOutcome::Queued)
    }

    async fn apply_direct(&self, m: &PendingMutation) -> Result<()> {
        let timeout = self.sync.config().remote_timeout;
        let remote = self.remote.as_ref();
        match m.action {
            Action::Create => {
                let payload = m.payload.as_ref().ok_or_else(|| missing_payload(m))?;
                let key = with_timeout(timeout, remote.create(&m.collection, &m.id, payload)).await?;
                self.cache_put(m, key, payload.clone());
            }
            Action::Update => {
                let payload = m.payload.as_ref().ok_or_else(|| missing_payload(m))?;
                let key = with_timeout(timeout, remote.find_by_local_id(&m.collection, &m.id))
                    .await?
                    .ok_or_else(|| Error::remote_not_found(&m.collection, &m.id))?;
                with_timeout(timeout, remote.update(&m.collection, &key, payload))
                    .await
                    .map_err(|err| match err {
                        RemoteError::NotFound { .. } => Error::remote_not_found(&m.collection, &m.id),
                        other => other.into(),
                    })?;
                self.cache_put(m, key, payload.clone());
            }
            Action::Delete => {
                let key = with_timeout(timeout, remote.find_by_local_id(&m.collection, &m.id)).await?;
                if let Some(key) = key {
                    match with_timeout(timeout, remote.delete(&m.collection, &key)).await {
                        Ok(()) | Err(RemoteError::NotFound { .. }) => {}
                        Err(err) => return Err(err.into()),
                    }
                }
                self.cache_remove(&m.collection, &m.id);
            }
        }
        debug!(collection = %m.collection, id = %m.id, action = %m.action, "applied directly");
        Ok(())
    }

    /// Current state of `collection` with pending local writes applied, upcast to the
    /// newest registered schema version.
    pub async fn read_view(&self, collection: &str) -> Result<MergedView> {
        let snapshot = self.snapshot(collection).await;
        let pending = self.queue.list_collection(collection).await?;
        let mut view = merge_view(&snapshot, &pending);
        metrics::record_conflict_stale(view.stale_count() as u64);

        for record in &mut view.records {
            self.upcasters
                .upcast(collection, &mut record.body)
                .context(format!("upcasting {collection}/{}", record.id))?;
        }
        Ok(view)
    }

    pub async fn read<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let view = self.read_view(collection).await?;
        view.records
            .into_iter()
            .map(|record| decode(collection, &record.id, record.body))
            .collect()
    }

    pub async fn get<T: DeserializeOwned>(&self, collection: &str, id: &str) -> Result<Option<T>> {
        let view = self.read_view(collection).await?;
        view.records
            .into_iter()
            .find(|record| record.id == id)
            .map(|record| decode(collection, id, record.body))
            .transpose()
    }

    /// Live listing when the remote answers; otherwise the last listing seen.
    async fn snapshot(&self, collection: &str) -> Vec<RemoteDocument> {
        if self.monitor.status() != NetworkStatus::Offline {
            let timeout = self.sync.config().remote_timeout;
            match with_timeout(timeout, self.remote.list(collection)).await {
                Ok(docs) => {
                    if let Ok(mut cache) = self.snapshots.write() {
                        cache.insert(collection.to_string(), docs.clone());
                    }
                    return docs;
                }
                Err(err) => debug!(collection, error = %err, "remote listing failed; using cached snapshot"),
            }
        }
        self.snapshots
            .read()
            .ok()
            .and_then(|cache| cache.get(collection).cloned())
            .unwrap_or_default()
    }

    fn cache_put(&self, m: &PendingMutation, remote_key: String, body: Value) {
        let Ok(mut cache) = self.snapshots.write() else {
            return;
        };
        let Some(docs) = cache.get_mut(&m.collection) else {
            return;
        };
        match docs.iter_mut().find(|d| d.local_id == m.id) {
            Some(doc) => {
                doc.body = body;
                doc.remote_key = remote_key;
                doc.updated_at = None;
            }
            None => docs.push(RemoteDocument {
                remote_key,
                local_id: m.id.clone(),
                body,
                updated_at: None,
            }),
        }
    }

    fn cache_remove(&self, collection: &str, id: &str) {
        if let Ok(mut cache) = self.snapshots.write() {
            if let Some(docs) = cache.get_mut(collection) {
                docs.retain(|d| d.local_id != id);
            }
        }
    }

    pub async fn drain(&self) -> Result<DrainOutcome> {
        self.sync.drain().await
    }

    pub async fn pending(&self) -> Result<Vec<PendingMutation>> {
        self.queue.get_all().await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        self.queue.pending_count().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.queue.notifier().subscribe()
    }

    /// Drain once on every transition of the connectivity monitor to online.
    pub fn spawn_auto_sync(&self) -> JoinHandle<()> {
        Arc::clone(&self.sync).spawn_auto_sync(&self.monitor)
    }

    pub async fn open(&self) -> Result<()> {
        self.queue.open().await
    }

    pub async fn close(&self) {
        self.queue.close().await
    }
}

fn missing_payload(m: &PendingMutation) -> Error {
    Error::MissingPayload {
        collection: m.collection.clone(),
        id: m.id.clone(),
        action: m.action,
    }
}

fn decode<T: DeserializeOwned>(collection: &str, id: &str, body: Value) -> Result<T> {
    serde_json::from_value(body)
        .map_err(Error::from)
        .context(format!("decoding {collection}/{id}"))
}

pub struct StoreBuilder {
    remote: Arc<dyn RemoteStore>,
    queue_options: LocalQueueOptions,
    monitor: Option<ConnectivityMonitor>,
    sync_config: SyncConfig,
    upcasters: UpcasterRegistry,
    notify_capacity: usize,
}

impl StoreBuilder {
    pub fn new(remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            remote,
            queue_options: LocalQueueOptions::memory(),
            monitor: None,
            sync_config: SyncConfig::default(),
            upcasters: UpcasterRegistry::new(),
            notify_capacity: 256,
        }
    }

    pub fn queue_options(mut self, options: LocalQueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Persist the queue in a SQLite file at `path`.
    pub fn queue_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.queue_options = LocalQueueOptions::file(path);
        self
    }

    /// Share a monitor with other components. Defaults to a fresh one in `Unknown`.
    pub fn connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    pub fn backoff(mut self, policy: BackoffPolicy) -> Self {
        self.sync_config.backoff = Some(policy);
        self
    }

    pub fn remote_timeout(mut self, timeout: Duration) -> Self {
        self.sync_config.remote_timeout = Some(timeout);
        self
    }

    pub fn upcaster<U>(mut self, upcaster: U) -> Self
    where
        U: Upcaster + 'static,
    {
        self.upcasters.register(upcaster);
        self
    }

    pub fn notify_capacity(mut self, capacity: usize) -> Self {
        self.notify_capacity = capacity.max(1);
        self
    }

    /// Open the local queue and wire every component together.
    pub async fn build(self) -> Result<Store> {
        let notifier = Notifier::new(self.notify_capacity);
        let queue = LocalQueue::connect(self.queue_options, notifier)
            .await
            .context("opening local queue")?;
        let sync = Arc::new(Synchronizer::new(
            queue.clone(),
            Arc::clone(&self.remote),
            self.sync_config,
        ));
        Ok(Store {
            queue,
            remote: self.remote,
            monitor: self.monitor.unwrap_or_default(),
            sync,
            upcasters: Arc::new(self.upcasters),
            snapshots: Arc::new(RwLock::new(HashMap::new())),
            write_locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRemoteStore;
    use serde_json::json;

    async fn store(remote: Arc<InMemoryRemoteStore>, online: bool) -> Store {
        let monitor = ConnectivityMonitor::new(if online {
            NetworkStatus::Online
        } else {
            NetworkStatus::Offline
        });
        Store::builder(remote)
            .connectivity(monitor)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn online_write_skips_the_queue() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(remote.clone(), true).await;

        let outcome = store.create("faults", "f1", &json!({"v": 1})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Applied);
        assert_eq!(store.pending_count().await.unwrap(), 0);
        assert_eq!(remote.copies_of("faults", "f1"), 1);
    }

    #[tokio::test]
    async fn unreachable_remote_falls_back_to_queue() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_unreachable(true);
        let store = store(remote.clone(), true).await;

        let outcome = store.create("faults", "f1", &json!({"v": 1})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn direct_update_of_missing_record_is_not_found() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(remote, true).await;

        let err = store
            .update("faults", "ghost", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteNotFound { .. }));
    }

    #[tokio::test]
    async fn concurrent_writes_to_one_record_apply_in_call_order() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(20));
        let store = store(remote.clone(), true).await;

        let (v1, v2) = (json!({"v": 1}), json!({"v": 2}));
        let (created, updated) = tokio::join!(
            store.create("faults", "f1", &v1),
            store.update("faults", "f1", &v2),
        );

        assert_eq!(created.unwrap(), WriteOutcome::Applied);
        assert_eq!(updated.unwrap(), WriteOutcome::Applied);
        assert_eq!(remote.body("faults", "f1"), Some(json!({"v": 2})));
        assert!(store.write_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_behind_a_queued_entry_is_queued_too() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(remote.clone(), false).await;
        store.create("faults", "f1", &json!({"v": 1})).await.unwrap();

        store.connectivity().set_online();
        let outcome = store.update("faults", "f1", &json!({"v": 2})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Queued);
        assert_eq!(remote.write_calls(), 0);

        let pending = store.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action, Action::Create);
        assert_eq!(pending[0].payload, Some(json!({"v": 2})));
    }
}
