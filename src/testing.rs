//! Test doubles and helpers for exercising sync behaviour without a live backend.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    Result,
    remote::{RemoteDocument, RemoteError, RemoteResult, RemoteStore},
    schema::{SchemaManager, SchemaPlan},
};

/// Create the remote document table on a scratch Postgres database.
pub async fn migrate_remote_schema(pool: &PgPool) -> Result<SchemaPlan> {
    SchemaManager::new(pool.clone()).sync().await
}

#[derive(Default)]
struct State {
    docs: HashMap<String, Vec<RemoteDocument>>,
    fail_next: usize,
    failing_ids: HashSet<String>,
    latency: Option<Duration>,
}

/// Process-local [`RemoteStore`] with fault injection and call counters.
///
/// Unlike the Postgres store, `create` always inserts a fresh document, so a replayed
/// create shows up as a duplicate.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<State>,
    unreachable: AtomicBool,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    lookups: AtomicUsize,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    /// Fail every call that targets `local_id` until cleared.
    pub fn fail_for(&self, local_id: impl Into<String>) {
        self.lock().failing_ids.insert(local_id.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.fail_next = 0;
        state.failing_ids.clear();
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Delay applied to every call before it takes effect.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = Some(latency);
    }

    /// Insert a document directly, bypassing counters. Returns its key.
    pub fn seed(&self, collection: &str, local_id: &str, body: Value) -> String {
        let key = Uuid::new_v4().to_string();
        self.lock()
            .docs
            .entry(collection.to_string())
            .or_default()
            .push(RemoteDocument {
                remote_key: key.clone(),
                local_id: local_id.to_string(),
                body,
                updated_at: Some(Utc::now()),
            });
        key
    }

    /// Overwrite the freshness marker of a document, as a concurrent remote edit would.
    pub fn set_updated_at(&self, collection: &str, local_id: &str, at: DateTime<Utc>) {
        let mut state = self.lock();
        if let Some(doc) = state
            .docs
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.local_id == local_id))
        {
            doc.updated_at = Some(at);
        }
    }

    /// Replace a document's body without touching counters or timestamps.
    pub fn overwrite(&self, collection: &str, local_id: &str, body: Value) {
        let mut state = self.lock();
        if let Some(doc) = state
            .docs
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.local_id == local_id))
        {
            doc.body = body;
        }
    }

    pub fn body(&self, collection: &str, local_id: &str) -> Option<Value> {
        self.lock()
            .docs
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.local_id == local_id))
            .map(|d| d.body.clone())
    }

    /// Number of documents stored for `local_id`; more than one means a duplicated create.
    pub fn copies_of(&self, collection: &str, local_id: &str) -> usize {
        self.lock()
            .docs
            .get(collection)
            .map(|docs| docs.iter().filter(|d| d.local_id == local_id).count())
            .unwrap_or(0)
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock().docs.get(collection).map_or(0, Vec::len)
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Writes that reached the store, successful or not.
    pub fn write_calls(&self) -> usize {
        self.creates() + self.updates() + self.deletes()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self, local_id: Option<&str>) -> RemoteResult<()> {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote unreachable".into()));
        }
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(RemoteError::Unavailable("injected failure".into()));
        }
        if local_id.is_some_and(|id| state.failing_ids.contains(id)) {
            return Err(RemoteError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn local_id_of(&self, collection: &str, remote_key: &str) -> Option<String> {
        self.lock()
            .docs
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.remote_key == remote_key))
            .map(|d| d.local_id.clone())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn create(&self, collection: &str, local_id: &str, data: &Value) -> RemoteResult<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.enter(Some(local_id)).await?;
        let key = Uuid::new_v4().to_string();
        self.lock()
            .docs
            .entry(collection.to_string())
            .or_default()
            .push(RemoteDocument {
                remote_key: key.clone(),
                local_id: local_id.to_string(),
                body: data.clone(),
                updated_at: Some(Utc::now()),
            });
        Ok(key)
    }

    async fn update(&self, collection: &str, remote_key: &str, data: &Value) -> RemoteResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let local_id = self.local_id_of(collection, remote_key);
        self.enter(local_id.as_deref()).await?;
        let mut state = self.lock();
        let doc = state
            .docs
            .get_mut(collection)
            .and_then(|docs| docs.iter_mut().find(|d| d.remote_key == remote_key))
            .ok_or_else(|| RemoteError::not_found(collection, remote_key))?;
        doc.body = data.clone();
        doc.updated_at = Some(Utc::now());
        Ok(())
    }

    async fn delete(&self, collection: &str, remote_key: &str) -> RemoteResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let local_id = self.local_id_of(collection, remote_key);
        self.enter(local_id.as_deref()).await?;
        let mut state = self.lock();
        let docs = state.docs.entry(collection.to_string()).or_default();
        let before = docs.len();
        docs.retain(|d| d.remote_key != remote_key);
        if docs.len() == before {
            return Err(RemoteError::not_found(collection, remote_key));
        }
        Ok(())
    }

    async fn find_by_local_id(
        &self,
        collection: &str,
        local_id: &str,
    ) -> RemoteResult<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.enter(Some(local_id)).await?;
        Ok(self
            .lock()
            .docs
            .get(collection)
            .and_then(|docs| docs.iter().find(|d| d.local_id == local_id))
            .map(|d| d.remote_key.clone()))
    }

    async fn list(&self, collection: &str) -> RemoteResult<Vec<RemoteDocument>> {
        self.enter(None).await?;
        Ok(self.lock().docs.get(collection).cloned().unwrap_or_default())
    }

    async fn ping(&self) -> RemoteResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote unreachable".into()));
        }
        Ok(())
    }
}
