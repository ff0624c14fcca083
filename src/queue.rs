//! Durable, keyed queue of pending mutations backed by SQLite.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    Error, Result, metrics,
    mutation::{Action, Coalesced, PendingMutation, coalesce, coalesce_in_flight},
    notify::Notifier,
    schema,
};

#[derive(Clone, Debug)]
pub enum QueueLocation {
    File(PathBuf),
    /// Private in-memory database; contents do not survive a reopen.
    Memory,
}

#[derive(Clone, Debug)]
pub struct LocalQueueOptions {
    pub location: QueueLocation,
    pub busy_timeout: std::time::Duration,
}

impl LocalQueueOptions {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: QueueLocation::File(path.into()),
            busy_timeout: std::time::Duration::from_secs(5),
        }
    }

    pub fn memory() -> Self {
        Self {
            location: QueueLocation::Memory,
            busy_timeout: std::time::Duration::from_secs(5),
        }
    }

    pub fn busy_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

struct Inner {
    options: LocalQueueOptions,
    pool: Mutex<Option<SqlitePool>>,
    closed: AtomicBool,
    notifier: Notifier,
    applying: std::sync::Mutex<HashSet<(String, String)>>,
}

/// Process-wide pending-mutation store. Cloning shares the same handle.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<Inner>,
}

/// Marks one record as being sent by a drain; released on drop.
pub(crate) struct ApplyClaim {
    queue: LocalQueue,
    key: (String, String),
}

impl Drop for ApplyClaim {
    fn drop(&mut self) {
        self.queue.applying().remove(&self.key);
    }
}

#[derive(FromRow)]
struct MutationRow {
    seq: i64,
    collection: String,
    id: String,
    action: String,
    payload: Option<String>,
    enqueued_at: DateTime<Utc>,
    revision: i64,
    retry_count: i64,
    last_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    remote_ref: Option<String>,
}

impl TryFrom<MutationRow> for PendingMutation {
    type Error = sqlx::Error;

    fn try_from(row: MutationRow) -> std::result::Result<Self, Self::Error> {
        let action = Action::from_str(&row.action).map_err(|e| sqlx::Error::Decode(e.into()))?;
        let payload = row
            .payload
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(PendingMutation {
            collection: row.collection,
            id: row.id,
            action,
            payload,
            enqueued_at: row.enqueued_at,
            seq: row.seq,
            revision: row.revision,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            last_retry_at: row.last_retry_at,
            last_error: row.last_error,
            remote_ref: row.remote_ref,
        })
    }
}

const SELECT_COLUMNS: &str = "select seq, collection, id, action, payload, enqueued_at, revision, \
     retry_count, last_retry_at, last_error, remote_ref from pending_mutations";

fn is_handle_loss(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::Io(_)
            | sqlx::Error::WorkerCrashed
    )
}

impl LocalQueue {
    /// Create a queue in the closed state. Call [`LocalQueue::open`] before use.
    pub fn new(options: LocalQueueOptions, notifier: Notifier) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                pool: Mutex::new(None),
                closed: AtomicBool::new(true),
                notifier,
                applying: std::sync::Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Create and open a queue.
    pub async fn connect(options: LocalQueueOptions, notifier: Notifier) -> Result<Self> {
        let queue = Self::new(options, notifier);
        queue.open().await?;
        Ok(queue)
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::connect(LocalQueueOptions::memory(), Notifier::default()).await
    }

    pub fn notifier(&self) -> &Notifier {
        &self.inner.notifier
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether a drain is sending the entry for this record right now.
    pub fn is_applying(&self, collection: &str, id: &str) -> bool {
        self.applying()
            .contains(&(collection.to_string(), id.to_string()))
    }

    pub(crate) fn claim(&self, collection: &str, id: &str) -> ApplyClaim {
        let key = (collection.to_string(), id.to_string());
        self.applying().insert(key.clone());
        ApplyClaim {
            queue: self.clone(),
            key,
        }
    }

    fn applying(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String)>> {
        self.inner
            .applying
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open (or re-open) the backing store and make sure the queue table exists.
    pub async fn open(&self) -> Result<()> {
        let mut guard = self.inner.pool.lock().await;
        if guard.as_ref().is_some_and(|p| !p.is_closed()) {
            self.inner.closed.store(false, Ordering::Release);
            return Ok(());
        }
        let pool = self
            .connect_pool()
            .await
            .map_err(|source| Error::StorageUnavailable { source })?;
        *guard = Some(pool);
        self.inner.closed.store(false, Ordering::Release);
        debug!(location = ?self.inner.options.location, "local queue opened");
        Ok(())
    }

    /// Release the storage handle. Every operation fails with `QueueClosed` until `open()`.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(pool) = self.inner.pool.lock().await.take() {
            pool.close().await;
        }
        debug!("local queue closed");
    }

    /// Close the underlying pool while leaving the queue logically open, as happens
    /// when the backing store is terminated underneath the process.
    pub async fn sever_handle(&self) {
        if let Some(pool) = self.inner.pool.lock().await.as_ref() {
            pool.close().await;
        }
    }

    async fn connect_pool(&self) -> std::result::Result<SqlitePool, sqlx::Error> {
        let opts = match &self.inner.options.location {
            QueueLocation::File(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
            }
            QueueLocation::Memory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        }
        .busy_timeout(self.inner.options.busy_timeout);

        // A single connection serializes every queue transaction and keeps an
        // in-memory database alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        for stmt in schema::LOCAL_QUEUE_DDL {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(pool)
    }

    async fn current_pool(&self) -> Result<SqlitePool> {
        if !self.is_open() {
            return Err(Error::QueueClosed);
        }
        let mut guard = self.inner.pool.lock().await;
        match guard.as_ref() {
            Some(pool) if !pool.is_closed() => Ok(pool.clone()),
            _ => {
                let pool = self
                    .connect_pool()
                    .await
                    .map_err(|source| Error::StorageUnavailable { source })?;
                *guard = Some(pool.clone());
                metrics::record_storage_reopen();
                debug!("local queue handle reopened");
                Ok(pool)
            }
        }
    }

    async fn reconnect(&self) -> Result<SqlitePool> {
        let mut guard = self.inner.pool.lock().await;
        if let Some(old) = guard.take() {
            old.close().await;
        }
        let pool = self
            .connect_pool()
            .await
            .map_err(|source| Error::StorageUnavailable { source })?;
        *guard = Some(pool.clone());
        metrics::record_storage_reopen();
        Ok(pool)
    }

    /// Run `op` against the pool; on a lost handle, reopen and run it exactly once more.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        let pool = self.current_pool().await?;
        match op(pool).await {
            Ok(value) => Ok(value),
            Err(err) if is_handle_loss(&err) => {
                if !self.is_open() {
                    return Err(Error::QueueClosed);
                }
                warn!(error = %err, "local queue handle lost; reopening");
                let pool = self.reconnect().await?;
                op(pool).await.map_err(|source| {
                    if is_handle_loss(&source) {
                        Error::StorageUnavailable { source }
                    } else {
                        Error::Db(source)
                    }
                })
            }
            Err(err) => Err(Error::Db(err)),
        }
    }

    /// Upsert a mutation, coalescing with any entry already queued for the same record.
    ///
    /// Returns the stored entry, or `None` when the write cancelled a queued create.
    pub async fn put(&self, mutation: PendingMutation) -> Result<Option<PendingMutation>> {
        let (stored, pending, coalesced) = self
            .run(|pool| {
                let incoming = mutation.clone();
                let queue = self.clone();
                async move { put_tx(&pool, incoming, &queue).await }
            })
            .await?;

        metrics::record_queue_put(coalesced);
        metrics::set_pending(pending);
        match &stored {
            Some(m) => debug!(
                collection = %m.collection,
                id = %m.id,
                action = %m.action,
                revision = m.revision,
                coalesced,
                "mutation queued"
            ),
            None => debug!(
                collection = %mutation.collection,
                id = %mutation.id,
                "queued create cancelled by delete"
            ),
        }
        self.inner.notifier.queue_changed(pending as usize);
        Ok(stored)
    }

    /// All pending mutations, oldest first.
    pub async fn get_all(&self) -> Result<Vec<PendingMutation>> {
        self.run(|pool| async move {
            let rows: Vec<MutationRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} order by seq asc"))
                .fetch_all(&pool)
                .await?;
            rows.into_iter().map(PendingMutation::try_from).collect()
        })
        .await
    }

    pub async fn list_collection(&self, collection: &str) -> Result<Vec<PendingMutation>> {
        self.run(|pool| async move {
            let rows: Vec<MutationRow> = sqlx::query_as(&format!(
                "{SELECT_COLUMNS} where collection = ?1 order by seq asc"
            ))
            .bind(collection)
            .fetch_all(&pool)
            .await?;
            rows.into_iter().map(PendingMutation::try_from).collect()
        })
        .await
    }

    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<PendingMutation>> {
        self.run(|pool| async move { fetch_one(&pool, collection, id).await })
            .await
    }

    pub async fn pending_count(&self) -> Result<usize> {
        let n = self
            .run(|pool| async move { count(&pool).await })
            .await?;
        Ok(n as usize)
    }

    /// Remove the entry for a record. No-op when nothing is queued.
    pub async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        let (removed, pending) = self
            .run(|pool| async move {
                let res = sqlx::query("delete from pending_mutations where collection = ?1 and id = ?2")
                    .bind(collection)
                    .bind(id)
                    .execute(&pool)
                    .await?;
                Ok((res.rows_affected() > 0, count(&pool).await?))
            })
            .await?;
        if removed {
            metrics::set_pending(pending);
            self.inner.notifier.queue_changed(pending as usize);
        }
        Ok(removed)
    }

    /// Remove `mutation` only if no later write has coalesced into it since it was read.
    pub async fn acknowledge(&self, mutation: &PendingMutation) -> Result<bool> {
        let (removed, pending) = self
            .run(|pool| async move {
                let res = sqlx::query(
                    "delete from pending_mutations where collection = ?1 and id = ?2 and revision = ?3",
                )
                .bind(&mutation.collection)
                .bind(&mutation.id)
                .bind(mutation.revision)
                .execute(&pool)
                .await?;
                Ok((res.rows_affected() > 0, count(&pool).await?))
            })
            .await?;
        if removed {
            metrics::set_pending(pending);
            self.inner.notifier.queue_changed(pending as usize);
        } else {
            debug!(
                collection = %mutation.collection,
                id = %mutation.id,
                "entry changed while applying; kept for next drain"
            );
        }
        Ok(removed)
    }

    /// Acknowledge an entry whose remote write completed at `written_at`.
    ///
    /// When a later local write kept the entry alive, its `enqueued_at` is raised to
    /// `written_at`, so the remote copy this write produced never reads as newer than it.
    pub async fn settle(&self, mutation: &PendingMutation, written_at: DateTime<Utc>) -> Result<bool> {
        if self.acknowledge(mutation).await? {
            return Ok(true);
        }
        self.run(|pool| async move {
            let mut tx = pool.begin().await?;
            let current = fetch_one(&mut *tx, &mutation.collection, &mutation.id).await?;
            if current.is_some_and(|m| m.enqueued_at < written_at) {
                sqlx::query(
                    "update pending_mutations set enqueued_at = ?3 where collection = ?1 and id = ?2",
                )
                .bind(&mutation.collection)
                .bind(&mutation.id)
                .bind(written_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(false)
    }

    /// Remember the remote key assigned to a record so retries target the same document.
    pub async fn record_remote_ref(&self, mutation: &PendingMutation, remote_ref: &str) -> Result<()> {
        self.run(|pool| async move {
            sqlx::query("update pending_mutations set remote_ref = ?3 where collection = ?1 and id = ?2")
                .bind(&mutation.collection)
                .bind(&mutation.id)
                .bind(remote_ref)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Count a failed remote attempt against the entry.
    pub async fn mark_failed(&self, mutation: &PendingMutation, error: &str) -> Result<()> {
        let now = Utc::now();
        self.run(|pool| async move {
            sqlx::query(
                "update pending_mutations set retry_count = retry_count + 1, last_retry_at = ?3, \
                 last_error = ?4 where collection = ?1 and id = ?2",
            )
            .bind(&mutation.collection)
            .bind(&mutation.id)
            .bind(now)
            .bind(error)
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Drop every pending entry. Recovery tooling only.
    pub async fn clear(&self) -> Result<u64> {
        let removed = self
            .run(|pool| async move {
                let res = sqlx::query("delete from pending_mutations").execute(&pool).await?;
                Ok(res.rows_affected())
            })
            .await?;
        warn!(removed, "local queue cleared");
        metrics::set_pending(0);
        self.inner.notifier.queue_changed(0);
        Ok(removed)
    }
}

async fn count(pool: &SqlitePool) -> std::result::Result<u64, sqlx::Error> {
    let n: i64 = sqlx::query_scalar("select count(*) from pending_mutations")
        .fetch_one(pool)
        .await?;
    Ok(n as u64)
}

async fn fetch_one(
    conn: impl sqlx::SqliteExecutor<'_>,
    collection: &str,
    id: &str,
) -> std::result::Result<Option<PendingMutation>, sqlx::Error> {
    let row: Option<MutationRow> =
        sqlx::query_as(&format!("{SELECT_COLUMNS} where collection = ?1 and id = ?2"))
            .bind(collection)
            .bind(id)
            .fetch_optional(conn)
            .await?;
    row.map(PendingMutation::try_from).transpose()
}

async fn put_tx(
    pool: &SqlitePool,
    incoming: PendingMutation,
    queue: &LocalQueue,
) -> std::result::Result<(Option<PendingMutation>, u64, bool), sqlx::Error> {
    let mut tx = pool.begin().await?;
    let existing = fetch_one(&mut *tx, &incoming.collection, &incoming.id).await?;
    let coalesced = existing.is_some();

    // Checked inside the transaction; a drain cannot re-read this entry until commit.
    let folded = if queue.is_applying(&incoming.collection, &incoming.id) {
        coalesce_in_flight(existing.as_ref(), incoming)
    } else {
        coalesce(existing.as_ref(), incoming)
    };
    let stored = match folded {
        Coalesced::Discard => {
            sqlx::query("delete from pending_mutations where collection = ?1 and id = ?2")
                .bind(existing.as_ref().map(|m| m.collection.as_str()))
                .bind(existing.as_ref().map(|m| m.id.as_str()))
                .execute(&mut *tx)
                .await?;
            None
        }
        Coalesced::Keep(mut m) => {
            let payload = m.payload.as_ref().map(Value::to_string);
            if coalesced {
                sqlx::query(
                    "update pending_mutations set action = ?3, payload = ?4, enqueued_at = ?5, \
                     revision = ?6, remote_ref = ?7 where collection = ?1 and id = ?2",
                )
                .bind(&m.collection)
                .bind(&m.id)
                .bind(m.action.as_str())
                .bind(payload)
                .bind(m.enqueued_at)
                .bind(m.revision)
                .bind(&m.remote_ref)
                .execute(&mut *tx)
                .await?;
            } else {
                let seq: i64 = sqlx::query_scalar(
                    "insert into pending_mutations (collection, id, action, payload, enqueued_at, \
                     revision, retry_count, remote_ref) values (?1, ?2, ?3, ?4, ?5, 0, 0, ?6) \
                     returning seq",
                )
                .bind(&m.collection)
                .bind(&m.id)
                .bind(m.action.as_str())
                .bind(payload)
                .bind(m.enqueued_at)
                .bind(&m.remote_ref)
                .fetch_one(&mut *tx)
                .await?;
                m.seq = seq;
                m.revision = 0;
                m.retry_count = 0;
                m.last_retry_at = None;
                m.last_error = None;
            }
            Some(m)
        }
    };

    let pending: i64 = sqlx::query_scalar("select count(*) from pending_mutations")
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok((stored, pending as u64, coalesced))
}
