use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::{
    Result,
    connectivity::{ConnectivityMonitor, NetworkStatus},
    metrics,
    mutation::{Action, PendingMutation},
    notify::{Notifier, SyncReport},
    queue::LocalQueue,
    remote::{RemoteError, RemoteResult, RemoteStore},
};

/// Exponential delay between attempts on the same failed entry.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay owed after `retry_count` failed attempts.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(retry_count - 1);
        self.base.saturating_mul(factor).min(self.max)
    }

    fn is_due(&self, mutation: &PendingMutation) -> bool {
        let Some(last) = mutation.last_retry_at else {
            return true;
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
        elapsed >= self.delay_for(mutation.retry_count)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SyncConfig {
    /// When set, entries that failed recently are skipped until their delay elapses.
    pub backoff: Option<BackoffPolicy>,
    /// Per remote call; an elapsed timeout counts as an ordinary failure.
    pub remote_timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(SyncReport),
    /// Another drain held the guard; nothing was attempted.
    AlreadyRunning,
}

impl DrainOutcome {
    pub fn report(&self) -> Option<SyncReport> {
        match self {
            DrainOutcome::Completed(report) => Some(*report),
            DrainOutcome::AlreadyRunning => None,
        }
    }
}

enum ItemOutcome {
    Applied,
    Dropped,
    Failed(String),
}

/// Replays queued mutations against the remote store.
pub struct Synchronizer {
    queue: LocalQueue,
    remote: Arc<dyn RemoteStore>,
    config: SyncConfig,
    notifier: Notifier,
    guard: Mutex<()>,
}

impl Synchronizer {
    pub fn new(queue: LocalQueue, remote: Arc<dyn RemoteStore>, config: SyncConfig) -> Self {
        let notifier = queue.notifier().clone();
        Self {
            queue,
            remote,
            config,
            notifier,
            guard: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &LocalQueue {
        &self.queue
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_draining(&self) -> bool {
        self.guard.try_lock().is_err()
    }

    /// Apply every pending mutation once, oldest first.
    ///
    /// Per-item failures are counted in the report and never returned; `Err` means the
    /// local queue itself could not be read or updated.
    #[instrument(skip_all, fields(timeout = ?self.config.remote_timeout))]
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let report = {
            let Ok(_running) = self.guard.try_lock() else {
                debug!("drain already in progress; trigger dropped");
                metrics::record_drain_rejected();
                return Ok(DrainOutcome::AlreadyRunning);
            };
            self.run_pass().await?
        };

        metrics::record_drain(
            report.success_count as u64,
            report.failure_count as u64,
            report.skipped_count as u64,
            report.dropped_count as u64,
        );
        if report != SyncReport::default() {
            info!(
                success = report.success_count,
                failed = report.failure_count,
                skipped = report.skipped_count,
                dropped = report.dropped_count,
                "drain complete"
            );
        }
        self.notifier.sync_complete(report);
        Ok(DrainOutcome::Completed(report))
    }

    async fn run_pass(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let pending = self.queue.get_all().await?;
        if pending.is_empty() {
            return Ok(report);
        }

        for queued in pending {
            // Claim first, then re-read: a write that coalesced in the meantime is
            // sent as it now stands, and one arriving from here on sees the claim.
            let _claim = self.queue.claim(&queued.collection, &queued.id);
            let Some(mutation) = self.queue.get(&queued.collection, &queued.id).await? else {
                continue;
            };

            if let Some(policy) = &self.config.backoff {
                if !policy.is_due(&mutation) {
                    debug!(
                        collection = %mutation.collection,
                        id = %mutation.id,
                        retry_count = mutation.retry_count,
                        "entry still backing off"
                    );
                    report.skipped_count += 1;
                    continue;
                }
            }

            match self.apply(&mutation).await? {
                ItemOutcome::Applied => report.success_count += 1,
                ItemOutcome::Dropped => report.dropped_count += 1,
                ItemOutcome::Failed(reason) => {
                    warn!(
                        collection = %mutation.collection,
                        id = %mutation.id,
                        action = %mutation.action,
                        retry_count = mutation.retry_count + 1,
                        error = %reason,
                        "mutation failed; kept for next drain"
                    );
                    self.queue.mark_failed(&mutation, &reason).await?;
                    report.failure_count += 1;
                }
            }
        }
        Ok(report)
    }

    async fn apply(&self, m: &PendingMutation) -> Result<ItemOutcome> {
        match m.action {
            Action::Create => self.apply_create(m).await,
            Action::Update => self.apply_update(m).await,
            Action::Delete => self.apply_delete(m).await,
        }
    }

    async fn apply_create(&self, m: &PendingMutation) -> Result<ItemOutcome> {
        let Some(payload) = &m.payload else {
            return self.abandon(m, "create carries no payload").await;
        };

        let existing = match self.resolve_key(m).await {
            Ok(key) => key,
            Err(err) => return Ok(ItemOutcome::Failed(err.to_string())),
        };

        // A previous attempt reached the remote: finish it as an update of that document.
        if let Some(key) = existing {
            match self.call(self.remote.update(&m.collection, &key, payload)).await {
                Ok(()) => {
                    self.queue.record_remote_ref(m, &key).await?;
                    self.queue.settle(m, Utc::now()).await?;
                    return Ok(ItemOutcome::Applied);
                }
                Err(RemoteError::NotFound { .. }) => {
                    debug!(collection = %m.collection, id = %m.id, "remote copy vanished; recreating");
                }
                Err(err) => return Ok(ItemOutcome::Failed(err.to_string())),
            }
        }

        match self.call(self.remote.create(&m.collection, &m.id, payload)).await {
            Ok(key) => {
                self.queue.record_remote_ref(m, &key).await?;
                self.queue.settle(m, Utc::now()).await?;
                Ok(ItemOutcome::Applied)
            }
            Err(err) => Ok(ItemOutcome::Failed(err.to_string())),
        }
    }

    async fn apply_update(&self, m: &PendingMutation) -> Result<ItemOutcome> {
        let Some(payload) = &m.payload else {
            return self.abandon(m, "update carries no payload").await;
        };

        let key = match self.resolve_key(m).await {
            Ok(Some(key)) => key,
            Ok(None) => return self.abandon(m, "target not found in remote store").await,
            Err(err) => return Ok(ItemOutcome::Failed(err.to_string())),
        };

        match self.call(self.remote.update(&m.collection, &key, payload)).await {
            Ok(()) => {
                self.queue.settle(m, Utc::now()).await?;
                Ok(ItemOutcome::Applied)
            }
            Err(RemoteError::NotFound { .. }) => {
                self.abandon(m, "target not found in remote store").await
            }
            Err(err) => Ok(ItemOutcome::Failed(err.to_string())),
        }
    }

    async fn apply_delete(&self, m: &PendingMutation) -> Result<ItemOutcome> {
        let key = match self.resolve_key(m).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                debug!(collection = %m.collection, id = %m.id, "delete target already absent");
                self.queue.acknowledge(m).await?;
                return Ok(ItemOutcome::Applied);
            }
            Err(err) => return Ok(ItemOutcome::Failed(err.to_string())),
        };

        match self.call(self.remote.delete(&m.collection, &key)).await {
            Ok(()) | Err(RemoteError::NotFound { .. }) => {
                self.queue.acknowledge(m).await?;
                Ok(ItemOutcome::Applied)
            }
            Err(err) => Ok(ItemOutcome::Failed(err.to_string())),
        }
    }

    async fn resolve_key(&self, m: &PendingMutation) -> RemoteResult<Option<String>> {
        if let Some(key) = &m.remote_ref {
            return Ok(Some(key.clone()));
        }
        self.call(self.remote.find_by_local_id(&m.collection, &m.id))
            .await
    }

    async fn abandon(&self, m: &PendingMutation, reason: &str) -> Result<ItemOutcome> {
        warn!(
            collection = %m.collection,
            id = %m.id,
            action = %m.action,
            reason,
            "mutation abandoned"
        );
        self.queue.acknowledge(m).await?;
        Ok(ItemOutcome::Dropped)
    }

    async fn call<T>(&self, fut: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        with_timeout(self.config.remote_timeout, fut).await
    }

    /// Start one drain on every transition to online. Triggers that arrive while a
    /// drain is running are dropped by [`Synchronizer::drain`] itself.
    pub fn spawn_auto_sync(self: Arc<Self>, monitor: &ConnectivityMonitor) -> JoinHandle<()> {
        let mut status = monitor.subscribe();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if *status.borrow_and_update() != NetworkStatus::Online {
                    continue;
                }
                let sync = Arc::clone(&self);
                tokio::spawn(async move {
                    if let Err(err) = sync.drain().await {
                        warn!(error = %err, "automatic drain failed");
                    }
                });
            }
        })
    }
}

/// Bound a remote call; an elapsed limit surfaces as `Unavailable`.
pub(crate) async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = RemoteResult<T>>,
) -> RemoteResult<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| RemoteError::Unavailable(format!("timed out after {limit:?}")))?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(500),
        };
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(60), Duration::from_millis(500));
    }

    #[test]
    fn fresh_entries_are_always_due() {
        let policy = BackoffPolicy::default();
        let m = PendingMutation::delete("faults", "f1");
        assert!(policy.is_due(&m));
    }
}
