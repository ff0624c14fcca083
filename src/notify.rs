use serde::Serialize;
use tokio::sync::broadcast;

/// Counts produced by one drain pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub success_count: usize,
    pub failure_count: usize,
    /// Entries left untouched because their retry backoff had not elapsed.
    pub skipped_count: usize,
    /// Updates abandoned because their target no longer exists remotely.
    pub dropped_count: usize,
}

impl SyncReport {
    pub fn attempted(&self) -> usize {
        self.success_count + self.failure_count + self.dropped_count
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncNotification {
    /// Emitted after every queue write or removal.
    QueueChanged { pending: usize },
    /// Emitted after every drain pass.
    SyncComplete(SyncReport),
}

/// Fan-out channel for queue and sync notifications.
///
/// Sending never blocks and never fails the caller; with no subscribers the
/// notification is simply dropped.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<SyncNotification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.tx.subscribe()
    }

    pub(crate) fn queue_changed(&self, pending: usize) {
        let _ = self.tx.send(SyncNotification::QueueChanged { pending });
    }

    pub(crate) fn sync_complete(&self, report: SyncReport) {
        let _ = self.tx.send(SyncNotification::SyncComplete(report));
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
