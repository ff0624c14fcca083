use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::remote::RemoteStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NetworkStatus {
    Online,
    Offline,
    Unknown,
}

/// Single source of truth for whether the remote store can be reached.
///
/// Subscribers only observe real transitions; setting the current status again is a no-op.
#[derive(Clone, Debug)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<NetworkStatus>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.status() == NetworkStatus::Online
    }

    /// Record the current status. Returns true when this was a transition.
    pub fn set_status(&self, status: NetworkStatus) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        if changed {
            match status {
                NetworkStatus::Online => info!("network online"),
                NetworkStatus::Offline => warn!("network offline"),
                NetworkStatus::Unknown => {}
            }
        }
        changed
    }

    pub fn set_online(&self) -> bool {
        self.set_status(NetworkStatus::Online)
    }

    pub fn set_offline(&self) -> bool {
        self.set_status(NetworkStatus::Offline)
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }

    /// Poll `remote.ping()` every `interval` and feed the result into this monitor.
    pub fn spawn_probe(&self, remote: Arc<dyn RemoteStore>, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let status = match remote.ping().await {
                    Ok(()) => NetworkStatus::Online,
                    Err(_) => NetworkStatus::Offline,
                };
                monitor.set_status(status);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(NetworkStatus::Unknown)
    }
}
