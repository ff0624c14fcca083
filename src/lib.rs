//! fieldsync: offline-first write queue and reconciliation for document-backed records.

pub mod connectivity;
pub mod documents;
mod error;
pub mod merge;
pub mod metrics;
pub mod mutation;
pub mod notify;
pub mod queue;
pub mod remote;
pub mod schema;
pub mod store;
pub mod sync;
pub mod testing;
pub mod upcasting;

pub use connectivity::{ConnectivityMonitor, NetworkStatus};
pub use documents::PgRemoteStore;
pub use error::{Error, Result, WithContext};
pub use fieldsync_derive::Upcaster;
pub use merge::{MergedView, merge_view};
pub use mutation::{Action, PendingMutation};
pub use notify::{SyncNotification, SyncReport};
pub use queue::{LocalQueue, LocalQueueOptions};
pub use remote::{RemoteDocument, RemoteError, RemoteStore};
pub use store::{Store, WriteOutcome};
pub use sync::{DrainOutcome, SyncConfig, Synchronizer};

pub mod prelude {
    pub use crate::{
        Action, ConnectivityMonitor, DrainOutcome, NetworkStatus, RemoteStore, Result, Store,
        SyncNotification, WriteOutcome,
    };
}
