use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure reported by a remote store. Only "not found" and "anything else" are told apart.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote document {collection}/{key} not found")]
    NotFound { collection: String, key: String },
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
}

impl RemoteError {
    pub fn not_found(collection: &str, key: &str) -> Self {
        RemoteError::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }
}

impl From<sqlx::Error> for RemoteError {
    fn from(err: sqlx::Error) -> Self {
        RemoteError::Unavailable(err.to_string())
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// One document as held by the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub remote_key: String,
    /// The domain record id the document was written for.
    pub local_id: String,
    pub body: Value,
    /// Freshness marker used by the merge tie-break; `None` never beats a local edit.
    pub updated_at: Option<DateTime<Utc>>,
}

/// The document database of record, reduced to what the synchronizer needs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Write a new document and return the key the store assigned to it.
    async fn create(&self, collection: &str, local_id: &str, data: &Value) -> RemoteResult<String>;

    async fn update(&self, collection: &str, remote_key: &str, data: &Value) -> RemoteResult<()>;

    async fn delete(&self, collection: &str, remote_key: &str) -> RemoteResult<()>;

    async fn find_by_local_id(&self, collection: &str, local_id: &str)
    -> RemoteResult<Option<String>>;

    async fn list(&self, collection: &str) -> RemoteResult<Vec<RemoteDocument>>;

    /// Cheap reachability check used by the connectivity probe.
    async fn ping(&self) -> RemoteResult<()> {
        Ok(())
    }
}
