use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("local storage unavailable: {source}")]
    StorageUnavailable {
        #[source]
        source: sqlx::Error,
    },
    #[error("local queue is closed; call open() before reuse")]
    QueueClosed,
    #[error("remote store unreachable: {0}")]
    RemoteUnreachable(String),
    #[error("record {collection}/{id} not found in remote store")]
    RemoteNotFound { collection: String, id: String },
    #[error("{action} mutation for {collection}/{id} carries no payload")]
    MissingPayload {
        collection: String,
        id: String,
        action: crate::mutation::Action,
    },
    #[error("upcasting cycle detected for {collection} v{version}")]
    UpcastingCycle { collection: String, version: i32 },
    #[error("upcaster for {collection} v{version} failed: {reason}")]
    Upcast {
        collection: String,
        version: i32,
        reason: String,
    },
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build the not-found error for a record addressed by its local id.
    pub fn remote_not_found(collection: &str, id: &str) -> Self {
        Error::RemoteNotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// True for failures that leave a direct write eligible for the offline queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RemoteUnreachable(_))
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotFound { collection, key } => Error::RemoteNotFound {
                collection,
                id: key,
            },
            RemoteError::Unavailable(msg) => Error::RemoteUnreachable(msg),
        }
    }
}

pub trait WithContext<T> {
    fn context(self, msg: impl Into<String>) -> Result<T>;
}

impl<T> WithContext<T> for Result<T> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| Error::Context {
            context: msg.into(),
            source: Box::new(e),
        })
    }
}
