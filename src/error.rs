use thiserror::Error;

use crate::client::{ClientError, StatusCode};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("optimistic concurrency failure on document `{id}`")]
    ConcurrencyFailure { id: String },
    #[error("document `{id}` already exists")]
    AlreadyExists { id: String },
    #[error("store has been disposed")]
    Disposed,
    #[error("query error: {context}")]
    QueryFailure { query: String, context: String },
    #[error("store failure ({status}): {message}")]
    StoreFailure { status: StatusCode, message: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn is_concurrency_failure(&self) -> bool {
        match self {
            Error::ConcurrencyFailure { .. } => true,
            Error::Context { source, .. } => source.is_concurrency_failure(),
            _ => false,
        }
    }

    /// Transient transport faults. Concurrency failures are never retryable
    /// here: the caller has to refetch the aggregate first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::StoreFailure { status, .. } => status.is_transient(),
            Error::Context { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn query(query: &str, context: impl Into<String>) -> Self {
        Error::QueryFailure {
            query: query.to_string(),
            context: context.into(),
        }
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        Error::StoreFailure {
            status: err.status,
            message: err.message,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

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
