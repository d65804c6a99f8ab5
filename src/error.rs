use std::sync::Arc;

use thiserror::Error;

use crate::shard::DatabaseServer;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Boxed error produced by a database provider or a record source.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("no database provider registered for server kind '{kind}'")]
    MissingProvider { kind: String },

    #[error("no entity metadata registered for '{0}'")]
    MissingMetadata(String),

    #[error("entity '{0}' declares no primary key fields")]
    MissingPrimaryKey(String),

    #[error("no database server resolved for entity '{0}'")]
    NoServer(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("command aborted: {0}")]
    Aborted(String),

    #[error("database provider failed on {server}: {source}")]
    Provider {
        server: DatabaseServer,
        #[source]
        source: BoxError,
    },

    #[error("record source failed: {0}")]
    RecordSource(#[source] BoxError),

    #[error("record conversion failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("shard task failed: {0}")]
    ShardTask(#[from] tokio::task::JoinError),

    #[error("query for '{0}' is not an aggregate query")]
    NotAggregate(String),

    #[error("query for '{0}' has no paging parameters")]
    NotPaged(String),

    #[error("command for '{0}' carries no query")]
    NotQuery(String),
}

impl Error {
    pub fn provider<E>(server: &DatabaseServer, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Provider {
            server: server.clone(),
            source: source.into(),
        }
    }

    /// Configuration errors are never retried or swallowed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingProvider { .. }
                | Self::MissingMetadata(_)
                | Self::MissingPrimaryKey(_)
                | Self::NoServer(_)
                | Self::InvalidSettings(_)
        )
    }
}

impl From<garde::Report> for Error {
    fn from(report: garde::Report) -> Self {
        Self::InvalidSettings(report.to_string())
    }
}

/// Failure reported by a cache backend. Never leaves the policy boundary.
#[derive(Debug, Clone, Error)]
#[error("cache backend {op} failed: {message}")]
pub struct StoreError {
    pub op:      &'static str,
    pub message: Arc<str>,
}

impl StoreError {
    pub fn new<S: AsRef<str>>(op: &'static str, message: S) -> Self {
        Self {
            op,
            message: Arc::from(message.as_ref()),
        }
    }
}
