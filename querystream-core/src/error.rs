use thiserror::Error;

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unsupported connection string: {0}")]
    UnsupportedConnectionString(String),
    #[error("database not ready after {timeout_secs}s ({attempts} attempts): {source}")]
    PoolStartupTimeout {
        timeout_secs: u64,
        attempts: u32,
        #[source]
        source: Box<ClientError>,
    },
    #[error("failed to acquire session: {0}")]
    SessionAcquisition(#[source] Box<ClientError>),
    #[error("invalid session: {0}")]
    InvalidSession(&'static str),
    #[error("session is already executing a query")]
    SessionBusy,
    #[error("query timeout exceeded ({0}s)")]
    QueryTimeout(u64),
    #[error("execution cancelled")]
    QueryCancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("{0}")]
    Backend(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClientError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// Wrapped error for the kinds that carry one.
    pub fn inner(&self) -> Option<&ClientError> {
        match self {
            Self::PoolStartupTimeout { source, .. } => Some(source),
            Self::SessionAcquisition(source) => Some(source),
            _ => None,
        }
    }
}
