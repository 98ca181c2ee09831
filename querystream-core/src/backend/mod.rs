//! Driver seam: a closed set of supported backends behind three small traits.
//!
//! The pool only knows [`Connector`], sessions and the executor only know
//! [`Connection`] and [`Cursor`]. Wire protocols live in the drivers.

mod duckdb;
mod postgres;
mod value;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

pub use self::duckdb::DuckDbConnector;
pub use self::postgres::{PgSslMode, PostgresConnector};
pub use self::value::{ColumnDef, Value};
use crate::error::{ClientError, Result};

/// Opens new backend connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Short label used in logs.
    fn kind(&self) -> &'static str;
}

/// One live backend connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Start a query. Column metadata is available on the returned cursor
    /// before any row is read.
    async fn query(&self, sql: &str, args: &[Value]) -> Result<Box<dyn Cursor>>;

    /// Run a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Trivial round-trip proving the backend can serve requests.
    async fn ping(&self) -> Result<()> {
        let mut cursor = self.query("select 1", &[]).await?;
        while let Some(row) = cursor.next_row().await {
            row?;
        }
        cursor.close().await
    }

    /// Best-effort request asking the backend to abandon the running statement.
    async fn cancel_running(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the backend exposes the internal scan-metadata table.
    fn supports_scan_metadata(&self) -> bool {
        false
    }

    /// True once the connection can no longer serve queries.
    fn is_broken(&self) -> bool {
        false
    }
}

/// Backend-side iterator over one query's rows.
#[async_trait]
pub trait Cursor: Send {
    fn columns(&self) -> &[ColumnDef];

    /// `None` once the backend has no more rows.
    async fn next_row(&mut self) -> Option<Result<Vec<Value>>>;

    /// Release backend resources, surfacing any cursor-level error.
    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    DuckDb,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => f.write_str("postgres"),
            BackendKind::DuckDb => f.write_str("duckdb"),
        }
    }
}

/// A connection string resolved once to its backend.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    raw: String,
    kind: BackendKind,
}

const DUCKDB_EXTENSIONS: [&str; 3] = [".duckdb", ".ddb", ".db"];

impl ConnectionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let kind = if trimmed.starts_with("postgres://") || trimmed.starts_with("postgresql://") {
            BackendKind::Postgres
        } else if is_key_value_dsn(trimmed) {
            BackendKind::Postgres
        } else if trimmed.starts_with("duckdb://")
            || trimmed == ":memory:"
            || DUCKDB_EXTENSIONS.iter().any(|ext| trimmed.ends_with(ext))
        {
            BackendKind::DuckDb
        } else {
            return Err(ClientError::UnsupportedConnectionString(redact(trimmed)));
        };
        Ok(Self {
            raw: trimmed.to_string(),
            kind,
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Database path for DuckDB strings; `None` means in-memory.
    pub fn duckdb_path(&self) -> Option<PathBuf> {
        let path = self.raw.strip_prefix("duckdb://").unwrap_or(&self.raw);
        if path.is_empty() || path == ":memory:" {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }

    pub fn connector(&self) -> Result<Arc<dyn Connector>> {
        match self.kind {
            BackendKind::Postgres => Ok(Arc::new(PostgresConnector::new(&self.raw)?)),
            BackendKind::DuckDb => Ok(Arc::new(DuckDbConnector::open(self.duckdb_path())?)),
        }
    }
}

impl fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionString")
            .field("kind", &self.kind)
            .field("raw", &redact(&self.raw))
            .finish()
    }
}

fn is_key_value_dsn(value: &str) -> bool {
    value
        .split_whitespace()
        .filter_map(|pair| pair.split_once('='))
        .any(|(key, _)| matches!(key, "host" | "hostaddr" | "dbname" | "user" | "port"))
}

/// Hide credentials before a connection string reaches logs or errors.
fn redact(value: &str) -> String {
    if let Some((scheme, rest)) = value.split_once("://") {
        if let Some((_, host)) = rest.rsplit_once('@') {
            return format!("{scheme}://***@{host}");
        }
        return value.to_string();
    }
    value
        .split_whitespace()
        .map(|pair| match pair.split_once('=') {
            Some(("password", _)) => "password=***".to_string(),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
