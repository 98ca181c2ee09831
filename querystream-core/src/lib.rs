//! Client-side query execution engine.
//!
//! A [`DbClient`] owns two connection pools against one backend, leases
//! [`Session`]s from the user pool, and runs queries whose rows stream back
//! through a [`QueryResult`] while the backend is still producing them.
//! Every call takes a [`QueryContext`] for cancellation and deadlines.

pub mod backend;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod execute;
pub mod normalize;
pub mod pool;
pub mod session;
pub mod status;

pub use backend::{BackendKind, ColumnDef, Connection, ConnectionString, Connector, Cursor, Value};
pub use client::DbClient;
pub use config::{ClientConfig, LogFormat, OutputMode, PoolSettings};
pub use context::QueryContext;
pub use error::{ClientError, Result};
pub use execute::{QueryResult, Row, RowStream, SyncResult, TimingMetadata, TimingResult};
pub use session::Session;
pub use status::StatusHook;
