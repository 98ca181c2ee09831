//! Embedded-file dialect: DuckDB.
//!
//! DuckDB refuses to open the same file twice in one process, so the connector
//! keeps a single root handle and hands out `try_clone()`d connections. The
//! driver is synchronous; each query runs on a blocking thread and hands rows
//! over a channel of capacity one.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::DateTime;
use duckdb::types::{TimeUnit, Value as DuckValue};
use duckdb::{params_from_iter, Connection as DuckConnection};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{ColumnDef, Connection, Connector, Cursor, Value};
use crate::error::{ClientError, Result};

pub struct DuckDbConnector {
    root: Arc<Mutex<DuckConnection>>,
}

impl DuckDbConnector {
    /// Open `path`, or an in-memory database when `None`.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let root = match &path {
            Some(path) => DuckConnection::open(path)?,
            None => DuckConnection::open_in_memory()?,
        };
        info!(path = ?path, "opened DuckDB database");
        Ok(Self {
            root: Arc::new(Mutex::new(root)),
        })
    }
}

#[async_trait]
impl Connector for DuckDbConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let root = Arc::clone(&self.root);
        let conn = tokio::task::spawn_blocking(move || {
            let guard = root
                .lock()
                .map_err(|_| ClientError::Internal("duckdb root mutex poisoned".to_string()))?;
            Ok::<_, ClientError>(guard.try_clone()?)
        })
        .await
        .map_err(|e| ClientError::Internal(format!("duckdb connect task failed: {e}")))??;
        Ok(Box::new(DuckDbConnection {
            conn: Arc::new(Mutex::new(conn)),
        }))
    }

    fn kind(&self) -> &'static str {
        "duckdb"
    }
}

/// The Mutex is needed because duckdb::Connection is not Sync.
struct DuckDbConnection {
    conn: Arc<Mutex<DuckConnection>>,
}

fn with_conn<T>(
    conn: &Mutex<DuckConnection>,
    f: impl FnOnce(&mut DuckConnection) -> Result<T>,
) -> Result<T> {
    let mut guard = conn
        .lock()
        .map_err(|_| ClientError::Internal("duckdb connection mutex poisoned".to_string()))?;
    f(&mut guard)
}

#[async_trait]
impl Connection for DuckDbConnection {
    async fn query(&self, sql: &str, args: &[Value]) -> Result<Box<dyn Cursor>> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        let params: Vec<DuckValue> = args.iter().map(to_duck_value).collect();
        let (columns_tx, columns_rx) = oneshot::channel();
        let (rows_tx, rows_rx) = mpsc::channel(1);

        let task = tokio::task::spawn_blocking(move || {
            let mut columns_tx = Some(columns_tx);
            match stream_rows(&conn, &sql, params, &mut columns_tx, &rows_tx) {
                Ok(()) => Ok(()),
                Err(err) => match columns_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(err));
                        Ok(())
                    }
                    None => Err(err),
                },
            }
        });

        let columns = columns_rx.await.map_err(|_| {
            ClientError::Internal("duckdb query task ended before producing columns".to_string())
        })??;
        Ok(Box::new(DuckDbCursor {
            columns,
            rows: rows_rx,
            task: Some(task),
        }))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let sql = sql.to_string();
        tokio::task::spawn_blocking(move || {
            with_conn(&conn, |c| {
                c.execute_batch(&sql)?;
                Ok(())
            })
        })
        .await
        .map_err(|e| ClientError::Internal(format!("duckdb execute task failed: {e}")))?
    }
}

type RowSender = mpsc::Sender<Result<Vec<Value>>>;

fn stream_rows(
    conn: &Mutex<DuckConnection>,
    sql: &str,
    params: Vec<DuckValue>,
    columns_tx: &mut Option<oneshot::Sender<Result<Vec<ColumnDef>>>>,
    rows_tx: &RowSender,
) -> Result<()> {
    with_conn(conn, |c| {
        let mut stmt = c.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let columns: Vec<ColumnDef> = match rows.as_ref() {
            Some(stmt) => stmt
                .column_names()
                .into_iter()
                .enumerate()
                .map(|(idx, name)| ColumnDef::new(name, format!("{:?}", stmt.column_type(idx))))
                .collect(),
            None => Vec::new(),
        };
        let width = columns.len();
        if let Some(tx) = columns_tx.take() {
            if tx.send(Ok(columns)).is_err() {
                return Ok(());
            }
        }

        while let Some(row) = rows.next()? {
            let values: std::result::Result<Vec<Value>, duckdb::Error> = (0..width)
                .map(|idx| row.get::<_, DuckValue>(idx).map(from_duck_value))
                .collect();
            match values {
                Ok(values) => {
                    if rows_tx.blocking_send(Ok(values)).is_err() {
                        debug!("duckdb row receiver closed, stopping");
                        return Ok(());
                    }
                }
                Err(err) => {
                    let _ = rows_tx.blocking_send(Err(err.into()));
                    return Ok(());
                }
            }
        }
        Ok(())
    })
}

struct DuckDbCursor {
    columns: Vec<ColumnDef>,
    rows: mpsc::Receiver<Result<Vec<Value>>>,
    task: Option<JoinHandle<Result<()>>>,
}

#[async_trait]
impl Cursor for DuckDbCursor {
    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    async fn next_row(&mut self) -> Option<Result<Vec<Value>>> {
        self.rows.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.close();
        while self.rows.try_recv().is_ok() {}
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| ClientError::Internal(format!("duckdb query task failed: {e}")))?,
            None => Ok(()),
        }
    }
}

fn to_duck_value(value: &Value) -> DuckValue {
    match value {
        Value::Null => DuckValue::Null,
        Value::Bool(v) => DuckValue::Boolean(*v),
        Value::Int(v) => DuckValue::BigInt(*v),
        Value::Float(v) => DuckValue::Double(*v),
        Value::Text(v) => DuckValue::Text(v.clone()),
        Value::Bytes(v) => DuckValue::Blob(v.clone()),
        Value::Timestamp(v) => DuckValue::Timestamp(TimeUnit::Microsecond, v.timestamp_micros()),
        Value::Json(v) => DuckValue::Text(v.to_string()),
    }
}

fn from_duck_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(v) => Value::Bool(v),
        DuckValue::TinyInt(v) => Value::Int(v.into()),
        DuckValue::SmallInt(v) => Value::Int(v.into()),
        DuckValue::Int(v) => Value::Int(v.into()),
        DuckValue::BigInt(v) => Value::Int(v),
        DuckValue::UTinyInt(v) => Value::Int(v.into()),
        DuckValue::USmallInt(v) => Value::Int(v.into()),
        DuckValue::UInt(v) => Value::Int(v.into()),
        DuckValue::UBigInt(v) => i64::try_from(v)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(v.to_string())),
        DuckValue::HugeInt(v) => i64::try_from(v)
            .map(Value::Int)
            .unwrap_or_else(|_| Value::Text(v.to_string())),
        DuckValue::Float(v) => Value::Float(v.into()),
        DuckValue::Double(v) => Value::Float(v),
        DuckValue::Decimal(v) => Value::Text(v.to_string()),
        DuckValue::Text(v) => Value::Text(v),
        DuckValue::Blob(v) => Value::Bytes(v),
        DuckValue::Timestamp(unit, v) => DateTime::from_timestamp_micros(unit.to_micros(v))
            .map(Value::Timestamp)
            .unwrap_or(Value::Null),
        other => Value::Text(format!("{other:?}")),
    }
}
