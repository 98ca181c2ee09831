#![allow(dead_code)]

//! Scriptable in-memory backend for driving the executor in tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use querystream_core::backend::{ColumnDef, Connection, Connector, Cursor, Value};
use querystream_core::config::ClientConfig;
use querystream_core::{ClientError, DbClient, QueryContext, Result};

/// What the next user query does.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Vec<Value>>,
    pub dispatch_delay: Duration,
    pub row_delay: Duration,
    /// Index of the row whose read fails.
    pub row_error_at: Option<usize>,
    pub dispatch_error: Option<String>,
    pub close_error: Option<String>,
}

impl Script {
    pub fn numbers(count: i64) -> Self {
        Self {
            columns: vec![ColumnDef::new("n", "INT8")],
            rows: (0..count).map(|n| vec![Value::Int(n)]).collect(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct FakeBackend {
    script: Mutex<Script>,
    /// `None` makes the scan-metadata query fail.
    scan_rows: Mutex<Option<Vec<Vec<Value>>>>,
    scan_max_id: Mutex<Option<i64>>,
    scan_supported: AtomicBool,
    hang_priming: AtomicBool,
    hang_scan_fetch: AtomicBool,
    failures_before_ready: AtomicU32,
    failed_connects: AtomicU32,
    connects: AtomicU32,
    cursor_closes: AtomicU32,
    cancels: AtomicU32,
    fail_execute: Mutex<Option<String>>,
    log: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Script) -> Arc<Self> {
        let backend = Self::new();
        backend.set_script(script);
        backend
    }

    pub fn set_script(&self, script: Script) {
        *lock(&self.script) = script;
    }

    pub fn fail_connects(&self, count: u32) {
        self.failures_before_ready.store(count, Ordering::SeqCst);
    }

    pub fn fail_execute(&self, sql: &str) {
        *lock(&self.fail_execute) = Some(sql.to_string());
    }

    pub fn support_scan_metadata(&self, max_id: Option<i64>, rows: Option<Vec<Vec<Value>>>) {
        self.scan_supported.store(true, Ordering::SeqCst);
        *lock(&self.scan_max_id) = max_id;
        *lock(&self.scan_rows) = rows;
    }

    /// The `select max(id)` priming query never answers.
    pub fn hang_scan_priming(&self) {
        self.scan_supported.store(true, Ordering::SeqCst);
        self.hang_priming.store(true, Ordering::SeqCst);
    }

    /// The per-query scan-metadata fetch never answers.
    pub fn hang_scan_fetch(&self) {
        self.scan_supported.store(true, Ordering::SeqCst);
        self.hang_scan_fetch.store(true, Ordering::SeqCst);
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            backend: Arc::clone(self),
        })
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn failed_connects(&self) -> u32 {
        self.failed_connects.load(Ordering::SeqCst)
    }

    pub fn cursor_closes(&self) -> u32 {
        self.cursor_closes.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> u32 {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Every statement seen, excluding pings.
    pub fn log(&self) -> Vec<String> {
        lock(&self.log).clone()
    }

    fn record(&self, sql: &str) {
        lock(&self.log).push(sql.to_string());
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct FakeConnector {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let remaining = self.backend.failures_before_ready.load(Ordering::SeqCst);
        if remaining > 0 {
            self.backend
                .failures_before_ready
                .store(remaining - 1, Ordering::SeqCst);
            self.backend.failed_connects.fetch_add(1, Ordering::SeqCst);
            return Err(ClientError::backend("connection refused"));
        }
        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            backend: Arc::clone(&self.backend),
        }))
    }

    fn kind(&self) -> &'static str {
        "fake"
    }
}

struct FakeConnection {
    backend: Arc<FakeBackend>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn query(&self, sql: &str, _args: &[Value]) -> Result<Box<dyn Cursor>> {
        self.backend.record(sql);

        if sql.starts_with("select max(id)") {
            if self.backend.hang_priming.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let max_id = *lock(&self.backend.scan_max_id);
            return Ok(FakeCursor::boxed(
                &self.backend,
                vec![ColumnDef::new("max", "INT8")],
                vec![vec![max_id.map_or(Value::Null, Value::Int)]],
            ));
        }
        if sql.contains("scan_metadata") {
            if self.backend.hang_scan_fetch.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let rows = lock(&self.backend.scan_rows).clone();
            return match rows {
                Some(rows) => Ok(FakeCursor::boxed(
                    &self.backend,
                    ["id", "rows_fetched", "cache_hit", "hydrate_calls"]
                        .iter()
                        .map(|name| ColumnDef::new(*name, "INT8"))
                        .collect(),
                    rows,
                )),
                None => Err(ClientError::backend(
                    "ERROR: relation \"scan_metadata\" does not exist",
                )),
            };
        }

        let script = lock(&self.backend.script).clone();
        if !script.dispatch_delay.is_zero() {
            tokio::time::sleep(script.dispatch_delay).await;
        }
        if let Some(message) = script.dispatch_error {
            return Err(ClientError::backend(message));
        }
        Ok(Box::new(FakeCursor {
            backend: Arc::clone(&self.backend),
            columns: script.columns,
            rows: script.rows.into(),
            row_delay: script.row_delay,
            row_error_at: script.row_error_at,
            close_error: script.close_error,
            read: 0,
        }))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.backend.record(sql);
        if lock(&self.backend.fail_execute).as_deref() == Some(sql) {
            return Err(ClientError::backend(format!("ERROR: cannot run {sql}")));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn cancel_running(&self) -> Result<()> {
        self.backend.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_scan_metadata(&self) -> bool {
        self.backend.scan_supported.load(Ordering::SeqCst)
    }
}

struct FakeCursor {
    backend: Arc<FakeBackend>,
    columns: Vec<ColumnDef>,
    rows: VecDeque<Vec<Value>>,
    row_delay: Duration,
    row_error_at: Option<usize>,
    close_error: Option<String>,
    read: usize,
}

impl FakeCursor {
    fn boxed(
        backend: &Arc<FakeBackend>,
        columns: Vec<ColumnDef>,
        rows: Vec<Vec<Value>>,
    ) -> Box<dyn Cursor> {
        Box::new(Self {
            backend: Arc::clone(backend),
            columns,
            rows: rows.into(),
            row_delay: Duration::ZERO,
            row_error_at: None,
            close_error: None,
            read: 0,
        })
    }
}

#[async_trait]
impl Cursor for FakeCursor {
    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    async fn next_row(&mut self) -> Option<Result<Vec<Value>>> {
        if !self.row_delay.is_zero() {
            tokio::time::sleep(self.row_delay).await;
        }
        if self.row_error_at == Some(self.read) {
            self.read += 1;
            return Some(Err(ClientError::backend("row read failed")));
        }
        let row = self.rows.pop_front()?;
        self.read += 1;
        Some(Ok(row))
    }

    async fn close(&mut self) -> Result<()> {
        self.backend.cursor_closes.fetch_add(1, Ordering::SeqCst);
        match self.close_error.take() {
            Some(message) => Err(ClientError::backend(message)),
            None => Ok(()),
        }
    }
}

pub fn config() -> ClientConfig {
    ClientConfig {
        connection_string: "fake".to_string(),
        max_db_connections: 2,
        ..ClientConfig::default()
    }
}

pub async fn client(backend: &Arc<FakeBackend>, config: ClientConfig) -> anyhow::Result<DbClient> {
    Ok(DbClient::with_connector(&QueryContext::new(), backend.connector(), &config).await?)
}

/// Poll `check` until it holds, giving background teardown a chance to run.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
