use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::backend::{ColumnDef, Value};
use crate::context::QueryContext;
use crate::error::ClientError;

/// One result row. A row carrying an error has no values and is the last row
/// of its stream.
#[derive(Debug, Clone)]
pub struct Row {
    pub values: Vec<Value>,
    pub error: Option<Arc<ClientError>>,
}

impl Row {
    pub(crate) fn ok(values: Vec<Value>) -> Self {
        Self {
            values,
            error: None,
        }
    }

    pub(crate) fn failed(error: ClientError) -> Self {
        Self {
            values: Vec::new(),
            error: Some(Arc::new(error)),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Rows of one query, in backend order, one row in flight at a time.
///
/// The producer holds the session's connection until this stream ends. Read
/// it to the end, or call [`RowStream::close`] (or drop it) to stop the query
/// early; a stream left open and unread keeps the connection leased.
#[derive(Debug)]
pub struct RowStream {
    rx: mpsc::Receiver<Row>,
}

impl RowStream {
    pub(crate) fn new(rx: mpsc::Receiver<Row>) -> Self {
        Self { rx }
    }

    pub(crate) fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<Row> {
        self.rx.recv().await
    }

    /// Stop the producer; rows already sent are discarded.
    pub fn close(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
    }
}

impl Stream for RowStream {
    type Item = Row;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Row>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimingMetadata {
    pub hydrate_calls: i64,
    pub cached_rows_fetched: i64,
    pub rows_fetched: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimingResult {
    pub duration: Duration,
    pub metadata: Option<TimingMetadata>,
}

/// Yields at most one [`TimingResult`], after the row stream has finished.
#[derive(Debug)]
pub struct TimingReceiver {
    rx: Option<oneshot::Receiver<TimingResult>>,
}

impl TimingReceiver {
    pub(crate) fn new(rx: oneshot::Receiver<TimingResult>) -> Self {
        Self { rx: Some(rx) }
    }

    pub(crate) fn disabled() -> Self {
        Self { rx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.rx.is_some()
    }

    /// `None` when timing was disabled for this query or the producer failed.
    pub async fn recv(self) -> Option<TimingResult> {
        self.rx?.await.ok()
    }
}

/// Live handle for one query. Columns are known up front; rows arrive while
/// the backend is still producing them.
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<ColumnDef>,
    pub rows: RowStream,
    pub timing: TimingReceiver,
}

impl QueryResult {
    /// Already-closed result with no columns and no rows.
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: RowStream::closed(),
            timing: TimingReceiver::disabled(),
        }
    }

    /// Drain every row into memory.
    ///
    /// Stops early without error once `ctx` is done. The first row error
    /// becomes the overall error; the rows gathered so far are kept.
    pub async fn collect(self, ctx: &QueryContext) -> SyncResult {
        let QueryResult {
            columns,
            mut rows,
            timing,
        } = self;
        let mut collected = Vec::new();
        let mut error = None;

        while !ctx.is_done() {
            let row = tokio::select! {
                row = rows.next() => row,
                _ = ctx.done() => break,
            };
            let Some(row) = row else { break };
            if error.is_none() {
                error = row.error.clone();
            }
            collected.push(row);
        }
        rows.close();

        SyncResult {
            columns,
            rows: collected,
            error,
            timing: timing.recv().await,
        }
    }
}

/// A fully materialized [`QueryResult`].
#[derive(Debug, Default)]
pub struct SyncResult {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
    pub error: Option<Arc<ClientError>>,
    pub timing: Option<TimingResult>,
}
