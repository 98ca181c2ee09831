//! Query execution: dispatch against a session, then stream rows back while
//! the backend is still producing them.

mod result;
mod streamer;
mod timing;

pub use result::{
    QueryResult, Row, RowStream, SyncResult, TimingMetadata, TimingReceiver, TimingResult,
};
pub use timing::{TimingMode, INTERNAL_SCHEMA, SCAN_METADATA_TABLE};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, instrument};

use self::streamer::RowStreamer;
use self::timing::prime_scan_cursor;
use crate::backend::{Connection, Cursor, Value};
use crate::client::DbClient;
use crate::context::QueryContext;
use crate::error::{ClientError, Result};
use crate::normalize::handle_query_timeout_error;
use crate::session::{ExecutionHandle, Session, SessionState};

enum ExecTarget<'a> {
    /// Caller-owned session; never closed here.
    Borrowed(&'a Session),
    /// Session acquired for this call, released when streaming ends.
    Owned(ExecutionHandle),
}

impl DbClient {
    /// Run `query` on a freshly acquired session.
    ///
    /// The session is released once the returned rows have been read to the
    /// end or the stream is closed.
    #[instrument(skip_all, fields(query_len = query.len()))]
    pub async fn execute(
        &self,
        ctx: &QueryContext,
        query: &str,
        args: &[Value],
    ) -> Result<QueryResult> {
        if query.is_empty() {
            return Ok(QueryResult::empty());
        }
        let session = self.acquire_session(ctx).await?;
        let handle = ExecutionHandle::new(session, ctx.clone());
        self.start_execution(ctx, ExecTarget::Owned(handle), query, args)
            .await
    }

    /// Run `query` on a session the caller owns. The session is left open.
    #[instrument(skip_all, fields(session = %session.id(), query_len = query.len()))]
    pub async fn execute_in_session(
        &self,
        ctx: &QueryContext,
        session: &Session,
        query: &str,
        args: &[Value],
    ) -> Result<QueryResult> {
        if query.is_empty() {
            return Ok(QueryResult::empty());
        }
        self.start_execution(ctx, ExecTarget::Borrowed(session), query, args)
            .await
    }

    /// Acquire a session, run `query`, collect every row, release the session.
    pub async fn execute_sync(
        &self,
        ctx: &QueryContext,
        query: &str,
        args: &[Value],
    ) -> Result<SyncResult> {
        if query.is_empty() {
            return Ok(SyncResult::default());
        }
        let session = self.acquire_session(ctx).await?;
        let result = self
            .execute_sync_in_session(ctx, &session, query, args)
            .await;
        session.close(ctx.is_cancelled()).await;
        result
    }

    pub async fn execute_sync_in_session(
        &self,
        ctx: &QueryContext,
        session: &Session,
        query: &str,
        args: &[Value],
    ) -> Result<SyncResult> {
        let result = self.execute_in_session(ctx, session, query, args).await?;
        Ok(result.collect(ctx).await)
    }

    fn timeout_secs(&self) -> u64 {
        self.inner
            .settings
            .query_timeout
            .map_or(0, |timeout| timeout.as_secs())
    }

    async fn start_execution(
        &self,
        ctx: &QueryContext,
        target: ExecTarget<'_>,
        query: &str,
        args: &[Value],
    ) -> Result<QueryResult> {
        let started = Instant::now();
        let timing = TimingMode::from_flag(self.timing_enabled());
        // Deadline only: the execution scope is never cancelled on return, or
        // the connection would be torn down under the running row stream.
        let exec_ctx = match self.inner.settings.query_timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        };
        let status = self.status_hook();

        let locked = match &target {
            ExecTarget::Borrowed(session) => session.lock_owned(),
            ExecTarget::Owned(handle) => handle
                .session()
                .ok_or(ClientError::InvalidSession("execution handle has no session"))
                .and_then(Session::lock_owned),
        };
        let handle = match target {
            ExecTarget::Owned(handle) => Some(handle),
            ExecTarget::Borrowed(_) => None,
        };
        let mut session = match locked {
            Ok(session) => session,
            Err(err) => {
                status.done();
                if let Some(handle) = handle {
                    handle.release().await;
                }
                return Err(err);
            }
        };

        let cursor = match dispatch(&exec_ctx, &mut session, timing, query, args).await {
            Ok(cursor) => cursor,
            Err(err) => {
                let err = handle_query_timeout_error(err, self.timeout_secs());
                debug!(error = %err, "query failed before streaming");
                status.done();
                session.rollback_open_transaction().await;
                drop(session);
                if let Some(handle) = handle {
                    handle.release().await;
                }
                return Err(err);
            }
        };

        let columns = cursor.columns().to_vec();
        let (rows_tx, rows_rx) = mpsc::channel(1);
        let (timing_tx, timing_rx) = if timing.is_enabled() {
            let (tx, rx) = oneshot::channel();
            (Some(tx), TimingReceiver::new(rx))
        } else {
            (None, TimingReceiver::disabled())
        };

        let streamer = RowStreamer {
            ctx: exec_ctx,
            cursor,
            session,
            rows_tx,
            timing_tx,
            started,
            status,
            streaming_output: self.inner.settings.output.is_streaming(),
            timeout_secs: self.timeout_secs(),
            handle,
            delivered: 0,
        };
        tokio::spawn(streamer.run());

        Ok(QueryResult {
            columns,
            rows: RowStream::new(rows_rx),
            timing: timing_rx,
        })
    }
}

/// Start the query, racing it against the execution context.
///
/// If the context finishes first the pending dispatch is dropped, so a backend
/// that never answers cannot hold the caller.
async fn dispatch(
    exec_ctx: &QueryContext,
    session: &mut SessionState,
    timing: TimingMode,
    query: &str,
    args: &[Value],
) -> Result<Box<dyn Cursor>> {
    session.connection()?;
    if timing.is_enabled() {
        if !session.is_scan_metadata_primed() {
            // Priming talks to the backend too, so it races the context the
            // same way the query does.
            if let Err(err) = prime_scan_cursor(exec_ctx, session).await {
                cancel_if_requested(exec_ctx, session.connection()?).await;
                return Err(err);
            }
        }
    } else {
        session.clear_scan_metadata_primed();
    }
    if let Some(err) = exec_ctx.err() {
        return Err(err);
    }

    let conn = session.connection()?;
    let dispatched = tokio::select! {
        biased;
        cursor = conn.query(query, args) => Ok(cursor),
        err = exec_ctx.done_err() => Err(err),
    };
    match dispatched {
        Ok(cursor) => cursor,
        Err(err) => {
            cancel_if_requested(exec_ctx, conn).await;
            Err(err)
        }
    }
}

/// Best-effort backend cancel, sent only after an explicit cancellation.
async fn cancel_if_requested(exec_ctx: &QueryContext, conn: &dyn Connection) {
    if exec_ctx.is_cancelled() {
        if let Err(err) = conn.cancel_running().await {
            debug!(error = %err, "backend cancel request failed");
        }
    }
}
