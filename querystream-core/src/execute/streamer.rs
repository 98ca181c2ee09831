//! Background task moving rows from a backend cursor into a [`RowStream`].
//!
//! [`RowStream`]: super::RowStream

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::result::{Row, TimingResult};
use super::timing::collect_timing;
use crate::backend::{Cursor, Value};
use crate::context::QueryContext;
use crate::error::ClientError;
use crate::normalize::{handle_cancel_error, handle_query_timeout_error};
use crate::session::{ExecutionHandle, SessionState};
use crate::status::{loading_message, StatusHook, CANCELLING_MESSAGE};

/// Why draining stopped. Exactly one of these selects the teardown path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    Exhausted,
    Cancelled,
    RowError,
    ReceiverClosed,
    Panicked,
}

enum Step {
    Done,
    Next(Option<crate::error::Result<Vec<Value>>>),
}

pub(crate) struct RowStreamer {
    pub(crate) ctx: QueryContext,
    pub(crate) cursor: Box<dyn Cursor>,
    pub(crate) session: OwnedMutexGuard<SessionState>,
    pub(crate) rows_tx: mpsc::Sender<Row>,
    pub(crate) timing_tx: Option<oneshot::Sender<TimingResult>>,
    pub(crate) started: Instant,
    pub(crate) status: Arc<dyn StatusHook>,
    pub(crate) streaming_output: bool,
    pub(crate) timeout_secs: u64,
    pub(crate) handle: Option<ExecutionHandle>,
    pub(crate) delivered: u64,
}

impl RowStreamer {
    pub(crate) async fn run(mut self) {
        let end = AssertUnwindSafe(self.drain())
            .catch_unwind()
            .await
            .unwrap_or(StreamEnd::Panicked);
        self.teardown(end).await;
    }

    async fn drain(&mut self) -> StreamEnd {
        loop {
            if self.ctx.is_done() {
                self.status.set_status(CANCELLING_MESSAGE);
                return StreamEnd::Cancelled;
            }

            let step = tokio::select! {
                biased;
                _ = self.ctx.done() => Step::Done,
                row = self.cursor.next_row() => Step::Next(row),
            };
            let values = match step {
                Step::Done => {
                    self.status.set_status(CANCELLING_MESSAGE);
                    return StreamEnd::Cancelled;
                }
                Step::Next(None) => return StreamEnd::Exhausted,
                Step::Next(Some(Err(err))) => {
                    // Streaming does not resume after a failed read.
                    let _ = self.rows_tx.send(Row::failed(handle_cancel_error(err))).await;
                    return StreamEnd::RowError;
                }
                Step::Next(Some(Ok(values))) => values,
            };

            if self.streaming_output && self.delivered == 0 {
                self.status.done();
            }

            let sent = tokio::select! {
                biased;
                _ = self.ctx.done() => None,
                sent = self.rows_tx.send(Row::ok(values)) => Some(sent.is_ok()),
            };
            match sent {
                None => {
                    self.status.set_status(CANCELLING_MESSAGE);
                    return StreamEnd::Cancelled;
                }
                Some(false) => return StreamEnd::ReceiverClosed,
                Some(true) => {}
            }

            self.delivered += 1;
            self.status.set_status(&loading_message(self.delivered));
        }
    }

    async fn teardown(self, end: StreamEnd) {
        let RowStreamer {
            ctx,
            mut cursor,
            mut session,
            rows_tx,
            timing_tx,
            started,
            status,
            timeout_secs,
            handle,
            delivered,
            ..
        } = self;

        status.done();

        if end == StreamEnd::Cancelled {
            if let Ok(conn) = session.connection() {
                if let Err(err) = conn.cancel_running().await {
                    debug!(error = %err, "backend cancel request failed");
                }
            }
        }

        // A fully read cursor is idle, so timing can run before it closes.
        // Otherwise the cursor may still hold unread rows on the connection
        // and has to be closed first.
        let mut timing_tx = timing_tx;
        if end == StreamEnd::Exhausted {
            if let Some(tx) = timing_tx.take() {
                let _ = tx.send(collect_timing(&ctx, started, &mut session).await);
            }
        }

        let closed = cursor.close().await;

        if let Some(tx) = timing_tx.take() {
            let _ = tx.send(collect_timing(&ctx, started, &mut session).await);
        }

        let trailing_error = match (end, closed) {
            (StreamEnd::Panicked, _) => {
                warn!("row streamer panicked");
                Some(ClientError::Internal("row streamer panicked".to_string()))
            }
            (StreamEnd::Cancelled, _) if !ctx.is_cancelled() => Some(handle_query_timeout_error(
                ClientError::DeadlineExceeded,
                timeout_secs,
            )),
            (StreamEnd::Cancelled | StreamEnd::ReceiverClosed, Err(err)) => {
                debug!(error = %err, "cursor close error after early stop");
                None
            }
            (_, Err(err)) => Some(handle_cancel_error(err)),
            (_, Ok(())) => None,
        };
        if let Some(err) = trailing_error {
            let _ = rows_tx.send(Row::failed(err)).await;
        }

        drop(rows_tx);
        drop(session);
        debug!(?end, rows = delivered, "row stream finished");

        if let Some(handle) = handle {
            handle.release().await;
        }
    }
}
