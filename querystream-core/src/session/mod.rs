//! Sessions: one leased connection plus the state scoped to it.
//!
//! A [`Session`] is single-writer. Every operation takes the session lock
//! without waiting, so a second concurrent query fails with
//! [`ClientError::SessionBusy`] instead of interleaving on the connection.

pub mod id;

pub use id::SessionId;

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::backend::Connection;
use crate::context::QueryContext;
use crate::error::{ClientError, Result};
use crate::pool::PooledConnection;

pub(crate) struct SessionState {
    conn: Option<PooledConnection>,
    /// Newest scan-metadata row already attributed to a query. Only grows.
    scan_metadata_max_id: i64,
    scan_metadata_primed: bool,
    in_transaction: bool,
}

impl SessionState {
    pub(crate) fn connection(&self) -> Result<&dyn Connection> {
        self.conn
            .as_ref()
            .and_then(PooledConnection::connection)
            .ok_or(ClientError::InvalidSession("session has no connection"))
    }

    pub(crate) fn scan_metadata_max_id(&self) -> i64 {
        self.scan_metadata_max_id
    }

    /// Move the scan cursor forward; older ids are ignored.
    pub(crate) fn advance_scan_metadata(&mut self, id: i64) {
        self.scan_metadata_max_id = self.scan_metadata_max_id.max(id);
    }

    pub(crate) fn is_scan_metadata_primed(&self) -> bool {
        self.scan_metadata_primed
    }

    pub(crate) fn mark_scan_metadata_primed(&mut self) {
        self.scan_metadata_primed = true;
    }

    /// Timing was off for a query; re-prime if it is turned back on.
    pub(crate) fn clear_scan_metadata_primed(&mut self) {
        self.scan_metadata_primed = false;
    }

    /// Best-effort rollback of an open transaction.
    pub(crate) async fn rollback_open_transaction(&mut self) {
        if !self.in_transaction {
            return;
        }
        let rolled_back = match self.connection() {
            Ok(conn) => conn.execute("rollback").await,
            Err(err) => Err(err),
        };
        self.in_transaction = false;
        if let Err(err) = rolled_back {
            warn!(error = %err, "rollback failed, discarding connection");
            if let Some(conn) = self.conn.as_mut() {
                conn.discard();
            }
        }
    }
}

/// A leased connection, exclusively owned by the caller until [`Session::close`].
pub struct Session {
    id: SessionId,
    state: Arc<Mutex<SessionState>>,
}

impl Session {
    pub(crate) fn new(conn: PooledConnection) -> Self {
        Self {
            id: SessionId::new(),
            state: Arc::new(Mutex::new(SessionState {
                conn: Some(conn),
                scan_metadata_max_id: 0,
                scan_metadata_primed: false,
                in_transaction: false,
            })),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// True while a query or its row stream holds the session.
    pub fn is_busy(&self) -> bool {
        self.state.try_lock().is_err()
    }

    /// Last scan-metadata id seen by timing, or `None` while the session is busy.
    pub fn scan_metadata_max_id(&self) -> Option<i64> {
        self.state.try_lock().ok().map(|s| s.scan_metadata_max_id)
    }

    pub fn in_transaction(&self) -> bool {
        self.state.try_lock().map(|s| s.in_transaction).unwrap_or(false)
    }

    pub(crate) fn lock_owned(&self) -> Result<OwnedMutexGuard<SessionState>> {
        Arc::clone(&self.state)
            .try_lock_owned()
            .map_err(|_| ClientError::SessionBusy)
    }

    /// Run a statement that returns no rows.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        let state = self.lock_owned()?;
        state.connection()?.execute(sql).await
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        let mut state = self.lock_owned()?;
        if state.in_transaction {
            return Err(ClientError::backend("transaction already in progress"));
        }
        state.connection()?.execute("begin").await?;
        state.in_transaction = true;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        let mut state = self.lock_owned()?;
        if !state.in_transaction {
            return Err(ClientError::backend("no transaction in progress"));
        }
        let committed = state.connection()?.execute("commit").await;
        state.in_transaction = false;
        committed
    }

    pub async fn rollback(&self) -> Result<()> {
        let mut state = self.lock_owned()?;
        if !state.in_transaction {
            return Err(ClientError::backend("no transaction in progress"));
        }
        let rolled_back = state.connection()?.execute("rollback").await;
        state.in_transaction = false;
        rolled_back
    }

    /// Return the connection to the pool, waiting for any in-flight row stream.
    ///
    /// A cancelled session's connection may still be finishing the abandoned
    /// statement, so it is discarded rather than reused.
    pub async fn close(self, is_cancelled: bool) {
        let mut state = self.state.lock().await;
        if !is_cancelled {
            state.rollback_open_transaction().await;
        }
        if let Some(mut conn) = state.conn.take() {
            if is_cancelled || state.in_transaction {
                conn.discard();
            }
            debug!(session = %self.id, is_cancelled, "session closed");
        }
    }

    /// Synchronous close for drop paths. If the session is still locked the
    /// connection is returned once the lock holder lets go.
    fn close_now(self, is_cancelled: bool) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(mut conn) = state.conn.take() {
                if is_cancelled || state.in_transaction {
                    conn.discard();
                }
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}

/// Releases a session the executor acquired on the caller's behalf, exactly once.
///
/// `release` is the normal path; dropping an unreleased handle falls back to a
/// synchronous close.
pub struct ExecutionHandle {
    session: Option<Session>,
    ctx: QueryContext,
}

impl ExecutionHandle {
    pub(crate) fn new(session: Session, ctx: QueryContext) -> Self {
        Self {
            session: Some(session),
            ctx,
        }
    }

    pub(crate) fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close(self.ctx.is_cancelled()).await;
        }
    }
}

impl Drop for ExecutionHandle {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.close_now(self.ctx.is_cancelled());
        }
    }
}
