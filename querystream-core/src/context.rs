//! Cancellation and deadline scope for a single logical query.
//!
//! A [`QueryContext`] pairs a cancellation token with an optional deadline.
//! Clones share the token, so cancelling any clone cancels them all.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl QueryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context driven by an existing token (e.g. one owned by a UI).
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a context that additionally expires at `deadline`.
    ///
    /// The derived context shares this context's token and has no cancel
    /// handle of its own: only the deadline governs its expiry. Cancelling a
    /// derived scope once the query has started would tear the backend
    /// connection down underneath the row stream that is still reading from it.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True only for explicit cancellation, not deadline expiry.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.is_deadline_exceeded()
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<ClientError> {
        if self.is_cancelled() {
            Some(ClientError::QueryCancelled)
        } else if self.is_deadline_exceeded() {
            Some(ClientError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Resolves with the reason once the context is done.
    pub async fn done_err(&self) -> ClientError {
        self.done().await;
        self.err().unwrap_or(ClientError::QueryCancelled)
    }
}
