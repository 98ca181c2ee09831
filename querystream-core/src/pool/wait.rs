use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::Pool;
use crate::context::QueryContext;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub retry_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Retry a trivial round-trip until the pool answers or `options.timeout` passes.
///
/// On timeout the last connection error is wrapped in
/// [`ClientError::PoolStartupTimeout`].
pub async fn wait_for_pool(ctx: &QueryContext, pool: &Pool, options: &WaitOptions) -> Result<()> {
    let deadline = Instant::now() + options.timeout;
    let attempt_ctx = ctx.with_deadline(deadline);
    let mut attempts = 0u32;
    let mut last_err: Option<ClientError> = None;

    loop {
        attempts += 1;
        let err = match ping_once(&attempt_ctx, pool).await {
            Ok(()) => {
                debug!(pool = pool.name(), attempts, "pool answered");
                return Ok(());
            }
            Err(err) => err,
        };
        // An attempt cut short by the deadline says less than the previous failure.
        let err = match (err, last_err.take()) {
            (ClientError::DeadlineExceeded, Some(previous)) => previous,
            (err, _) => err,
        };
        if let Some(done) = ctx.err() {
            return Err(done);
        }

        let now = Instant::now();
        if now >= deadline {
            warn!(pool = pool.name(), attempts, error = %err, "database did not become ready");
            return Err(ClientError::PoolStartupTimeout {
                timeout_secs: options.timeout.as_secs(),
                attempts,
                source: Box::new(err),
            });
        }
        debug!(pool = pool.name(), attempts, error = %err, "database not ready, retrying");
        last_err = Some(err);

        let next = (now + options.retry_interval).min(deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(next) => {}
            _ = ctx.token().cancelled() => return Err(ClientError::QueryCancelled),
        }
    }
}

async fn ping_once(ctx: &QueryContext, pool: &Pool) -> Result<()> {
    let lease = pool.acquire(ctx).await?;
    let conn = lease
        .connection()
        .ok_or_else(|| ClientError::Internal("pooled connection missing".to_string()))?;
    let pinged = tokio::select! {
        result = conn.ping() => result,
        err = ctx.done_err() => Err(err),
    };
    if pinged.is_err() {
        let mut lease = lease;
        lease.discard();
    }
    pinged
}
