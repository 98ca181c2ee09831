//! Bounded async pool of backend connections.
//!
//! Capacity is a semaphore: a lease holds one permit for its whole life, so a
//! connection can never be handed to two holders. Idle connections are kept
//! in a stack and evicted by idle time and lifetime on every checkout and
//! return.

mod wait;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

pub use self::wait::{wait_for_pool, WaitOptions};
use crate::backend::{Connection, Connector};
use crate::config::PoolSettings;
use crate::context::QueryContext;
use crate::error::{ClientError, Result};

pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_open: usize,
    /// Zero disables idle eviction.
    pub max_idle_time: Duration,
    /// Zero disables lifetime eviction.
    pub max_lifetime: Duration,
}

impl PoolConfig {
    pub fn new(max_open: usize) -> Self {
        Self {
            max_open,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            max_lifetime: DEFAULT_MAX_LIFETIME,
        }
    }

    /// Layer per-pool overrides on top of these settings.
    pub fn apply(mut self, overrides: &PoolSettings) -> Self {
        if let Some(max_open) = overrides.max_open {
            self.max_open = max_open;
        }
        if let Some(secs) = overrides.max_idle_secs {
            self.max_idle_time = Duration::from_secs(secs);
        }
        if let Some(secs) = overrides.max_lifetime_secs {
            self.max_lifetime = Duration::from_secs(secs);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(ClientError::Config(
                "pool max_open must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

struct IdleConnection {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState {
    idle: Vec<IdleConnection>,
}

/// Drop idle entries past their idle time or lifetime, returning how many went.
fn evict_idle(state: &mut PoolState, config: &PoolConfig, now: Instant) -> usize {
    let before = state.idle.len();
    state.idle.retain(|entry| {
        let idle_ok = config.max_idle_time.is_zero()
            || now.duration_since(entry.last_used) < config.max_idle_time;
        let life_ok = config.max_lifetime.is_zero()
            || now.duration_since(entry.created_at) < config.max_lifetime;
        idle_ok && life_ok && !entry.conn.is_broken()
    });
    before - state.idle.len()
}

struct PoolInner {
    name: &'static str,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    total: AtomicUsize,
    semaphore: Arc<Semaphore>,
}

impl PoolInner {
    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|e| ClientError::Internal(format!("{} pool mutex poisoned: {e}", self.name)))
    }

    fn evict_idle_locked(&self, state: &mut PoolState) {
        let removed = evict_idle(state, &self.config, Instant::now());
        if removed > 0 {
            self.total.fetch_sub(removed, Ordering::SeqCst);
            debug!(pool = self.name, removed, "evicted idle connections");
        }
    }

    fn release_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        if self.semaphore.is_closed() || conn.is_broken() {
            self.drop_connection(conn);
            return;
        }
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                self.total.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };
        state.idle.push(IdleConnection {
            conn,
            created_at,
            last_used: Instant::now(),
        });
        self.evict_idle_locked(&mut state);
    }

    fn drop_connection(&self, _conn: Box<dyn Connection>) {
        self.total.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A named pool handle; clones share the same connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_open: usize,
}

impl Pool {
    pub fn new(
        name: &'static str,
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                name,
                connector,
                semaphore: Arc::new(Semaphore::new(config.max_open)),
                config,
                state: Mutex::new(PoolState { idle: Vec::new() }),
                total: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Lease a connection, waiting for capacity until `ctx` is done.
    pub async fn acquire(&self, ctx: &QueryContext) -> Result<PooledConnection> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let permit = tokio::select! {
            biased;
            permit = Arc::clone(&self.inner.semaphore).acquire_owned() => {
                permit.map_err(|_| ClientError::PoolClosed)?
            }
            err = ctx.done_err() => return Err(err),
        };

        let idle = {
            let mut state = self.inner.lock_state()?;
            self.inner.evict_idle_locked(&mut state);
            state.idle.pop()
        };
        if let Some(idle) = idle {
            return Ok(PooledConnection::new(
                idle.conn,
                idle.created_at,
                Arc::clone(&self.inner),
                permit,
            ));
        }

        self.inner.total.fetch_add(1, Ordering::SeqCst);
        let connected = tokio::select! {
            conn = self.inner.connector.connect() => conn,
            err = ctx.done_err() => Err(err),
        };
        match connected {
            Ok(conn) => {
                debug!(
                    pool = self.inner.name,
                    backend = self.inner.connector.kind(),
                    "opened connection"
                );
                Ok(PooledConnection::new(
                    conn,
                    Instant::now(),
                    Arc::clone(&self.inner),
                    permit,
                ))
            }
            Err(err) => {
                self.inner.total.fetch_sub(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let idle = self
            .inner
            .state
            .lock()
            .map(|state| state.idle.len())
            .unwrap_or(0);
        let open = self.inner.total.load(Ordering::SeqCst);
        PoolStatus {
            open,
            idle,
            in_use: open.saturating_sub(idle),
            max_open: self.inner.config.max_open,
        }
    }

    /// Drop every idle connection; leased ones are unaffected.
    pub fn reset(&self) {
        match self.inner.lock_state() {
            Ok(mut state) => {
                let removed = state.idle.len();
                state.idle.clear();
                self.inner.total.fetch_sub(removed, Ordering::SeqCst);
                info!(pool = self.inner.name, removed, "reset pool");
            }
            Err(err) => warn!(pool = self.inner.name, error = %err, "failed to reset pool"),
        }
    }

    /// Fail pending and future acquisitions; leased connections are dropped on return.
    pub fn close(&self) {
        self.inner.semaphore.close();
        self.reset();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.semaphore.is_closed()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

/// A leased connection. Dropping it returns the connection to its pool, or
/// discards it when marked with [`PooledConnection::discard`].
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
    discard: bool,
}

impl PooledConnection {
    fn new(
        conn: Box<dyn Connection>,
        created_at: Instant,
        pool: Arc<PoolInner>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            pool,
            _permit: permit,
            discard: false,
        }
    }

    /// Close the connection instead of returning it for reuse.
    pub fn discard(&mut self) {
        self.discard = true;
    }

    pub fn connection(&self) -> Option<&dyn Connection> {
        self.conn.as_deref()
    }

    pub fn pool_name(&self) -> &'static str {
        self.pool.name
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("discard", &self.discard)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.discard {
                debug!(pool = self.pool.name, "discarding connection");
                self.pool.drop_connection(conn);
            } else {
                self.pool.release_connection(conn, self.created_at);
            }
        }
    }
}

/// Create a pool and, when `wait` is given, block until it answers a round-trip.
#[instrument(skip(ctx, connector, config, wait), fields(max_open = config.max_open))]
pub async fn establish_pool(
    ctx: &QueryContext,
    name: &'static str,
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    wait: Option<&WaitOptions>,
) -> Result<Pool> {
    let pool = Pool::new(name, connector, config)?;
    if let Some(options) = wait {
        wait_for_pool(ctx, &pool, options).await?;
        info!(pool = name, "pool verified");
    }
    Ok(pool)
}
