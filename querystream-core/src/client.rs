use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::backend::{ConnectionString, Connector};
use crate::config::{ClientConfig, OutputMode};
use crate::context::QueryContext;
use crate::error::{ClientError, Result};
use crate::pool::{establish_pool, wait_for_pool, Pool, PoolConfig, PoolStatus, PooledConnection};
use crate::session::Session;
use crate::status::{NoopStatus, StatusHook};

#[derive(Debug, Clone)]
pub(crate) struct ClientSettings {
    pub(crate) query_timeout: Option<Duration>,
    pub(crate) output: OutputMode,
    pub(crate) session_init_sql: Option<String>,
}

pub(crate) struct ClientInner {
    pub(crate) user_pool: Pool,
    pub(crate) management_pool: Pool,
    pub(crate) settings: ClientSettings,
    timing_enabled: AtomicBool,
    status: RwLock<Arc<dyn StatusHook>>,
}

/// Entry point: owns the user and management pools for one backend.
///
/// Cheap to clone; clones share pools and settings.
#[derive(Clone)]
pub struct DbClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl DbClient {
    /// Resolve the backend from `config.connection_string` and establish both pools.
    pub async fn connect(ctx: &QueryContext, config: &ClientConfig) -> Result<Self> {
        let connection_string = ConnectionString::parse(&config.connection_string)?;
        info!(backend = %connection_string.kind(), "connecting");
        let connector = connection_string.connector()?;
        Self::with_connector(ctx, connector, config).await
    }

    /// Establish both pools against a caller-supplied connector.
    ///
    /// Returns once the user pool has answered a round-trip. The management
    /// pool is verified in the background; failures there are only logged.
    #[instrument(skip_all, fields(backend = connector.kind()))]
    pub async fn with_connector(
        ctx: &QueryContext,
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|err| ClientError::Config(err.to_string()))?;
        let wait = config.wait_options();

        let user_config = PoolConfig::new(config.max_db_connections).apply(&config.user_pool);
        let user_pool = establish_pool(
            ctx,
            "user",
            Arc::clone(&connector),
            user_config,
            Some(&wait),
        )
        .await?;

        let management_config =
            PoolConfig::new(config.max_db_connections).apply(&config.management_pool);
        let management_pool =
            establish_pool(ctx, "management", connector, management_config, None).await?;
        {
            let pool = management_pool.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(err) = wait_for_pool(&ctx, &pool, &wait).await {
                    warn!(error = %err, "management pool verification failed");
                }
            });
        }

        Ok(Self {
            inner: Arc::new(ClientInner {
                user_pool,
                management_pool,
                settings: ClientSettings {
                    query_timeout: config.query_timeout(),
                    output: config.output,
                    session_init_sql: config
                        .session_init_sql
                        .as_ref()
                        .map(|sql| sql.trim().to_string())
                        .filter(|sql| !sql.is_empty()),
                },
                timing_enabled: AtomicBool::new(config.timing),
                status: RwLock::new(Arc::new(NoopStatus)),
            }),
        })
    }

    /// Lease a session from the user pool, running the session init step.
    #[instrument(skip_all)]
    pub async fn acquire_session(&self, ctx: &QueryContext) -> Result<Session> {
        let lease = self
            .inner
            .user_pool
            .acquire(ctx)
            .await
            .map_err(|err| ClientError::SessionAcquisition(Box::new(err)))?;
        if lease.connection().is_none() {
            return Err(ClientError::Internal(
                "pool returned a lease without a connection and no error".to_string(),
            ));
        }
        let session = Session::new(lease);

        if let Some(sql) = &self.inner.settings.session_init_sql {
            if let Err(err) = session.execute(sql).await {
                session.close(false).await;
                return Err(ClientError::SessionAcquisition(Box::new(err)));
            }
        }
        if let Some(err) = ctx.err() {
            session.close(ctx.is_cancelled()).await;
            return Err(ClientError::SessionAcquisition(Box::new(err)));
        }

        debug!(session = %session.id(), "session acquired");
        Ok(session)
    }

    /// Lease a connection from the management pool for internal bookkeeping.
    pub async fn acquire_management_connection(
        &self,
        ctx: &QueryContext,
    ) -> Result<PooledConnection> {
        self.inner.management_pool.acquire(ctx).await
    }

    pub fn timing_enabled(&self) -> bool {
        self.inner.timing_enabled.load(Ordering::SeqCst)
    }

    /// Takes effect from the next query.
    pub fn set_timing_enabled(&self, enabled: bool) {
        self.inner.timing_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn set_status_hook(&self, hook: Arc<dyn StatusHook>) {
        match self.inner.status.write() {
            Ok(mut status) => *status = hook,
            Err(_) => warn!("status hook lock poisoned, keeping previous hook"),
        }
    }

    pub(crate) fn status_hook(&self) -> Arc<dyn StatusHook> {
        self.inner
            .status
            .read()
            .map(|status| Arc::clone(&status))
            .unwrap_or_else(|_| Arc::new(NoopStatus))
    }

    pub fn user_pool_status(&self) -> PoolStatus {
        self.inner.user_pool.status()
    }

    pub fn management_pool_status(&self) -> PoolStatus {
        self.inner.management_pool.status()
    }

    /// Drop idle connections in both pools.
    pub fn reset_pools(&self) {
        self.inner.user_pool.reset();
        self.inner.management_pool.reset();
    }

    /// Close both pools; pending and future acquisitions fail with [`ClientError::PoolClosed`].
    pub fn close(&self) {
        self.inner.user_pool.close();
        self.inner.management_pool.close();
        info!("client closed");
    }
}

impl fmt::Debug for DbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbClient")
            .field("user_pool", &self.inner.user_pool)
            .field("management_pool", &self.inner.management_pool)
            .field("settings", &self.inner.settings)
            .field("timing_enabled", &self.timing_enabled())
            .finish()
    }
}
