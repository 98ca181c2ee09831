use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::pool::WaitOptions;

/// How query output is consumed. `Csv` and `Line` are streaming outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    #[default]
    Table,
    Csv,
    Line,
    Json,
}

impl OutputMode {
    pub fn is_streaming(self) -> bool {
        matches!(self, OutputMode::Csv | OutputMode::Line)
    }
}

impl std::str::FromStr for OutputMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "table" => Ok(Self::Table),
            "csv" => Ok(Self::Csv),
            "line" => Ok(Self::Line),
            "json" => Ok(Self::Json),
            other => bail!("unknown output mode '{other}'"),
        }
    }
}

/// Log line format for the CLI's subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Per-pool overrides; unset fields keep the pool defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PoolSettings {
    pub max_open: Option<usize>,
    pub max_idle_secs: Option<u64>,
    pub max_lifetime_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    pub connection_string: String,
    pub max_db_connections: usize,
    pub database_start_timeout_secs: u64,
    pub connection_retry_backoff_ms: u64,
    /// Zero means no deadline.
    pub query_timeout_secs: u64,
    pub timing: bool,
    pub output: OutputMode,
    pub session_init_sql: Option<String>,
    pub user_pool: PoolSettings,
    pub management_pool: PoolSettings,
    pub log_format: LogFormat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            max_db_connections: 10,
            database_start_timeout_secs: 30,
            connection_retry_backoff_ms: 200,
            query_timeout_secs: 0,
            timing: false,
            output: OutputMode::Table,
            session_init_sql: None,
            user_pool: PoolSettings::default(),
            management_pool: PoolSettings::default(),
            log_format: LogFormat::Compact,
        }
    }
}

impl ClientConfig {
    /// Defaults, then `path` if given, then `QUERYSTREAM_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with_env(path, None)
    }

    /// As [`ClientConfig::load`], reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let mut builder = config::Config::builder().add_source(
            config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("QUERYSTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: ClientConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_db_connections == 0 {
            bail!("max_db_connections must be greater than 0");
        }
        if self.connection_retry_backoff_ms == 0 {
            bail!("connection_retry_backoff_ms must be greater than 0");
        }
        let pools = [
            ("user_pool", &self.user_pool),
            ("management_pool", &self.management_pool),
        ];
        for (name, pool) in pools {
            if pool.max_open == Some(0) {
                bail!("{name}.max_open must be greater than 0");
            }
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        (self.query_timeout_secs > 0).then(|| Duration::from_secs(self.query_timeout_secs))
    }

    pub fn wait_options(&self) -> WaitOptions {
        WaitOptions {
            retry_interval: Duration::from_millis(self.connection_retry_backoff_ms),
            timeout: Duration::from_secs(self.database_start_timeout_secs),
        }
    }
}
