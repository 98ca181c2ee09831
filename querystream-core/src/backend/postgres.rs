//! Network dialect: PostgreSQL over tokio-postgres.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::types::Type;
use tokio_postgres::{Client, Config, NoTls, Row, RowStream};
use tracing::{debug, warn};

use super::{ColumnDef, Connection, Connector, Cursor, Value};
use crate::error::{ClientError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl PgSslMode {
    /// Mode from `PGSSLMODE`, defaulting to `disable`.
    pub fn from_env() -> Self {
        let value = std::env::var("PGSSLMODE").unwrap_or_else(|_| "disable".to_string());
        Self::from_str(value.as_str())
    }

    pub fn from_str(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Disable,
        }
    }
}

#[derive(Clone)]
enum TlsConfig {
    None,
    Prefer(MakeTlsConnector),
    Enforced(MakeTlsConnector),
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsConfig::None => write!(f, "TlsConfig::None"),
            TlsConfig::Prefer(_) => write!(f, "TlsConfig::Prefer(..)"),
            TlsConfig::Enforced(_) => write!(f, "TlsConfig::Enforced(..)"),
        }
    }
}

impl TlsConfig {
    fn build(mode: PgSslMode) -> Result<Self> {
        match mode {
            PgSslMode::Disable => Ok(TlsConfig::None),
            PgSslMode::Prefer => Ok(TlsConfig::Prefer(build_tls_connector(mode)?)),
            PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => {
                Ok(TlsConfig::Enforced(build_tls_connector(mode)?))
            }
        }
    }
}

fn build_tls_connector(mode: PgSslMode) -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    match mode {
        PgSslMode::Prefer | PgSslMode::Require => {
            builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        PgSslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        PgSslMode::VerifyFull => {}
        PgSslMode::Disable => {
            return Err(ClientError::Config(
                "sslmode=disable should not build a TLS connector".to_string(),
            ))
        }
    }
    let connector = builder.build().map_err(|err| {
        ClientError::Config(format!("failed to build TLS connector for {mode:?}: {err}"))
    })?;
    Ok(MakeTlsConnector::new(connector))
}

/// Opens PostgreSQL connections, negotiating TLS per `sslmode`.
pub struct PostgresConnector {
    config: Config,
    ssl_mode: PgSslMode,
    tls: TlsConfig,
}

impl PostgresConnector {
    /// `sslmode` in the connection string wins over `PGSSLMODE`.
    pub fn new(connection_string: &str) -> Result<Self> {
        let (stripped, ssl_mode) = split_ssl_mode(connection_string);
        let ssl_mode = ssl_mode
            .map(|mode| PgSslMode::from_str(&mode))
            .unwrap_or_else(PgSslMode::from_env);
        let mut config: Config = stripped.parse().map_err(|err| {
            ClientError::Config(format!("invalid postgres connection string: {err}"))
        })?;
        config.ssl_mode(match ssl_mode {
            PgSslMode::Disable => SslMode::Disable,
            PgSslMode::Prefer => SslMode::Prefer,
            _ => SslMode::Require,
        });
        Ok(Self {
            config,
            ssl_mode,
            tls: TlsConfig::build(ssl_mode)?,
        })
    }

    async fn connect_without_tls(&self) -> Result<Client> {
        let mut config = self.config.clone();
        config.ssl_mode(SslMode::Disable);
        let (client, connection) = config.connect(NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection error");
            }
        });
        Ok(client)
    }

    async fn connect_with_tls(&self, connector: MakeTlsConnector) -> Result<Client> {
        let (client, connection) = self.config.connect(connector).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection error");
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let (client, cancel_tls) = match &self.tls {
            TlsConfig::None => {
                debug!("connecting to PostgreSQL without TLS");
                (self.connect_without_tls().await?, None)
            }
            TlsConfig::Prefer(connector) => {
                debug!(ssl_mode = ?self.ssl_mode, "connecting to PostgreSQL with TLS");
                match self.connect_with_tls(connector.clone()).await {
                    Ok(client) => (client, Some(connector.clone())),
                    Err(err) => {
                        warn!(
                            error = %err,
                            "TLS connection failed in sslmode=prefer, retrying without TLS"
                        );
                        (self.connect_without_tls().await?, None)
                    }
                }
            }
            TlsConfig::Enforced(connector) => {
                debug!(ssl_mode = ?self.ssl_mode, "connecting to PostgreSQL with TLS");
                (
                    self.connect_with_tls(connector.clone()).await?,
                    Some(connector.clone()),
                )
            }
        };
        Ok(Box::new(PostgresConnection { client, cancel_tls }))
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}

struct PostgresConnection {
    client: Client,
    cancel_tls: Option<MakeTlsConnector>,
}

#[async_trait]
impl Connection for PostgresConnection {
    async fn query(&self, sql: &str, args: &[Value]) -> Result<Box<dyn Cursor>> {
        let statement = self.client.prepare(sql).await?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| ColumnDef::new(c.name(), c.type_().name()))
            .collect();
        let rows = self.client.query_raw(&statement, args.iter()).await?;
        Ok(Box::new(PostgresCursor {
            columns,
            rows: Some(Box::pin(rows)),
        }))
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.client.simple_query("select 1").await?;
        Ok(())
    }

    async fn cancel_running(&self) -> Result<()> {
        let token = self.client.cancel_token();
        match &self.cancel_tls {
            Some(tls) => token.cancel_query(tls.clone()).await?,
            None => token.cancel_query(NoTls).await?,
        }
        Ok(())
    }

    fn supports_scan_metadata(&self) -> bool {
        true
    }

    fn is_broken(&self) -> bool {
        self.client.is_closed()
    }
}

struct PostgresCursor {
    columns: Vec<ColumnDef>,
    rows: Option<Pin<Box<RowStream>>>,
}

#[async_trait]
impl Cursor for PostgresCursor {
    fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    async fn next_row(&mut self) -> Option<Result<Vec<Value>>> {
        let rows = self.rows.as_mut()?;
        match rows.next().await? {
            Ok(row) => Some(row_values(&row)),
            Err(err) => Some(Err(err.into())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.rows = None;
        Ok(())
    }
}

fn row_values(row: &Row) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| column_value(row, idx)).collect()
}

fn column_value(row: &Row, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_();
    let value = if *ty == Type::BOOL {
        row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(Value::Int)
    } else if *ty == Type::OID {
        row.try_get::<_, Option<u32>>(idx)?.map(|v| Value::Int(v.into()))
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into()))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(Value::Float)
    } else if *ty == Type::BYTEA {
        row.try_get::<_, Option<Vec<u8>>>(idx)?.map(Value::Bytes)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?.map(Value::Timestamp)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|v| Value::Timestamp(v.and_utc()))
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        row.try_get::<_, Option<serde_json::Value>>(idx)?.map(Value::Json)
    } else {
        match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(Value::Text),
            Err(_) => Some(Value::Text(format!("<{}>", ty.name()))),
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Pull `sslmode` out of a URI query string or key/value DSN.
fn split_ssl_mode(raw: &str) -> (String, Option<String>) {
    if raw.contains("://") {
        let Some((base, query)) = raw.split_once('?') else {
            return (raw.to_string(), None);
        };
        let mut mode = None;
        let kept: Vec<&str> = query
            .split('&')
            .filter(|pair| match pair.split_once('=') {
                Some(("sslmode", value)) => {
                    mode = Some(value.to_string());
                    false
                }
                _ => true,
            })
            .collect();
        let rebuilt = if kept.is_empty() {
            base.to_string()
        } else {
            format!("{base}?{}", kept.join("&"))
        };
        return (rebuilt, mode);
    }

    let mut mode = None;
    let kept: Vec<&str> = raw
        .split_whitespace()
        .filter(|pair| match pair.split_once('=') {
            Some(("sslmode", value)) => {
                mode = Some(value.to_string());
                false
            }
            _ => true,
        })
        .collect();
    (kept.join(" "), mode)
}
