//! Wall-clock timing plus backend-reported scan metadata.
//!
//! The metadata query runs straight on the session's connection, outside the
//! executor, so it is never itself timed.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::result::{TimingMetadata, TimingResult};
use crate::context::QueryContext;
use crate::error::{ClientError, Result};
use crate::session::SessionState;

pub const INTERNAL_SCHEMA: &str = "querystream_internal";
pub const SCAN_METADATA_TABLE: &str = "scan_metadata";

const SYSTEM_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whether a query collects timing. Read once per call so a runtime toggle
/// affects the next query, never one already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimingMode {
    Enabled,
    Disabled,
}

impl TimingMode {
    pub fn from_flag(enabled: bool) -> Self {
        if enabled {
            TimingMode::Enabled
        } else {
            TimingMode::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self == TimingMode::Enabled
    }
}

/// Always yields a duration; metadata is attached only when the backend
/// reports new scan rows for this session.
///
/// Once `ctx` is done the backend is not queried and only the duration is
/// reported, so a cancelled stream closes without waiting on the metadata
/// query.
pub(crate) async fn collect_timing(
    ctx: &QueryContext,
    started: Instant,
    state: &mut SessionState,
) -> TimingResult {
    let duration = started.elapsed();
    if ctx.is_done() {
        debug!("query context done, reporting duration only");
        return TimingResult {
            duration,
            metadata: None,
        };
    }
    let fetched = tokio::select! {
        biased;
        _ = ctx.done() => {
            debug!("query context done during scan metadata fetch");
            return TimingResult { duration, metadata: None };
        }
        fetched = tokio::time::timeout(SYSTEM_QUERY_TIMEOUT, fetch_scan_metadata(state)) => fetched,
    };
    let metadata = match fetched {
        Ok(Ok(metadata)) => metadata,
        Ok(Err(err)) => {
            warn!(error = %err, "scan metadata unavailable, reporting duration only");
            None
        }
        Err(_) => {
            warn!("scan metadata query timed out, reporting duration only");
            None
        }
    };
    TimingResult { duration, metadata }
}

async fn fetch_scan_metadata(state: &mut SessionState) -> Result<Option<TimingMetadata>> {
    let (metadata, newest) = {
        let conn = state.connection()?;
        if !conn.supports_scan_metadata() {
            return Ok(None);
        }
        let sql = format!(
            "select id, rows_fetched, cache_hit, hydrate_calls \
             from {INTERNAL_SCHEMA}.{SCAN_METADATA_TABLE} where id > {}",
            state.scan_metadata_max_id()
        );
        let mut cursor = conn.query(&sql, &[]).await?;
        let mut metadata = TimingMetadata::default();
        let mut newest: Option<i64> = None;
        while let Some(row) = cursor.next_row().await {
            let row = row?;
            let [id, rows_fetched, cache_hit, hydrate_calls] = row.as_slice() else {
                return Err(ClientError::backend("unexpected scan metadata row shape"));
            };
            let rows_fetched = rows_fetched.as_i64().unwrap_or(0);
            metadata.hydrate_calls += hydrate_calls.as_i64().unwrap_or(0);
            if cache_hit.as_bool().unwrap_or(false) {
                metadata.cached_rows_fetched += rows_fetched;
            } else {
                metadata.rows_fetched += rows_fetched;
            }
            if let Some(id) = id.as_i64() {
                newest = Some(newest.map_or(id, |n| n.max(id)));
            }
        }
        cursor.close().await?;
        (metadata, newest)
    };

    match newest {
        Some(id) => {
            state.advance_scan_metadata(id);
            Ok(Some(metadata))
        }
        None => Ok(None),
    }
}

/// Point the session's scan cursor at the newest existing row, so the first
/// timing fetch only sees this session's own activity. Errors only when `ctx`
/// finishes first.
pub(crate) async fn prime_scan_cursor(
    ctx: &QueryContext,
    state: &mut SessionState,
) -> Result<()> {
    let read = tokio::select! {
        biased;
        err = ctx.done_err() => return Err(err),
        read = tokio::time::timeout(SYSTEM_QUERY_TIMEOUT, read_max_scan_id(state)) => read,
    };
    match read {
        Ok(Ok(Some(id))) => state.advance_scan_metadata(id),
        Ok(Ok(None)) => {}
        Ok(Err(err)) => debug!(error = %err, "could not prime scan metadata cursor"),
        Err(_) => debug!("priming scan metadata cursor timed out"),
    }
    state.mark_scan_metadata_primed();
    Ok(())
}

async fn read_max_scan_id(state: &SessionState) -> Result<Option<i64>> {
    let conn = state.connection()?;
    if !conn.supports_scan_metadata() {
        return Ok(None);
    }
    let sql = format!("select max(id) from {INTERNAL_SCHEMA}.{SCAN_METADATA_TABLE}");
    let mut cursor = conn.query(&sql, &[]).await?;
    let max_id = match cursor.next_row().await {
        Some(row) => row?.first().and_then(|v| v.as_i64()),
        None => None,
    };
    cursor.close().await?;
    Ok(max_id)
}
