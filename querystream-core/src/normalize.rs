//! Maps driver and cancellation errors onto the small stable vocabulary shown
//! to users.

use std::collections::HashSet;

use crate::error::ClientError;

const CANCELED_BY_USER: &str = "canceling statement due to user request";
const DRIVER_PREFIXES: [&str; 2] = ["db error:", "ERROR:"];
const RPC_PREFIX: &str = "rpc error: code = Unknown desc =";

pub fn is_cancelled_error(err: &ClientError) -> bool {
    match err {
        ClientError::QueryCancelled => true,
        ClientError::SessionAcquisition(inner) => is_cancelled_error(inner),
        other => other.to_string().contains(CANCELED_BY_USER),
    }
}

/// Replace any cancellation-flavoured error with [`ClientError::QueryCancelled`].
pub fn handle_cancel_error(err: ClientError) -> ClientError {
    if is_cancelled_error(&err) {
        ClientError::QueryCancelled
    } else {
        err
    }
}

/// Turn an expired execution deadline into a timeout carrying the configured
/// limit. With no limit configured the deadline was the caller's own and is
/// left as is.
pub fn handle_query_timeout_error(err: ClientError, timeout_secs: u64) -> ClientError {
    match err {
        ClientError::DeadlineExceeded if timeout_secs > 0 => {
            ClientError::QueryTimeout(timeout_secs)
        }
        ClientError::DeadlineExceeded => ClientError::DeadlineExceeded,
        other => handle_cancel_error(other),
    }
}

/// Text suitable for display, with transport prefixes and codes removed.
pub fn display_message(err: &ClientError) -> String {
    if is_cancelled_error(err) {
        return ClientError::QueryCancelled.to_string();
    }
    match err {
        ClientError::Postgres(pg) => match pg.as_db_error() {
            Some(db) => clean_message(db.message()),
            None => clean_message(&pg.to_string()),
        },
        ClientError::DuckDb(duck) => clean_message(&duck.to_string()),
        other => clean_message(&other.to_string()),
    }
}

pub fn clean_message(message: &str) -> String {
    let mut text = message.trim();
    for prefix in DRIVER_PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim_start();
        }
    }
    if let Some(rest) = text.strip_prefix(RPC_PREFIX) {
        text = rest;
    }
    text.trim().to_string()
}

/// Join distinct error messages, keeping first-seen order.
pub fn combine_errors<'a, I>(prefix: &str, errors: I) -> Option<String>
where
    I: IntoIterator<Item = &'a ClientError>,
{
    let mut seen = HashSet::new();
    let messages: Vec<String> = errors
        .into_iter()
        .map(display_message)
        .filter(|m| seen.insert(m.clone()))
        .collect();
    if messages.is_empty() {
        return None;
    }
    let joined = messages.join("\n\t");
    if prefix.is_empty() {
        Some(joined)
    } else {
        Some(format!("{prefix} - {joined}"))
    }
}
