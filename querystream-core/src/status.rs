//! Advisory progress reporting for long-running queries.

use tracing::debug;

pub trait StatusHook: Send + Sync {
    fn set_status(&self, message: &str);
    fn done(&self);
}

/// Ignores every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatus;

impl StatusHook for NoopStatus {
    fn set_status(&self, _message: &str) {}
    fn done(&self) {}
}

/// Emits status updates as debug events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatus;

impl StatusHook for TracingStatus {
    fn set_status(&self, message: &str) {
        debug!(status = message, "query status");
    }

    fn done(&self) {
        debug!("query status cleared");
    }
}

pub fn loading_message(rows: u64) -> String {
    format!("Loading results: {:>3}", humanize_row_count(rows))
}

pub const CANCELLING_MESSAGE: &str = "Cancelling query";

/// Format a count with thousands separators, e.g. `1024` as `1,024`.
pub fn humanize_row_count(count: u64) -> String {
    let digits = count.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
