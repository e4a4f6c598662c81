use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in whole seconds since the epoch, the unit every timestamp
/// column in this crate is stored in.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
