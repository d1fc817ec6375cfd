// Timekeeping helpers for the logging infrastructure
use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current time in milliseconds since the unix epoch.
///
/// This is what gets stamped on every log entry.
pub fn get_current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System time is before the unix epoch")
        .as_millis()
}
