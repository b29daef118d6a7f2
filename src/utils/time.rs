use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Wall clock in milliseconds since the unix epoch, 0 if the clock is before it.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
