use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;

use crate::time_utils::current_unix_timestamp_ms;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Returns true when `value` is non-empty and made only of lowercase
/// alphanumerics, `-`, and `_`.
pub fn is_slug(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

/// Allocates a time-derived run id, e.g. `run_20260826_140501_001a2b`.
pub fn new_run_id() -> String {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    let suffix = unique_suffix();
    format!("run_{stamp}_{suffix}")
}

/// Allocates a process-session id, e.g. `proc_18f2c4a91b_0007`.
pub fn new_process_id() -> String {
    let suffix = unique_suffix();
    format!("proc_{:x}_{suffix}", current_unix_timestamp_ms())
}

fn unique_suffix() -> String {
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    // Mix the pid in so two control-plane processes started the same
    // second do not collide.
    format!("{:06x}", (u64::from(std::process::id()) << 16) ^ counter)
}
