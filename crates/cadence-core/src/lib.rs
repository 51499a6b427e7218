//! Foundational low-level utilities shared across cadence crates.
//!
//! Provides atomic file-write helpers, JSONL append, time utilities, id
//! generation, and the on-disk layout used by the task store, run state,
//! and process logs.

pub mod atomic_io;
pub mod ids;
pub mod paths;
pub mod time_utils;

pub use atomic_io::{append_jsonl_line, write_text_atomic};
pub use ids::{is_slug, new_process_id, new_run_id};
pub use paths::StoragePaths;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
