use std::path::{Path, PathBuf};

/// On-disk layout rooted at the cadence data directory.
///
/// Layout: `tasks/<id>.json` definitions, `runtime/state.json` run/process
/// state, `logs/process/<process_id>.jsonl` session logs, and
/// `artifacts/...` rendered task output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("runtime").join("state.json")
    }

    pub fn process_log_dir(&self) -> PathBuf {
        self.root.join("logs").join("process")
    }

    pub fn process_log_path(&self, process_id: &str) -> PathBuf {
        self.process_log_dir().join(format!("{process_id}.jsonl"))
    }

    /// Resolves a template-relative output path against the data root.
    pub fn resolve_relative(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}
