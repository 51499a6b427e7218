//! Durable run/process state store.
//!
//! The store is the single source of truth for run and process-session
//! lifecycle. All mutations are serialized behind one mutex and flushed
//! atomically to `state.json` before the call returns, so a restart can
//! reconstruct state without ambiguity. Opening the store performs the
//! crash-recovery pass exactly once, before any trigger can observe it:
//! every run still marked pending/running is reclassified as failed and
//! every session still marked starting/running as lost.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use cadence_core::{current_unix_timestamp_ms, write_text_atomic};
use cadence_task::TaskMode;

#[cfg(test)]
mod tests;

pub const STATE_SCHEMA_VERSION: u32 = 1;
pub const PROCESS_LOST_ERROR: &str = "process lost after service restart";
pub const PROCESS_LOST_ERROR_CODE: &str = "process_lost";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Lost,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Lost => "lost",
        }
    }

    /// Terminal runs release their concurrency slot and never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Lost)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Exited,
    Killed,
    Lost,
}

impl ProcessStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Killed => "killed",
            Self::Lost => "lost",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::Lost)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "exited" => Some(Self::Exited),
            "killed" => Some(Self::Killed),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Cron,
    Manual,
    Api,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Manual => "manual",
            Self::Api => "api",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cron" => Some(Self::Cron),
            "manual" => Some(Self::Manual),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub task_id: String,
    pub trigger: RunTrigger,
    pub status: RunStatus,
    pub started_at_unix_ms: u64,
    #[serde(default)]
    pub ended_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub process_id: Option<String>,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub trace_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
}

impl RunRecord {
    pub fn pending(run_id: &str, task_id: &str, trigger: RunTrigger) -> Self {
        Self {
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            trigger,
            status: RunStatus::Pending,
            started_at_unix_ms: current_unix_timestamp_ms(),
            ended_at_unix_ms: None,
            process_id: None,
            output_path: None,
            trace_path: None,
            error: None,
            error_code: None,
        }
    }
}

/// Append-only run-lifecycle event log, one JSONL row per event. The
/// destination is the run's `trace_path`; rows survive the run record
/// itself being compacted away.
#[derive(Debug, Clone)]
pub struct RunEventLog {
    path: PathBuf,
    run_id: String,
    task_id: String,
    mode: TaskMode,
}

impl RunEventLog {
    pub fn new(
        path: impl Into<PathBuf>,
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        mode: TaskMode,
    ) -> Self {
        Self {
            path: path.into(),
            run_id: run_id.into(),
            task_id: task_id.into(),
            mode,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Best effort: a run must not fail because its event row could not
    /// be appended.
    pub fn append(&self, event: &str, payload: serde_json::Value) {
        let mut row = serde_json::json!({
            "ts": current_unix_timestamp_ms(),
            "run_id": self.run_id,
            "task_id": self.task_id,
            "event": event,
            "mode": self.mode.as_str(),
        });
        if let (Some(row_map), Some(payload_map)) = (row.as_object_mut(), payload.as_object()) {
            for (key, value) in payload_map {
                row_map.insert(key.clone(), value.clone());
            }
        }
        if let Err(error) = cadence_core::append_jsonl_line(&self.path, &row.to_string()) {
            tracing::warn!(run_id = %self.run_id, %error, "failed to append run event");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessRecord {
    pub process_id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub task_id: Option<String>,
    pub mode: TaskMode,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    pub status: ProcessStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    pub interactive: bool,
    pub timeout_seconds: u64,
    pub started_at_unix_ms: u64,
    pub updated_at_unix_ms: u64,
    #[serde(default)]
    pub ended_at_unix_ms: Option<u64>,
    #[serde(default)]
    pub returncode: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub stdout_bytes: u64,
    #[serde(default)]
    pub stderr_bytes: u64,
    #[serde(default)]
    pub log_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateFile {
    schema_version: u32,
    #[serde(default)]
    runs: BTreeMap<String, RunRecord>,
    #[serde(default)]
    processes: BTreeMap<String, ProcessRecord>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            runs: BTreeMap::new(),
            processes: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered_runs: usize,
    pub recovered_processes: usize,
}

/// Latest-run view used by task status aggregation.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TaskRuntimeSummary {
    pub active_runs: usize,
    pub active_run_ids: Vec<String>,
    pub last_run: Option<RunRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    ConcurrencyExceeded {
        task_id: String,
        active: usize,
        limit: u32,
    },
    RunNotFound(String),
    ProcessNotFound(String),
    TerminalRun(String),
    TerminalProcess(String),
    Persist(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConcurrencyExceeded {
                task_id,
                active,
                limit,
            } => write!(
                f,
                "task '{task_id}' already has {active} active run(s) (limit {limit})"
            ),
            Self::RunNotFound(run_id) => write!(f, "run '{run_id}' was not found"),
            Self::ProcessNotFound(process_id) => {
                write!(f, "process '{process_id}' was not found")
            }
            Self::TerminalRun(run_id) => {
                write!(f, "run '{run_id}' is terminal and cannot change")
            }
            Self::TerminalProcess(process_id) => {
                write!(f, "process '{process_id}' is terminal and cannot change")
            }
            Self::Persist(message) => write!(f, "failed to persist state: {message}"),
        }
    }
}

impl std::error::Error for StateError {}

/// Process-wide run/process state store with per-record serialized writes.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    inner: Mutex<StateFile>,
    recovery: RecoveryReport,
}

impl StateStore {
    /// Loads (or initializes) the state file and runs the crash-recovery
    /// pass before the store becomes visible to callers.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = load_state_file(&path)?;
        let recovery = recover_lost_records(&mut state);
        if recovery.recovered_runs > 0 || recovery.recovered_processes > 0 {
            save_state_file(&path, &state)?;
        }
        Ok(Self {
            path,
            inner: Mutex::new(state),
            recovery,
        })
    }

    /// What the startup recovery pass reclassified, for logging/status.
    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery.clone()
    }

    pub fn state_path(&self) -> &Path {
        &self.path
    }

    /// Atomically checks the per-task concurrency ceiling and inserts a
    /// pending run. Two concurrent triggers cannot both pass the check.
    pub fn try_begin_run(&self, run: RunRecord, max_concurrency: u32) -> Result<(), StateError> {
        let mut state = lock_or_recover(&self.inner);
        let active: Vec<&RunRecord> = state
            .runs
            .values()
            .filter(|r| r.task_id == run.task_id && r.status.is_active())
            .collect();
        if active.len() >= max_concurrency.max(1) as usize {
            return Err(StateError::ConcurrencyExceeded {
                task_id: run.task_id.clone(),
                active: active.len(),
                limit: max_concurrency.max(1),
            });
        }
        let run_id = run.run_id.clone();
        state.runs.insert(run_id.clone(), run);
        if let Err(error) = self.persist(&state) {
            // An unpersisted run must not occupy the slot.
            state.runs.remove(&run_id);
            return Err(error);
        }
        Ok(())
    }

    pub fn mark_run_running(&self, run_id: &str, process_id: &str) -> Result<(), StateError> {
        let mut state = lock_or_recover(&self.inner);
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StateError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StateError::TerminalRun(run_id.to_string()));
        }
        run.status = RunStatus::Running;
        run.process_id = Some(process_id.to_string());
        self.persist(&state)
    }

    /// Moves a run to a terminal state; the concurrency slot is released
    /// by the same write.
    pub fn finalize_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        error_code: Option<&str>,
        output_path: Option<&str>,
    ) -> Result<(), StateError> {
        debug_assert!(status.is_terminal());
        let mut state = lock_or_recover(&self.inner);
        let run = state
            .runs
            .get_mut(run_id)
            .ok_or_else(|| StateError::RunNotFound(run_id.to_string()))?;
        if run.status.is_terminal() {
            return Err(StateError::TerminalRun(run_id.to_string()));
        }
        run.status = status;
        run.ended_at_unix_ms = Some(current_unix_timestamp_ms());
        run.error = error.map(str::to_string);
        run.error_code = error_code.map(str::to_string);
        if output_path.is_some() {
            run.output_path = output_path.map(str::to_string);
        }
        self.persist(&state)
    }

    /// Abandons a pending run whose process never spawned, releasing the
    /// concurrency slot with a failure record.
    pub fn fail_pending_run(&self, run_id: &str, error: &str, error_code: &str) {
        let _ = self.finalize_run(run_id, RunStatus::Failed, Some(error), Some(error_code), None);
    }

    pub fn insert_process(&self, record: ProcessRecord) -> Result<(), StateError> {
        let mut state = lock_or_recover(&self.inner);
        state.processes.insert(record.process_id.clone(), record);
        self.persist(&state)
    }

    pub fn mark_process_running(&self, process_id: &str, pid: Option<u32>) -> Result<(), StateError> {
        let mut state = lock_or_recover(&self.inner);
        let record = state
            .processes
            .get_mut(process_id)
            .ok_or_else(|| StateError::ProcessNotFound(process_id.to_string()))?;
        if record.status.is_terminal() {
            return Err(StateError::TerminalProcess(process_id.to_string()));
        }
        record.status = ProcessStatus::Running;
        record.pid = pid;
        record.updated_at_unix_ms = current_unix_timestamp_ms();
        self.persist(&state)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finalize_process(
        &self,
        process_id: &str,
        status: ProcessStatus,
        returncode: Option<i32>,
        error: Option<&str>,
        error_code: Option<&str>,
        stdout_bytes: u64,
        stderr_bytes: u64,
    ) -> Result<(), StateError> {
        debug_assert!(status.is_terminal());
        let mut state = lock_or_recover(&self.inner);
        let record = state
            .processes
            .get_mut(process_id)
            .ok_or_else(|| StateError::ProcessNotFound(process_id.to_string()))?;
        if record.status.is_terminal() {
            return Err(StateError::TerminalProcess(process_id.to_string()));
        }
        let now = current_unix_timestamp_ms();
        record.status = status;
        record.returncode = returncode;
        record.error = error.map(str::to_string);
        record.error_code = error_code.map(str::to_string);
        record.stdout_bytes = stdout_bytes;
        record.stderr_bytes = stderr_bytes;
        record.updated_at_unix_ms = now;
        record.ended_at_unix_ms = Some(now);
        self.persist(&state)
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunRecord> {
        let state = lock_or_recover(&self.inner);
        state.runs.get(run_id).cloned()
    }

    pub fn get_process(&self, process_id: &str) -> Option<ProcessRecord> {
        let state = lock_or_recover(&self.inner);
        state.processes.get(process_id).cloned()
    }

    /// Most recent first, optionally filtered by task.
    pub fn list_runs(&self, task_id: Option<&str>, limit: usize) -> Vec<RunRecord> {
        let state = lock_or_recover(&self.inner);
        let mut runs: Vec<RunRecord> = state
            .runs
            .values()
            .filter(|r| task_id.map_or(true, |id| r.task_id == id))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at_unix_ms.cmp(&a.started_at_unix_ms));
        runs.truncate(limit.max(1));
        runs
    }

    pub fn list_processes(
        &self,
        task_id: Option<&str>,
        run_id: Option<&str>,
        status: Option<ProcessStatus>,
        limit: usize,
    ) -> Vec<ProcessRecord> {
        let state = lock_or_recover(&self.inner);
        let mut rows: Vec<ProcessRecord> = state
            .processes
            .values()
            .filter(|p| task_id.map_or(true, |id| p.task_id.as_deref() == Some(id)))
            .filter(|p| run_id.map_or(true, |id| p.run_id.as_deref() == Some(id)))
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.started_at_unix_ms.cmp(&a.started_at_unix_ms));
        rows.truncate(limit.max(1));
        rows
    }

    pub fn active_run_count(&self, task_id: &str) -> usize {
        let state = lock_or_recover(&self.inner);
        state
            .runs
            .values()
            .filter(|r| r.task_id == task_id && r.status.is_active())
            .count()
    }

    pub fn task_summary(&self, task_id: &str) -> TaskRuntimeSummary {
        let state = lock_or_recover(&self.inner);
        let mut active_run_ids: Vec<String> = state
            .runs
            .values()
            .filter(|r| r.task_id == task_id && r.status.is_active())
            .map(|r| r.run_id.clone())
            .collect();
        active_run_ids.sort();
        let last_run = state
            .runs
            .values()
            .filter(|r| r.task_id == task_id)
            .max_by_key(|r| r.started_at_unix_ms)
            .cloned();
        TaskRuntimeSummary {
            active_runs: active_run_ids.len(),
            active_run_ids,
            last_run,
        }
    }

    fn persist(&self, state: &StateFile) -> Result<(), StateError> {
        save_state_file(&self.path, state).map_err(|error| StateError::Persist(error.to_string()))
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn load_state_file(path: &Path) -> Result<StateFile> {
    if !path.exists() {
        return Ok(StateFile::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let state: StateFile = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(state)
}

fn save_state_file(path: &Path, state: &StateFile) -> Result<()> {
    let mut payload =
        serde_json::to_string_pretty(state).context("failed to serialize state file")?;
    payload.push('\n');
    write_text_atomic(path, &payload)
}

/// Reclassifies records left active by a previous incarnation. A run or
/// session cannot be re-attached across a restart (pid reuse, missing
/// child handle), so active records become failed/lost deterministically.
fn recover_lost_records(state: &mut StateFile) -> RecoveryReport {
    let now = current_unix_timestamp_ms();
    let mut report = RecoveryReport::default();
    for run in state.runs.values_mut() {
        if run.status.is_active() {
            run.status = RunStatus::Failed;
            run.error = Some(PROCESS_LOST_ERROR.to_string());
            run.error_code = Some(PROCESS_LOST_ERROR_CODE.to_string());
            run.ended_at_unix_ms = Some(now);
            report.recovered_runs += 1;
        }
    }
    for process in state.processes.values_mut() {
        if !process.status.is_terminal() {
            process.status = ProcessStatus::Lost;
            process.error = Some(PROCESS_LOST_ERROR.to_string());
            process.error_code = Some(PROCESS_LOST_ERROR_CODE.to_string());
            process.updated_at_unix_ms = now;
            process.ended_at_unix_ms = Some(now);
            report.recovered_processes += 1;
        }
    }
    report
}
