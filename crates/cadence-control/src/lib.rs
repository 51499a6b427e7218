//! Task control plane.
//!
//! Composes the task store, the durable run/process state store, the
//! process supervisor, and crontab reconciliation behind one facade.
//! Triggers are asynchronous: `run` acquires the per-task concurrency
//! lock, hands the execution to the supervisor, and returns with the
//! run already visible in the state store. Everything callers observe
//! afterwards comes from the state store, never from live OS handles.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use cadence_core::{current_unix_timestamp_ms, new_run_id, StoragePaths};
use cadence_cron::{desired_entries, CrontabBackend, CrontabSync, RunInvoker, SchedulerStatus, SyncReport};
use cadence_state::{RunEventLog, RunRecord, RunTrigger, StateError, StateStore, TaskRuntimeSummary};
use cadence_supervisor::{ExecutionRequest, ProcessSupervisor};
use cadence_task::{next_cron_due_unix_ms, render_path_template, TaskDefinition, TaskRecord, TaskStore};

#[cfg(test)]
mod tests;

const CONTEXT_FILE_SNIPPET_LIMIT: usize = 8_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    TaskNotFound(String),
    TaskInvalid {
        task_id: String,
        messages: Vec<String>,
    },
    TaskDisabled(String),
    AlreadyRunning {
        task_id: String,
        active: usize,
        limit: u32,
    },
    Internal(String),
}

impl TriggerError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "task_not_found",
            Self::TaskInvalid { .. } => "task_invalid",
            Self::TaskDisabled(_) => "task_disabled",
            Self::AlreadyRunning { .. } => "task_already_running",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl std::fmt::Display for TriggerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskNotFound(task_id) => write!(f, "task '{task_id}' was not found"),
            Self::TaskInvalid { task_id, messages } => {
                write!(f, "task '{task_id}' is invalid: {}", messages.join("; "))
            }
            Self::TaskDisabled(task_id) => {
                write!(f, "task '{task_id}' is disabled or paused")
            }
            Self::AlreadyRunning {
                task_id,
                active,
                limit,
            } => write!(
                f,
                "task '{task_id}' already has {active} active run(s) (limit {limit})"
            ),
            Self::Internal(message) => write!(f, "internal failure: {message}"),
        }
    }
}

impl std::error::Error for TriggerError {}

/// Accepted trigger: the run exists and the execution is under way.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunStarted {
    pub run_id: String,
    pub process_id: String,
    pub status: &'static str,
}

/// Aggregated per-task view for `status(id)`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub enabled: bool,
    pub paused: bool,
    pub valid: bool,
    pub diagnostics: Vec<String>,
    pub max_concurrency: u32,
    pub next_due_unix_ms: Option<u64>,
    pub runtime: TaskRuntimeSummary,
    pub backend_installed: bool,
}

pub struct ControlPlane {
    paths: StoragePaths,
    tasks: TaskStore,
    state: Arc<StateStore>,
    supervisor: ProcessSupervisor,
    crontab: CrontabSync,
    invoker: RunInvoker,
}

impl ControlPlane {
    /// Opens the stores under `paths`. The state store's recovery pass
    /// runs here, before any trigger can be accepted.
    pub fn open(
        paths: StoragePaths,
        backend: Box<dyn CrontabBackend>,
        invoker: RunInvoker,
    ) -> Result<Self> {
        let state = Arc::new(
            StateStore::open(paths.state_path()).context("failed to open run/process state")?,
        );
        let recovery = state.recovery_report();
        if recovery.recovered_runs > 0 || recovery.recovered_processes > 0 {
            info!(
                runs = recovery.recovered_runs,
                processes = recovery.recovered_processes,
                "reclassified records orphaned by a previous incarnation"
            );
        }
        Ok(Self {
            tasks: TaskStore::new(paths.tasks_dir()),
            supervisor: ProcessSupervisor::new(Arc::clone(&state), paths.clone()),
            crontab: CrontabSync::new(backend),
            state,
            invoker,
            paths,
        })
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Validates and persists a definition, then reconciles the
    /// crontab. A failed sync does not roll back the save; the next
    /// sync converges.
    pub fn save_task(&self, definition: &TaskDefinition) -> Result<TaskRecord> {
        let record = self.tasks.save(definition)?;
        if let Err(error) = self.sync() {
            warn!(task_id = %definition.metadata.id, %error, "crontab sync after save failed");
        }
        Ok(record)
    }

    /// Removes the definition only. The backend entry stays until the
    /// next sync observes it as no longer desired.
    pub fn delete_task(&self, task_id: &str) -> Result<bool> {
        self.tasks.delete(task_id)
    }

    pub fn pause_task(&self, task_id: &str) -> Result<TaskRecord, TriggerError> {
        self.set_paused(task_id, true)
    }

    pub fn resume_task(&self, task_id: &str) -> Result<TaskRecord, TriggerError> {
        self.set_paused(task_id, false)
    }

    fn set_paused(&self, task_id: &str, paused: bool) -> Result<TaskRecord, TriggerError> {
        let record = self.load_record(task_id)?;
        if !record.is_valid() {
            return Err(TriggerError::TaskInvalid {
                task_id: task_id.to_string(),
                messages: diagnostic_messages(&record),
            });
        }
        let mut definition = record.definition;
        definition.spec.paused = paused;
        self.save_task(&definition)
            .map_err(|error| TriggerError::Internal(error.to_string()))
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskRecord>> {
        self.tasks.list()
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        self.tasks.get(task_id)
    }

    /// Asynchronous trigger. Acquires the concurrency lock, spawns the
    /// execution, and returns without waiting for completion. A loser
    /// of the lock race observes `task_already_running` with no run id.
    pub fn run_task(&self, task_id: &str, trigger: RunTrigger) -> Result<RunStarted, TriggerError> {
        let record = self.load_record(task_id)?;
        if !record.is_valid() {
            return Err(TriggerError::TaskInvalid {
                task_id: task_id.to_string(),
                messages: diagnostic_messages(&record),
            });
        }
        if !record.definition.is_runnable() {
            return Err(TriggerError::TaskDisabled(task_id.to_string()));
        }

        let definition = &record.definition;
        let run_id = new_run_id();
        let events = self.run_event_log(definition, &run_id);
        let max_concurrency = definition.spec.schedule.max_concurrency;
        let mut pending = RunRecord::pending(&run_id, task_id, trigger);
        pending.trace_path = Some(events.path().display().to_string());
        match self.state.try_begin_run(pending, max_concurrency) {
            Ok(()) => {}
            Err(StateError::ConcurrencyExceeded { active, limit, .. }) => {
                return Err(TriggerError::AlreadyRunning {
                    task_id: task_id.to_string(),
                    active,
                    limit,
                });
            }
            Err(error) => return Err(TriggerError::Internal(error.to_string())),
        }
        events.append("run.started", json!({"trigger": trigger.as_str()}));

        let request = self.build_execution_request(definition, &run_id, events.clone());
        match self.supervisor.spawn(request) {
            Ok(spawned) => {
                info!(%task_id, %run_id, process_id = %spawned.process_id, trigger = trigger.as_str(), "run started");
                Ok(RunStarted {
                    run_id,
                    process_id: spawned.process_id,
                    status: "running",
                })
            }
            Err(error) => {
                self.state
                    .fail_pending_run(&run_id, &error.to_string(), "spawn_failed");
                events.append(
                    "run.failed",
                    json!({"error": error.to_string(), "error_code": "spawn_failed"}),
                );
                Err(TriggerError::Internal(error.to_string()))
            }
        }
    }

    pub fn task_status(&self, task_id: &str) -> Result<TaskStatusReport, TriggerError> {
        let record = self.load_record(task_id)?;
        let backend_installed = self
            .crontab
            .installed_entries()
            .map(|entries| entries.iter().any(|entry| entry.task_id == task_id))
            .unwrap_or(false);
        let next_due_unix_ms = record
            .definition
            .spec
            .schedule
            .cron
            .as_deref()
            .filter(|_| record.is_valid())
            .and_then(|expr| {
                next_cron_due_unix_ms(
                    expr,
                    &record.definition.spec.schedule.timezone,
                    current_unix_timestamp_ms(),
                )
                .ok()
            });
        Ok(TaskStatusReport {
            task_id: task_id.to_string(),
            enabled: record.definition.metadata.enabled,
            paused: record.definition.spec.paused,
            valid: record.is_valid(),
            diagnostics: diagnostic_messages(&record),
            max_concurrency: record.definition.spec.schedule.max_concurrency,
            next_due_unix_ms,
            runtime: self.state.task_summary(task_id),
            backend_installed,
        })
    }

    /// Reconciles the crontab managed block against the task store.
    pub fn sync(&self) -> Result<SyncReport> {
        let records = self.tasks.list().context("failed to list tasks for sync")?;
        let desired = desired_entries(&records, &self.invoker);
        self.crontab.sync(&desired)
    }

    pub fn scheduler_status(&self) -> Result<SchedulerStatus> {
        self.crontab.status()
    }

    fn load_record(&self, task_id: &str) -> Result<TaskRecord, TriggerError> {
        match self.tasks.get(task_id) {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(TriggerError::TaskNotFound(task_id.to_string())),
            Err(error) => Err(TriggerError::Internal(error.to_string())),
        }
    }

    fn run_event_log(&self, definition: &TaskDefinition, run_id: &str) -> RunEventLog {
        let relative = render_path_template(
            &definition.spec.logging.event_jsonl_path,
            &definition.metadata.id,
            run_id,
        );
        RunEventLog::new(
            self.paths.resolve_relative(&relative),
            run_id,
            definition.metadata.id.clone(),
            definition.spec.mode,
        )
    }

    fn build_execution_request(
        &self,
        definition: &TaskDefinition,
        run_id: &str,
        events: RunEventLog,
    ) -> ExecutionRequest {
        let task_id = &definition.metadata.id;
        let prompt = self.prepare_prompt(definition);
        let working_directory = self
            .paths
            .resolve_relative(&definition.spec.execution.working_directory);
        let output_relative =
            render_path_template(&definition.spec.output.path_template, task_id, run_id);
        ExecutionRequest {
            task_id: Some(task_id.clone()),
            run_id: Some(run_id.to_string()),
            mode: definition.spec.mode,
            prompt,
            working_directory,
            timeout_seconds: definition.spec.execution.timeout_seconds,
            logging: definition.spec.logging.clone(),
            agent: definition.spec.mode_config.agent.clone(),
            llm: definition.spec.mode_config.llm.clone(),
            output_path: Some(self.paths.resolve_relative(&output_relative)),
            events: Some(events),
        }
    }

    /// Renders `{variable}` placeholders and appends context-file
    /// snippets, truncated per file.
    fn prepare_prompt(&self, definition: &TaskDefinition) -> String {
        let input = &definition.spec.input;
        let mut prompt = input.prompt.clone();
        for (key, value) in &input.variables {
            prompt = prompt.replace(&format!("{{{key}}}"), value);
        }

        let mut snippets = Vec::new();
        for item in &input.context_files {
            let path: PathBuf = self.paths.resolve_relative(item);
            if !path.is_file() {
                continue;
            }
            let snippet = match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let mut text = text;
                    if text.len() > CONTEXT_FILE_SNIPPET_LIMIT {
                        let mut cut = CONTEXT_FILE_SNIPPET_LIMIT;
                        while !text.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        text.truncate(cut);
                    }
                    text
                }
                Err(_) => "<unreadable>".to_string(),
            };
            snippets.push(format!("\n--- file:{item} ---\n{snippet}"));
        }
        if !snippets.is_empty() {
            prompt.push_str("\n\n[Context Files]");
            for snippet in snippets {
                prompt.push_str(&snippet);
            }
        }
        prompt
    }
}

fn diagnostic_messages(record: &TaskRecord) -> Vec<String> {
    record
        .diagnostics
        .iter()
        .map(|diagnostic| format!("{}: {}", diagnostic.field, diagnostic.message))
        .collect()
}
