//! Task definitions, validation, and the durable task store.
//!
//! A task is one JSON document under `tasks/<id>.json`. Definitions are
//! deserialized with defaults filled in, then validated into a list of
//! field-addressed diagnostics before anything is persisted.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::TimeZone;
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use cadence_core::{is_slug, write_text_atomic};


pub const TASK_API_VERSION: &str = "cron-agent/v1";
pub const TASK_KIND: &str = "CronTask";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub spec: TaskSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Tasks are born enabled whether they arrive over the wire or are built
// in code; a derived Default would flip `enabled` off for the latter.
impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default)]
    pub mode: TaskMode,
    #[serde(default)]
    pub paused: bool,
    #[serde(default = "default_run_backend")]
    pub run_backend: String,
    #[serde(default)]
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub input: InputSpec,
    #[serde(default)]
    pub execution: ExecutionSpec,
    #[serde(default)]
    pub mode_config: ModeConfig,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub logging: LoggingSpec,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Agent,
    #[default]
    Llm,
}

impl TaskMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Llm => "llm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_misfire_policy")]
    pub misfire_policy: String,
    /// Legacy interval scheduling; always rejected by validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<u64>,
}

impl Default for ScheduleSpec {
    fn default() -> Self {
        Self {
            cron: None,
            timezone: default_timezone(),
            max_concurrency: default_max_concurrency(),
            misfire_policy: default_misfire_policy(),
            interval_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSpec {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    #[serde(default)]
    pub retry: RetrySpec,
}

impl Default for ExecutionSpec {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            working_directory: default_working_directory(),
            retry: RetrySpec::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_seconds: u64,
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_seconds: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModeConfig {
    #[serde(default)]
    pub agent: AgentModeConfig,
    #[serde(default)]
    pub llm: LlmModeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentModeConfig {
    #[serde(default = "default_agent_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_sandbox_mode")]
    pub sandbox_mode: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub cli_args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Legacy free-form command template; forbidden and rejected by
    /// validation whenever present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_template: Option<String>,
}

impl Default for AgentModeConfig {
    fn default() -> Self {
        Self {
            provider: default_agent_provider(),
            model: String::new(),
            sandbox_mode: default_sandbox_mode(),
            system_prompt: String::new(),
            cli_args: Vec::new(),
            env: BTreeMap::new(),
            command_template: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LlmModeConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_api_base")]
    pub api_base: String,
    #[serde(default = "default_llm_auth_ref")]
    pub auth_ref: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f64,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
}

impl Default for LlmModeConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            api_base: default_llm_api_base(),
            auth_ref: default_llm_auth_ref(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    #[serde(default = "default_output_sink")]
    pub sink: String,
    #[serde(default = "default_output_format")]
    pub format: String,
    #[serde(default = "default_output_path_template")]
    pub path_template: String,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            sink: default_output_sink(),
            format: default_output_format(),
            path_template: default_output_path_template(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggingSpec {
    #[serde(default = "default_true")]
    pub save_prompt: bool,
    #[serde(default = "default_true")]
    pub save_stdout: bool,
    #[serde(default = "default_true")]
    pub save_stderr: bool,
    /// Run-lifecycle event log destination, `{task_id}`/`{run_id}`/`{date}`
    /// placeholders allowed.
    #[serde(default = "default_event_jsonl_path")]
    pub event_jsonl_path: String,
}

impl Default for LoggingSpec {
    fn default() -> Self {
        Self {
            save_prompt: true,
            save_stdout: true,
            save_stderr: true,
            event_jsonl_path: default_event_jsonl_path(),
        }
    }
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            mode: TaskMode::default(),
            paused: false,
            run_backend: default_run_backend(),
            schedule: ScheduleSpec::default(),
            input: InputSpec::default(),
            execution: ExecutionSpec::default(),
            mode_config: ModeConfig::default(),
            output: OutputSpec::default(),
            logging: LoggingSpec::default(),
        }
    }
}

impl Default for TaskDefinition {
    fn default() -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: TaskMetadata::default(),
            spec: TaskSpec::default(),
        }
    }
}

impl TaskDefinition {
    /// True when the task may be triggered: enabled and not paused.
    pub fn is_runnable(&self) -> bool {
        self.metadata.enabled && !self.spec.paused
    }
}

fn default_api_version() -> String {
    TASK_API_VERSION.to_string()
}

fn default_kind() -> String {
    TASK_KIND.to_string()
}

fn default_true() -> bool {
    true
}

fn default_run_backend() -> String {
    "cron".to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_misfire_policy() -> String {
    "run_once".to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_working_directory() -> String {
    ".".to_string()
}

fn default_max_attempts() -> u32 {
    1
}

fn default_agent_provider() -> String {
    "codex".to_string()
}

fn default_sandbox_mode() -> String {
    "workspace-write".to_string()
}

fn default_llm_provider() -> String {
    "openai_compatible".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_api_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_auth_ref() -> String {
    "env:OPENAI_API_KEY".to_string()
}

fn default_llm_temperature() -> f64 {
    0.2
}

fn default_llm_max_tokens() -> u32 {
    4_000
}

fn default_output_sink() -> String {
    "file".to_string()
}

fn default_output_format() -> String {
    "markdown".to_string()
}

fn default_output_path_template() -> String {
    "artifacts/{task_id}/{run_id}/result.md".to_string()
}

fn default_event_jsonl_path() -> String {
    "logs/runs/{date}.jsonl".to_string()
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskDiagnostic {
    pub field: String,
    pub reason_code: String,
    pub message: String,
}

impl TaskDiagnostic {
    fn new(field: &str, reason_code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            reason_code: reason_code.to_string(),
            message: message.into(),
        }
    }
}

/// Validates a definition into field-addressed diagnostics. An empty
/// result means the task may be persisted and scheduled.
pub fn validate_task(task: &TaskDefinition) -> Vec<TaskDiagnostic> {
    let mut diagnostics = Vec::new();

    if task.api_version != TASK_API_VERSION {
        diagnostics.push(TaskDiagnostic::new(
            "apiVersion",
            "api_version_unsupported",
            format!("apiVersion must be {TASK_API_VERSION}"),
        ));
    }
    if task.kind != TASK_KIND {
        diagnostics.push(TaskDiagnostic::new(
            "kind",
            "kind_unsupported",
            format!("kind must be {TASK_KIND}"),
        ));
    }

    let task_id = task.metadata.id.trim();
    if task_id.is_empty() {
        diagnostics.push(TaskDiagnostic::new(
            "metadata.id",
            "id_missing",
            "metadata.id is required",
        ));
    } else if !is_slug(task_id) {
        diagnostics.push(TaskDiagnostic::new(
            "metadata.id",
            "id_not_slug",
            "metadata.id must be a lowercase slug of [a-z0-9_-]",
        ));
    }

    if task.spec.run_backend != "cron" {
        diagnostics.push(TaskDiagnostic::new(
            "spec.runBackend",
            "run_backend_unsupported",
            "spec.runBackend must be cron; the interval/tmux loop backend is retired",
        ));
    }
    if task.spec.schedule.interval_seconds.is_some() {
        diagnostics.push(TaskDiagnostic::new(
            "spec.schedule.intervalSeconds",
            "interval_schedule_retired",
            "interval scheduling is retired; declare spec.schedule.cron instead",
        ));
    }

    match task.spec.schedule.cron.as_deref().map(str::trim) {
        None | Some("") => diagnostics.push(TaskDiagnostic::new(
            "spec.schedule.cron",
            "cron_missing",
            "spec.schedule.cron is required when runBackend=cron",
        )),
        Some(expr) => {
            if let Err(error) = parse_cron_expression(expr) {
                diagnostics.push(TaskDiagnostic::new(
                    "spec.schedule.cron",
                    "cron_invalid",
                    error.to_string(),
                ));
            }
        }
    }

    if task.spec.schedule.timezone.parse::<Tz>().is_err() {
        diagnostics.push(TaskDiagnostic::new(
            "spec.schedule.timezone",
            "timezone_invalid",
            format!("unknown timezone '{}'", task.spec.schedule.timezone),
        ));
    }

    if task.spec.schedule.max_concurrency == 0 {
        diagnostics.push(TaskDiagnostic::new(
            "spec.schedule.maxConcurrency",
            "max_concurrency_invalid",
            "spec.schedule.maxConcurrency must be at least 1",
        ));
    }

    if task.spec.schedule.misfire_policy != "run_once" {
        diagnostics.push(TaskDiagnostic::new(
            "spec.schedule.misfirePolicy",
            "misfire_policy_unsupported",
            "spec.schedule.misfirePolicy supports run_once only",
        ));
    }

    if task.spec.execution.timeout_seconds == 0 {
        diagnostics.push(TaskDiagnostic::new(
            "spec.execution.timeoutSeconds",
            "timeout_invalid",
            "spec.execution.timeoutSeconds must be at least 1",
        ));
    }
    if task.spec.execution.retry.max_attempts == 0 {
        diagnostics.push(TaskDiagnostic::new(
            "spec.execution.retry.maxAttempts",
            "retry_attempts_invalid",
            "spec.execution.retry.maxAttempts must be at least 1",
        ));
    }

    if task.spec.mode == TaskMode::Agent && task.spec.mode_config.agent.command_template.is_some() {
        diagnostics.push(TaskDiagnostic::new(
            "spec.modeConfig.agent.commandTemplate",
            "command_template_forbidden",
            "free-form agent command templates are forbidden; configure provider/model/sandboxMode",
        ));
    }

    diagnostics
}

/// Validates and returns the task, or an error naming every offending field.
pub fn ensure_valid(task: &TaskDefinition) -> Result<()> {
    let diagnostics = validate_task(task);
    if diagnostics.is_empty() {
        return Ok(());
    }
    let summary = diagnostics
        .iter()
        .map(|d| format!("{}: {}", d.field, d.message))
        .collect::<Vec<_>>()
        .join("; ");
    bail!("invalid task definition: {summary}");
}

/// Parses a 5-field cron expression. The `cron` crate wants a seconds
/// field, so a zero-seconds column is prepended before parsing.
pub fn parse_cron_expression(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        bail!("cron expression '{expr}' must have exactly 5 fields, found {fields}");
    }
    Schedule::from_str(&format!("0 {expr}"))
        .with_context(|| format!("invalid cron expression '{expr}'"))
}

/// Computes the next due time in unix ms after `from_unix_ms` for a
/// 5-field cron expression in the given timezone.
pub fn next_cron_due_unix_ms(expr: &str, timezone: &str, from_unix_ms: u64) -> Result<u64> {
    let schedule = parse_cron_expression(expr)?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| anyhow!("invalid timezone '{timezone}'"))?;
    let from = tz
        .timestamp_millis_opt(i64::try_from(from_unix_ms).unwrap_or(i64::MAX))
        .single()
        .ok_or_else(|| anyhow!("invalid from timestamp for cron schedule"))?;
    let next = schedule
        .after(&from)
        .next()
        .ok_or_else(|| anyhow!("cron expression '{expr}' has no future occurrence"))?;
    Ok(u64::try_from(next.timestamp_millis()).unwrap_or(u64::MAX))
}

/// Renders `{task_id}`/`{run_id}`/`{date}` placeholders in an output or
/// log path template.
pub fn render_path_template(template: &str, task_id: &str, run_id: &str) -> String {
    let date = chrono::Local::now().format("%Y-%m-%d").to_string();
    template
        .replace("{task_id}", task_id)
        .replace("{run_id}", run_id)
        .replace("{date}", &date)
}

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub path: PathBuf,
    pub definition: TaskDefinition,
    pub diagnostics: Vec<TaskDiagnostic>,
}

impl TaskRecord {
    /// Builds an unsaved record, validating the definition in place.
    pub fn from_definition(definition: TaskDefinition) -> Self {
        let diagnostics = validate_task(&definition);
        Self {
            path: PathBuf::new(),
            definition,
            diagnostics,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// Durable task store: one JSON definition per task id.
#[derive(Debug, Clone)]
pub struct TaskStore {
    tasks_dir: PathBuf,
}

impl TaskStore {
    pub fn new(tasks_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: tasks_dir.into(),
        }
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir.join(format!("{task_id}.json"))
    }

    /// Lists every stored definition, valid or not, sorted by id.
    pub fn list(&self) -> Result<Vec<TaskRecord>> {
        if !self.tasks_dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in std::fs::read_dir(&self.tasks_dir)
            .with_context(|| format!("failed to read {}", self.tasks_dir.display()))?
        {
            let entry = entry
                .with_context(|| format!("failed to read entry in {}", self.tasks_dir.display()))?;
            let path = entry.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            records.push(self.load_record(&path));
        }
        records.sort_by(|a, b| a.definition.metadata.id.cmp(&b.definition.metadata.id));
        Ok(records)
    }

    pub fn get(&self, task_id: &str) -> Result<Option<TaskRecord>> {
        let path = self.task_path(task_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.load_record(&path)))
    }

    /// Validates then persists atomically; invalid definitions are never
    /// written.
    pub fn save(&self, task: &TaskDefinition) -> Result<TaskRecord> {
        ensure_valid(task)?;
        let path = self.task_path(&task.metadata.id);
        let mut payload =
            serde_json::to_string_pretty(task).context("failed to serialize task definition")?;
        payload.push('\n');
        write_text_atomic(&path, &payload)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(TaskRecord {
            path,
            definition: task.clone(),
            diagnostics: Vec::new(),
        })
    }

    /// Removes the definition file only; returns false for unknown ids.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        let path = self.task_path(task_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(true)
    }

    fn load_record(&self, path: &Path) -> TaskRecord {
        let stem = path
            .file_stem()
            .and_then(|v| v.to_str())
            .unwrap_or_default()
            .to_string();
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| {
                serde_json::from_str::<TaskDefinition>(&raw).map_err(anyhow::Error::from)
            }) {
            Ok(definition) => {
                let mut diagnostics = validate_task(&definition);
                if definition.metadata.id != stem {
                    diagnostics.push(TaskDiagnostic::new(
                        "metadata.id",
                        "id_file_mismatch",
                        format!(
                            "metadata.id '{}' does not match file name '{stem}'",
                            definition.metadata.id
                        ),
                    ));
                }
                TaskRecord {
                    path: path.to_path_buf(),
                    definition,
                    diagnostics,
                }
            }
            Err(error) => {
                let mut definition = TaskDefinition::default();
                definition.metadata.id = stem;
                definition.metadata.enabled = false;
                TaskRecord {
                    path: path.to_path_buf(),
                    definition,
                    diagnostics: vec![TaskDiagnostic::new(
                        "",
                        "definition_malformed",
                        error.to_string(),
                    )],
                }
            }
        }
    }
}
