//! Process supervisor: spawns mode-specific executions, streams their
//! output into per-process JSONL logs, enforces timeouts, and pushes
//! every lifecycle transition into the state store.
//!
//! Callers never touch the live OS handle. `poll`/`log` read persisted
//! state; `write`/`submit`/`kill` hand data to the OS through a small
//! in-memory session registry and return without waiting for the task.
//! Each spawned execution gets one waiter thread that owns the child
//! handle and is the only writer of that process's terminal state.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use cadence_core::{append_jsonl_line, current_unix_timestamp_ms, new_process_id, StoragePaths};
use cadence_state::{ProcessRecord, ProcessStatus, RunEventLog, RunStatus, StateStore};
use cadence_task::{AgentModeConfig, LlmModeConfig, LoggingSpec, TaskMode};


const WAITER_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TERM_GRACE_PERIOD: Duration = Duration::from_millis(300);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub const ERROR_CODE_TIMEOUT: &str = "timeout";
pub const ERROR_CODE_SPAWN_FAILED: &str = "spawn_failed";
pub const ERROR_CODE_EXIT_NONZERO: &str = "exit_nonzero";
pub const ERROR_CODE_EMPTY_OUTPUT: &str = "empty_output";
pub const ERROR_CODE_KILLED: &str = "killed";
pub const ERROR_CODE_AUTH_MISSING: &str = "auth_missing";
pub const ERROR_CODE_LLM_ERROR: &str = "llm_error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    ProcessNotFound(String),
    ProcessNotWritable {
        process_id: String,
        detail: String,
    },
    SignalFailed {
        process_id: String,
        error: String,
    },
    State(String),
}

impl SupervisorError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProcessNotFound(_) => "process_not_found",
            Self::ProcessNotWritable { .. } => "process_not_writable",
            Self::SignalFailed { .. } => "signal_failed",
            Self::State(_) => "state_error",
        }
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ProcessNotFound(process_id) => {
                write!(f, "process '{process_id}' was not found")
            }
            Self::ProcessNotWritable { process_id, detail } => {
                write!(f, "process '{process_id}' is not writable: {detail}")
            }
            Self::SignalFailed { process_id, error } => {
                write!(f, "failed to signal process '{process_id}': {error}")
            }
            Self::State(message) => write!(f, "state store failure: {message}"),
        }
    }
}

impl std::error::Error for SupervisorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    Term,
    Kill,
}

impl KillSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "TERM" | "SIGTERM" => Some(Self::Term),
            "KILL" | "SIGKILL" => Some(Self::Kill),
            _ => None,
        }
    }

    fn raw(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }
}

/// Everything the supervisor needs to run one execution. The control
/// plane resolves the task definition into this shape; ad-hoc callers
/// can build one without a task id.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: Option<String>,
    pub run_id: Option<String>,
    pub mode: TaskMode,
    pub prompt: String,
    pub working_directory: PathBuf,
    pub timeout_seconds: u64,
    pub logging: LoggingSpec,
    pub agent: AgentModeConfig,
    pub llm: LlmModeConfig,
    pub output_path: Option<PathBuf>,
    /// Run-lifecycle event destination; absent for ad-hoc executions.
    pub events: Option<RunEventLog>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SpawnedExecution {
    pub process_id: String,
    pub run_id: Option<String>,
}

/// One page of a process's append-only JSONL log. `eof` turns true only
/// once the process is terminal and the cursor has consumed every item;
/// re-reading an earlier offset returns the same items again.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LogPage {
    pub process_id: String,
    pub items: Vec<Value>,
    pub next_offset: usize,
    pub eof: bool,
}

struct SessionHandle {
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
    interactive: bool,
    log: Arc<SessionLog>,
}

/// Sequenced JSONL writer shared by the reader, waiter, and stdin paths.
struct SessionLog {
    path: PathBuf,
    process_id: String,
    task_id: Option<String>,
    run_id: Option<String>,
    mode: &'static str,
    provider: String,
    seq: Mutex<u64>,
}

impl SessionLog {
    fn append(&self, channel: &str, payload: Value) {
        let mut seq = lock_or_recover(&self.seq);
        *seq += 1;
        let mut row = json!({
            "seq": *seq,
            "ts": current_unix_timestamp_ms(),
            "process_id": self.process_id,
            "task_id": self.task_id,
            "run_id": self.run_id,
            "mode": self.mode,
            "provider": self.provider,
            "channel": channel,
        });
        if let (Some(row_map), Some(payload_map)) = (row.as_object_mut(), payload.as_object()) {
            for (key, value) in payload_map {
                row_map.insert(key.clone(), value.clone());
            }
        }
        let line = row.to_string();
        if let Err(error) = append_jsonl_line(&self.path, &line) {
            warn!(process_id = %self.process_id, %error, "failed to append process log row");
        }
    }
}

#[derive(Default)]
struct OutputBuffer {
    text: String,
    bytes: u64,
}

struct SessionBuffers {
    stdout: Mutex<OutputBuffer>,
    stderr: Mutex<OutputBuffer>,
}

/// Supervises process sessions for one storage root.
pub struct ProcessSupervisor {
    state: Arc<StateStore>,
    paths: StoragePaths,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
}

impl ProcessSupervisor {
    pub fn new(state: Arc<StateStore>, paths: StoragePaths) -> Self {
        Self {
            state,
            paths,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    /// Allocates a process id, persists the starting record, and hands
    /// the execution to a background driver. Returns as soon as the
    /// driver owns the session; it never waits for completion.
    pub fn spawn(&self, request: ExecutionRequest) -> Result<SpawnedExecution> {
        let process_id = new_process_id();
        let log_path = self.paths.process_log_path(&process_id);
        let (provider, model, interactive) = match request.mode {
            TaskMode::Agent => (request.agent.provider.clone(), request.agent.model.clone(), true),
            TaskMode::Llm => (request.llm.provider.clone(), request.llm.model.clone(), false),
        };
        let now = current_unix_timestamp_ms();
        let record = ProcessRecord {
            process_id: process_id.clone(),
            run_id: request.run_id.clone(),
            task_id: request.task_id.clone(),
            mode: request.mode,
            provider: provider.clone(),
            model,
            status: ProcessStatus::Starting,
            pid: None,
            interactive,
            timeout_seconds: request.timeout_seconds.max(1),
            started_at_unix_ms: now,
            updated_at_unix_ms: now,
            ended_at_unix_ms: None,
            returncode: None,
            error: None,
            error_code: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            log_path: log_path.display().to_string(),
        };
        self.state
            .insert_process(record)
            .map_err(|error| SupervisorError::State(error.to_string()))
            .context("failed to persist starting process record")?;

        let log = Arc::new(SessionLog {
            path: log_path,
            process_id: process_id.clone(),
            task_id: request.task_id.clone(),
            run_id: request.run_id.clone(),
            mode: request.mode.as_str(),
            provider,
            seq: Mutex::new(0),
        });

        let run_id = request.run_id.clone();
        match request.mode {
            TaskMode::Agent => self.spawn_agent(process_id.clone(), request, log)?,
            TaskMode::Llm => self.spawn_llm(process_id.clone(), request, log),
        }
        Ok(SpawnedExecution { process_id, run_id })
    }

    fn spawn_agent(
        &self,
        process_id: String,
        request: ExecutionRequest,
        log: Arc<SessionLog>,
    ) -> Result<()> {
        let final_prompt = compose_agent_prompt(&request.agent.system_prompt, &request.prompt);
        let argv = build_agent_command(&request.agent, &final_prompt);
        if request.logging.save_prompt {
            log.append(
                "stdin",
                json!({"io": "write", "transport": "argv_prompt", "content": final_prompt}),
            );
        }

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .current_dir(&request.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (key, value) in &request.agent.env {
            command.env(key, value);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(error) => {
                log.append("process", json!({"event": "error", "error": error.to_string()}));
                self.finalize(
                    &process_id,
                    request.run_id.as_deref(),
                    ProcessStatus::Exited,
                    None,
                    Some(&format!("failed to spawn '{}': {error}", argv[0])),
                    ERROR_CODE_SPAWN_FAILED,
                    0,
                    0,
                    request.events.as_ref(),
                );
                return Ok(());
            }
        };

        let pid = child.id();
        log.append(
            "process",
            json!({"event": "start", "command": argv, "cwd": request.working_directory.display().to_string(), "pid": pid}),
        );
        if let Err(error) = self.state.mark_process_running(&process_id, Some(pid)) {
            warn!(%process_id, %error, "failed to mark process running");
        }
        if let Some(run_id) = request.run_id.as_deref() {
            if let Err(error) = self.state.mark_run_running(run_id, &process_id) {
                warn!(%run_id, %error, "failed to mark run running");
            }
        }
        if let Some(events) = request.events.as_ref() {
            events.append("executor.started", json!({"pid": pid, "process_id": process_id}));
        }

        let buffers = Arc::new(SessionBuffers {
            stdout: Mutex::new(OutputBuffer::default()),
            stderr: Mutex::new(OutputBuffer::default()),
        });
        let mut reader_handles = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            reader_handles.push(spawn_output_reader(
                stdout,
                "stdout",
                Arc::clone(&log),
                Arc::clone(&buffers),
                request.logging.save_stdout,
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            reader_handles.push(spawn_output_reader(
                stderr,
                "stderr",
                Arc::clone(&log),
                Arc::clone(&buffers),
                request.logging.save_stderr,
            ));
        }
        let stdin = child.stdin.take();

        {
            let mut sessions = lock_or_recover(&self.sessions);
            sessions.insert(
                process_id.clone(),
                SessionHandle {
                    stdin,
                    pid: Some(pid),
                    interactive: true,
                    log: Arc::clone(&log),
                },
            );
        }

        let waiter = AgentWaiter {
            state: Arc::clone(&self.state),
            sessions: Arc::clone(&self.sessions),
            process_id,
            run_id: request.run_id,
            child,
            pid,
            log,
            buffers,
            reader_handles,
            timeout: Duration::from_secs(request.timeout_seconds.max(1)),
            output_path: request.output_path,
            events: request.events,
        };
        let _ = thread::Builder::new()
            .name("cadence-agent-waiter".to_string())
            .spawn(move || waiter.run());
        Ok(())
    }

    fn spawn_llm(&self, process_id: String, request: ExecutionRequest, log: Arc<SessionLog>) {
        {
            let mut sessions = lock_or_recover(&self.sessions);
            sessions.insert(
                process_id.clone(),
                SessionHandle {
                    stdin: None,
                    pid: None,
                    interactive: false,
                    log: Arc::clone(&log),
                },
            );
        }
        if let Err(error) = self.state.mark_process_running(&process_id, None) {
            warn!(%process_id, %error, "failed to mark process running");
        }
        if let Some(run_id) = request.run_id.as_deref() {
            if let Err(error) = self.state.mark_run_running(run_id, &process_id) {
                warn!(%run_id, %error, "failed to mark run running");
            }
        }
        if request.logging.save_prompt {
            log.append(
                "stdin",
                json!({"io": "write", "transport": "chat_completion", "content": request.prompt}),
            );
        }
        log.append("process", json!({"event": "start", "mode": "llm"}));

        let state = Arc::clone(&self.state);
        let sessions = Arc::clone(&self.sessions);
        let _ = thread::Builder::new()
            .name("cadence-llm-driver".to_string())
            .spawn(move || {
                let started = Instant::now();
                let outcome = execute_llm_request(&request.llm, &request.prompt, request.timeout_seconds);
                let elapsed = started.elapsed().as_secs_f64();
                let (status, returncode, text, error, error_code, stdout_bytes) = match outcome {
                    Ok(text) => {
                        let bytes = text.len() as u64;
                        if request.logging.save_stdout {
                            log.append(
                                "stdout",
                                json!({"io": "chunk", "content": text, "bytes": bytes}),
                            );
                        }
                        log.append(
                            "process",
                            json!({"event": "exit", "returncode": 0, "elapsed_seconds": elapsed}),
                        );
                        (ProcessStatus::Exited, Some(0), Some(text), None, None, bytes)
                    }
                    Err(failure) => {
                        log.append(
                            "process",
                            json!({"event": "error", "error": failure.message, "elapsed_seconds": elapsed}),
                        );
                        let status = if failure.code == ERROR_CODE_TIMEOUT {
                            ProcessStatus::Killed
                        } else {
                            ProcessStatus::Exited
                        };
                        (status, None, None, Some(failure.message), Some(failure.code), 0)
                    }
                };

                finalize_session(
                    &state,
                    &process_id,
                    request.run_id.as_deref(),
                    status,
                    returncode,
                    error.as_deref(),
                    error_code,
                    stdout_bytes,
                    0,
                    text.as_deref(),
                    request.output_path.as_deref(),
                    request.events.as_ref(),
                );
                lock_or_recover(&sessions).remove(&process_id);
            });
    }

    /// Non-blocking status read from the state store.
    pub fn poll(&self, process_id: &str) -> Result<ProcessRecord, SupervisorError> {
        self.state
            .get_process(process_id)
            .ok_or_else(|| SupervisorError::ProcessNotFound(process_id.to_string()))
    }

    /// Blocks until the process reaches a terminal status or the
    /// deadline passes; returns the latest record either way.
    pub fn wait(
        &self,
        process_id: &str,
        timeout: Option<Duration>,
    ) -> Result<ProcessRecord, SupervisorError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let record = self.poll(process_id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(record);
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Reads a page of log items by line offset. Offsets are stable;
    /// `eof` is reported only once the process is terminal and no items
    /// remain past the returned page.
    pub fn read_log(
        &self,
        process_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<LogPage, SupervisorError> {
        let record = self.poll(process_id)?;
        let terminal = record.status.is_terminal();
        let content = std::fs::read_to_string(&record.log_path).unwrap_or_default();
        let mut items = Vec::new();
        let mut total = 0usize;
        let limit = limit.max(1);
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            total += 1;
            if total <= offset || items.len() >= limit {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(row) => items.push(row),
                Err(_) => items.push(json!({"raw": line})),
            }
        }
        let next_offset = offset.min(total) + items.len();
        Ok(LogPage {
            process_id: process_id.to_string(),
            eof: terminal && next_offset >= total,
            next_offset,
            items,
        })
    }

    /// Forwards raw bytes to the process stdin. `submit` appends a
    /// trailing newline; `write` sends the data untouched.
    pub fn write_stdin(
        &self,
        process_id: &str,
        data: &str,
        submit: bool,
    ) -> Result<usize, SupervisorError> {
        let record = self.poll(process_id)?;
        if record.status.is_terminal() {
            return Err(SupervisorError::ProcessNotWritable {
                process_id: process_id.to_string(),
                detail: format!("process already {}", record.status.as_str()),
            });
        }
        if !record.interactive {
            return Err(SupervisorError::ProcessNotWritable {
                process_id: process_id.to_string(),
                detail: "process is not interactive".to_string(),
            });
        }

        let payload = if submit {
            format!("{data}\n")
        } else {
            data.to_string()
        };
        let mut sessions = lock_or_recover(&self.sessions);
        let handle = sessions
            .get_mut(process_id)
            .ok_or_else(|| SupervisorError::ProcessNotFound(process_id.to_string()))?;
        let stdin = handle
            .stdin
            .as_mut()
            .ok_or_else(|| SupervisorError::ProcessNotWritable {
                process_id: process_id.to_string(),
                detail: "stdin channel unavailable".to_string(),
            })?;
        let result = stdin
            .write_all(payload.as_bytes())
            .and_then(|()| stdin.flush());
        match result {
            Ok(()) => {
                handle.log.append(
                    "stdin",
                    json!({"io": "write", "transport": "pipe", "content": payload, "bytes": payload.len()}),
                );
                Ok(payload.len())
            }
            Err(error) => {
                handle
                    .log
                    .append("stdin", json!({"io": "error", "error": error.to_string()}));
                Err(SupervisorError::ProcessNotWritable {
                    process_id: process_id.to_string(),
                    detail: error.to_string(),
                })
            }
        }
    }

    /// Requests termination. The waiter thread observes the exit and
    /// records the terminal status; this call does not mark anything.
    pub fn kill(&self, process_id: &str, signal: KillSignal) -> Result<(), SupervisorError> {
        let record = self.poll(process_id)?;
        if record.status.is_terminal() {
            return Ok(());
        }
        let sessions = lock_or_recover(&self.sessions);
        let handle = sessions
            .get(process_id)
            .ok_or_else(|| SupervisorError::ProcessNotFound(process_id.to_string()))?;
        let Some(pid) = handle.pid else {
            return Err(SupervisorError::SignalFailed {
                process_id: process_id.to_string(),
                error: "process has no OS pid".to_string(),
            });
        };
        kill_process_group(pid, signal.raw()).map_err(|error| SupervisorError::SignalFailed {
            process_id: process_id.to_string(),
            error: error.to_string(),
        })?;
        handle
            .log
            .append("process", json!({"event": "kill", "signal": signal.as_str()}));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        process_id: &str,
        run_id: Option<&str>,
        status: ProcessStatus,
        returncode: Option<i32>,
        error: Option<&str>,
        error_code: &str,
        stdout_bytes: u64,
        stderr_bytes: u64,
        events: Option<&RunEventLog>,
    ) {
        finalize_session(
            &self.state,
            process_id,
            run_id,
            status,
            returncode,
            error,
            Some(error_code),
            stdout_bytes,
            stderr_bytes,
            None,
            None,
            events,
        );
        lock_or_recover(&self.sessions).remove(process_id);
    }
}

struct AgentWaiter {
    state: Arc<StateStore>,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    process_id: String,
    run_id: Option<String>,
    child: Child,
    pid: u32,
    log: Arc<SessionLog>,
    buffers: Arc<SessionBuffers>,
    reader_handles: Vec<thread::JoinHandle<()>>,
    timeout: Duration,
    output_path: Option<PathBuf>,
    events: Option<RunEventLog>,
}

impl AgentWaiter {
    fn run(mut self) {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut timed_out = false;
        let exit_status = loop {
            match self.child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {}
                Err(error) => {
                    warn!(process_id = %self.process_id, %error, "child polling failed");
                    break None;
                }
            }
            if Instant::now() >= deadline {
                timed_out = true;
                let _ = kill_process_group(self.pid, libc::SIGTERM);
                thread::sleep(TERM_GRACE_PERIOD);
                if matches!(self.child.try_wait(), Ok(None)) {
                    let _ = kill_process_group(self.pid, libc::SIGKILL);
                }
                break self.child.wait().ok();
            }
            thread::sleep(WAITER_POLL_INTERVAL);
        };

        // Readers drain to EOF once the child is gone.
        for handle in self.reader_handles.drain(..) {
            let _ = handle.join();
        }
        let (stdout_text, stdout_bytes) = {
            let buffer = lock_or_recover(&self.buffers.stdout);
            (buffer.text.trim().to_string(), buffer.bytes)
        };
        let (stderr_text, stderr_bytes) = {
            let buffer = lock_or_recover(&self.buffers.stderr);
            (buffer.text.trim().to_string(), buffer.bytes)
        };
        let elapsed = started.elapsed().as_secs_f64();

        let (status, returncode, error, error_code, output) = if timed_out {
            self.log
                .append("process", json!({"event": "timeout", "elapsed_seconds": elapsed}));
            let timeout_seconds = self.timeout.as_secs();
            (
                ProcessStatus::Killed,
                exit_status.and_then(|s| s.code()),
                Some(format!("process timeout after {timeout_seconds}s")),
                Some(ERROR_CODE_TIMEOUT),
                None,
            )
        } else {
            let returncode = exit_status.and_then(|s| s.code());
            self.log.append(
                "process",
                json!({"event": "exit", "returncode": returncode, "elapsed_seconds": elapsed}),
            );
            match returncode {
                Some(0) => {
                    let output = if stdout_text.is_empty() {
                        stderr_text.clone()
                    } else {
                        stdout_text
                    };
                    if output.is_empty() {
                        (
                            ProcessStatus::Exited,
                            Some(0),
                            Some("empty agent response".to_string()),
                            Some(ERROR_CODE_EMPTY_OUTPUT),
                            None,
                        )
                    } else {
                        (ProcessStatus::Exited, Some(0), None, None, Some(output))
                    }
                }
                Some(code) => (
                    ProcessStatus::Exited,
                    Some(code),
                    Some(format!("agent process exited non-zero ({code})")),
                    Some(ERROR_CODE_EXIT_NONZERO),
                    None,
                ),
                // Killed by signal before producing an exit code.
                None => (
                    ProcessStatus::Killed,
                    None,
                    Some("agent process terminated by signal".to_string()),
                    Some(ERROR_CODE_KILLED),
                    None,
                ),
            }
        };

        finalize_session(
            &self.state,
            &self.process_id,
            self.run_id.as_deref(),
            status,
            returncode,
            error.as_deref(),
            error_code,
            stdout_bytes,
            stderr_bytes,
            output.as_deref(),
            self.output_path.as_deref(),
            self.events.as_ref(),
        );
        lock_or_recover(&self.sessions).remove(&self.process_id);
    }
}

/// Writes the output artifact when the execution produced one, settles
/// the owning run, then records the terminal process state. The run is
/// finalized first so anyone waiting on the process observes a settled
/// run the moment the session turns terminal.
#[allow(clippy::too_many_arguments)]
fn finalize_session(
    state: &StateStore,
    process_id: &str,
    run_id: Option<&str>,
    status: ProcessStatus,
    returncode: Option<i32>,
    error: Option<&str>,
    error_code: Option<&str>,
    stdout_bytes: u64,
    stderr_bytes: u64,
    output: Option<&str>,
    output_path: Option<&std::path::Path>,
    events: Option<&RunEventLog>,
) {
    if let Some(run_id) = run_id {
        let succeeded = error.is_none() && output.is_some();
        if succeeded {
            let written_path = output.and_then(|text| {
                let path = output_path?;
                match cadence_core::write_text_atomic(path, text) {
                    Ok(()) => Some(path.display().to_string()),
                    Err(write_error) => {
                        warn!(%run_id, error = %write_error, "failed to write output artifact");
                        None
                    }
                }
            });
            if let Err(state_error) =
                state.finalize_run(run_id, RunStatus::Success, None, None, written_path.as_deref())
            {
                warn!(%run_id, error = %state_error, "failed to finalize run record");
            }
            if let Some(events) = events {
                events.append("run.succeeded", json!({"output_path": written_path}));
            }
        } else {
            let message = error.unwrap_or("execution failed");
            if let Err(state_error) =
                state.finalize_run(run_id, RunStatus::Failed, Some(message), error_code, None)
            {
                warn!(%run_id, error = %state_error, "failed to finalize run record");
            }
            if let Some(events) = events {
                events.append(
                    "run.failed",
                    json!({"error": message, "error_code": error_code}),
                );
            }
        }
    }

    if let Err(state_error) = state.finalize_process(
        process_id,
        status,
        returncode,
        error,
        error_code,
        stdout_bytes,
        stderr_bytes,
    ) {
        warn!(%process_id, error = %state_error, "failed to finalize process record");
    }
}

fn spawn_output_reader<R>(
    reader: R,
    channel: &'static str,
    log: Arc<SessionLog>,
    buffers: Arc<SessionBuffers>,
    save_to_log: bool,
) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("cadence-{channel}-reader"))
        .spawn(move || {
            let mut buffered = BufReader::new(reader);
            let mut line = String::new();
            loop {
                line.clear();
                match buffered.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(read) => {
                        {
                            let target = if channel == "stdout" {
                                &buffers.stdout
                            } else {
                                &buffers.stderr
                            };
                            let mut buffer = lock_or_recover(target);
                            buffer.text.push_str(&line);
                            buffer.bytes += read as u64;
                        }
                        if save_to_log {
                            let content = line.trim_end_matches('\n');
                            log.append(
                                channel,
                                json!({"io": "chunk", "content": content, "bytes": read}),
                            );
                        }
                    }
                    Err(error) => {
                        log.append(
                            channel,
                            json!({"io": "error", "error": error.to_string()}),
                        );
                        break;
                    }
                }
            }
            debug!(channel, "output reader drained");
        })
        .unwrap_or_else(|_| thread::spawn(|| ()))
}

/// Sends a signal to the child's process group. A vanished group is
/// treated as success since the exit path already ran.
fn kill_process_group(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    let result = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if result == -1 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        return Err(error);
    }
    Ok(())
}

fn compose_agent_prompt(system_prompt: &str, prompt: &str) -> String {
    let system = system_prompt.trim();
    if system.is_empty() {
        prompt.to_string()
    } else {
        format!("[System Instruction]\n{system}\n\n[Task]\n{prompt}")
    }
}

/// Maps a provider name to the argv of its headless CLI invocation.
/// Unknown providers fall back to `<provider> [--model m] [args..] prompt`,
/// which also keeps the driver testable with plain binaries.
pub fn build_agent_command(config: &AgentModeConfig, prompt: &str) -> Vec<String> {
    let provider = config.provider.trim().to_ascii_lowercase();
    let model = config.model.trim();
    let mut argv: Vec<String> = match provider.as_str() {
        "codex" => {
            let sandbox = if config.sandbox_mode.trim().is_empty() {
                "workspace-write"
            } else {
                config.sandbox_mode.trim()
            };
            vec![
                "codex".into(),
                "exec".into(),
                "--skip-git-repo-check".into(),
                "--sandbox".into(),
                sandbox.into(),
            ]
        }
        "claude" => vec![
            "claude".into(),
            "-p".into(),
            "--output-format".into(),
            "text".into(),
            "--permission-mode".into(),
            "acceptEdits".into(),
        ],
        "gemini" => vec!["gemini".into(), "--approval-mode".into(), "yolo".into()],
        "opencode" => vec!["opencode".into(), "run".into()],
        _ => vec![provider.clone()],
    };
    if !model.is_empty() {
        argv.push("--model".into());
        argv.push(model.into());
    }
    argv.extend(config.cli_args.iter().cloned());
    if provider == "gemini" {
        argv.push("-p".into());
    }
    argv.push(prompt.to_string());
    argv
}

struct LlmFailure {
    message: String,
    code: &'static str,
}

fn resolve_auth_ref(auth_ref: &str) -> Option<String> {
    let auth_ref = auth_ref.trim();
    if auth_ref.is_empty() {
        return None;
    }
    if let Some(variable) = auth_ref.strip_prefix("env:") {
        return std::env::var(variable).ok().filter(|v| !v.is_empty());
    }
    Some(auth_ref.to_string())
}

/// Blocking OpenAI-compatible chat-completion call. Runs on the llm
/// driver thread, never on a caller thread.
fn execute_llm_request(
    config: &LlmModeConfig,
    prompt: &str,
    timeout_seconds: u64,
) -> Result<String, LlmFailure> {
    let Some(api_key) = resolve_auth_ref(&config.auth_ref) else {
        return Err(LlmFailure {
            message: format!("missing API key from authRef '{}'", config.auth_ref),
            code: ERROR_CODE_AUTH_MISSING,
        });
    };
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(timeout_seconds.max(1)))
        .build()
        .map_err(|error| LlmFailure {
            message: format!("failed to build HTTP client: {error}"),
            code: ERROR_CODE_LLM_ERROR,
        })?;
    let url = format!("{}/chat/completions", config.api_base.trim_end_matches('/'));
    let body = json!({
        "model": config.model,
        "messages": [{"role": "user", "content": prompt}],
        "temperature": config.temperature,
        "max_tokens": config.max_tokens,
        "stream": false,
    });
    let response = client
        .post(&url)
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .map_err(|error| {
            let code = if error.is_timeout() {
                ERROR_CODE_TIMEOUT
            } else {
                ERROR_CODE_LLM_ERROR
            };
            LlmFailure {
                message: format!("chat completion request failed: {error}"),
                code,
            }
        })?;
    let status = response.status();
    let payload: Value = response.json().map_err(|error| LlmFailure {
        message: format!("failed to decode chat completion response: {error}"),
        code: ERROR_CODE_LLM_ERROR,
    })?;
    if !status.is_success() {
        return Err(LlmFailure {
            message: format!("chat completion returned HTTP {status}: {payload}"),
            code: ERROR_CODE_LLM_ERROR,
        });
    }
    let text = payload
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(LlmFailure {
            message: "empty response".to_string(),
            code: ERROR_CODE_EMPTY_OUTPUT,
        });
    }
    Ok(text)
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
