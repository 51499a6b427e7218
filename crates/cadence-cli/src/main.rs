//! `cadence` command line entry point.
//!
//! Every subcommand opens the control plane over the storage root and
//! prints a JSON result. `run-task` is what the installed crontab
//! entries invoke: it triggers the task, then stays alive supervising
//! the spawned process until the run settles, since nothing else would
//! outlive cron's short-lived shell.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use cadence_control::{ControlPlane, TriggerError};
use cadence_core::StoragePaths;
use cadence_cron::{RunInvoker, SystemCrontab};
use cadence_gateway::run_gateway_server;
use cadence_state::{RunStatus, RunTrigger};
use cadence_task::{validate_task, TaskDefinition};

#[derive(Debug, Parser)]
#[command(
    name = "cadence",
    about = "Cron-backed task control plane and process supervisor",
    version
)]
struct Cli {
    /// Storage root holding tasks/, runtime/, logs/ and artifacts/.
    #[arg(long, env = "CADENCE_ROOT", default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the HTTP API.
    Serve {
        #[arg(long, env = "CADENCE_BIND", default_value = "127.0.0.1:18001")]
        bind: String,
    },
    /// List stored task definitions, valid or not.
    ListTasks,
    /// Validate a task definition file without saving it.
    Validate { path: PathBuf },
    /// Validate and persist a task definition file, then sync the crontab.
    Apply { path: PathBuf },
    /// Trigger a task and supervise the run until it settles.
    RunTask {
        task_id: String,
        #[arg(long, default_value = "manual")]
        trigger: String,
    },
    /// Pause a task and drop its crontab entry.
    Pause { task_id: String },
    /// Resume a paused task.
    Resume { task_id: String },
    /// Delete a task definition.
    Delete { task_id: String },
    /// Show the aggregated runtime status of a task.
    Status { task_id: String },
    /// Reconcile the crontab managed block against the task store.
    Sync,
    /// Show what is installed between the crontab markers.
    SchedulerStatus,
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let control = open_control(&cli.root)?;
    match cli.command {
        Command::Serve { bind } => {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?
                .block_on(run_gateway_server(&bind, control))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ListTasks => {
            let records = control.list_tasks()?;
            let tasks: Vec<serde_json::Value> = records
                .iter()
                .map(|record| {
                    json!({
                        "task": record.definition,
                        "valid": record.is_valid(),
                        "diagnostics": record.diagnostics,
                    })
                })
                .collect();
            print_json(&tasks)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { path } => {
            let definition = load_definition(&path)?;
            let diagnostics = validate_task(&definition);
            if diagnostics.is_empty() {
                print_json(&json!({"valid": true}))?;
                Ok(ExitCode::SUCCESS)
            } else {
                print_json(&json!({"valid": false, "diagnostics": diagnostics}))?;
                Ok(ExitCode::from(2))
            }
        }
        Command::Apply { path } => {
            let definition = load_definition(&path)?;
            let record = control.save_task(&definition)?;
            print_json(&json!({"success": true, "task_id": record.definition.metadata.id}))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::RunTask { task_id, trigger } => run_task(&control, &task_id, &trigger),
        Command::Pause { task_id } => match control.pause_task(&task_id) {
            Ok(record) => {
                print_json(&json!({"success": true, "task": record.definition}))?;
                Ok(ExitCode::SUCCESS)
            }
            Err(error) => report_trigger_error(&error),
        },
        Command::Resume { task_id } => match control.resume_task(&task_id) {
            Ok(record) => {
                print_json(&json!({"success": true, "task": record.definition}))?;
                Ok(ExitCode::SUCCESS)
            }
            Err(error) => report_trigger_error(&error),
        },
        Command::Delete { task_id } => {
            let deleted = control.delete_task(&task_id)?;
            print_json(&json!({"success": deleted, "task_id": task_id}))?;
            Ok(if deleted {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Status { task_id } => match control.task_status(&task_id) {
            Ok(report) => {
                print_json(&report)?;
                Ok(ExitCode::SUCCESS)
            }
            Err(error) => report_trigger_error(&error),
        },
        Command::Sync => {
            let report = control.sync()?;
            print_json(&json!({"success": true, "report": report}))?;
            Ok(ExitCode::SUCCESS)
        }
        Command::SchedulerStatus => {
            let status = control.scheduler_status()?;
            print_json(&status)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn open_control(root: &std::path::Path) -> Result<Arc<ControlPlane>> {
    let paths = StoragePaths::new(root);
    let invoker = RunInvoker::for_current_exe(root)?;
    Ok(Arc::new(ControlPlane::open(
        paths,
        Box::new(SystemCrontab),
        invoker,
    )?))
}

/// Trigger plus in-process supervision. Exit code 3 marks a run that
/// settled as anything other than success, so cron mails distinguish
/// task failures from invocation failures.
fn run_task(control: &ControlPlane, task_id: &str, trigger: &str) -> Result<ExitCode> {
    let Some(trigger) = RunTrigger::parse(trigger) else {
        print_json(&json!({
            "success": false,
            "error": format!("unknown trigger '{trigger}'"),
            "error_code": "task_invalid",
        }))?;
        return Ok(ExitCode::from(3));
    };
    let started = match control.run_task(task_id, trigger) {
        Ok(started) => started,
        Err(error) => return report_run_error(&error),
    };
    let process = control.supervisor().wait(&started.process_id, None)?;
    let run = control
        .state()
        .get_run(&started.run_id)
        .context("run record disappeared while waiting")?;
    let success = run.status == RunStatus::Success;
    print_json(&json!({"success": success, "run": run, "process": process}))?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(3)
    })
}

fn report_run_error(error: &TriggerError) -> Result<ExitCode> {
    print_json(&json!({
        "success": false,
        "run_id": serde_json::Value::Null,
        "error": error.to_string(),
        "error_code": error.error_code(),
    }))?;
    Ok(ExitCode::from(3))
}

fn report_trigger_error(error: &TriggerError) -> Result<ExitCode> {
    print_json(&json!({
        "success": false,
        "error": error.to_string(),
        "error_code": error.error_code(),
    }))?;
    Ok(ExitCode::FAILURE)
}

fn load_definition(path: &std::path::Path) -> Result<TaskDefinition> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse task definition {}", path.display()))
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render output")?
    );
    Ok(())
}
