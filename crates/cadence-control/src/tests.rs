//! End-to-end control-plane tests over a fake crontab and `/bin/sh`
//! agent fixtures.

use std::time::Duration;

use tempfile::{tempdir, TempDir};

use cadence_core::StoragePaths;
use cadence_cron::{MemoryCrontab, RunInvoker};
use cadence_state::{RunStatus, RunTrigger};
use cadence_task::{TaskDefinition, TaskMode};

use super::{ControlPlane, TriggerError};

const WAIT_CEILING: Duration = Duration::from_secs(10);

struct Fixture {
    _root: TempDir,
    control: ControlPlane,
}

fn fixture() -> Fixture {
    let root = tempdir().expect("tempdir");
    let paths = StoragePaths::new(root.path());
    let control = ControlPlane::open(
        paths,
        Box::new(MemoryCrontab::default()),
        RunInvoker::new(root.path(), "/usr/bin/cadence"),
    )
    .expect("open control plane");
    Fixture {
        control,
        _root: root,
    }
}

fn shell_task(id: &str, script: &str) -> TaskDefinition {
    let mut task = TaskDefinition::default();
    task.metadata.id = id.to_string();
    task.metadata.name = id.to_string();
    task.spec.mode = TaskMode::Agent;
    task.spec.schedule.cron = Some("*/5 * * * *".to_string());
    task.spec.mode_config.agent.provider = "/bin/sh".to_string();
    task.spec.mode_config.agent.cli_args = vec!["-c".to_string(), script.to_string()];
    task
}

fn wait_for_run(fx: &Fixture, run_id: &str, process_id: &str) {
    fx.control
        .supervisor()
        .wait(process_id, Some(WAIT_CEILING))
        .expect("wait for process");
    let run = fx.control.state().get_run(run_id).expect("run exists");
    assert!(run.status.is_terminal(), "run must settle after the process");
}

#[test]
fn save_installs_the_schedule_and_resync_is_idempotent() {
    let fx = fixture();
    fx.control
        .save_task(&shell_task("demo", "echo ok"))
        .expect("save");

    let status = fx.control.scheduler_status().expect("status");
    assert!(status.installed);
    assert_eq!(status.count, 1);
    assert!(status.jobs[0].contains("run-task demo --trigger cron"));

    let report = fx.control.sync().expect("resync");
    assert!(!report.changed);
    assert!(report.installed.is_empty() && report.removed.is_empty());

    let task_status = fx.control.task_status("demo").expect("task status");
    assert!(task_status.backend_installed);
    assert!(task_status.valid);
    assert_eq!(task_status.runtime.active_runs, 0);
    assert!(task_status.next_due_unix_ms.is_some());
}

#[test]
fn trigger_errors_carry_stable_codes() {
    let fx = fixture();
    let missing = fx
        .control
        .run_task("ghost", RunTrigger::Api)
        .expect_err("unknown task");
    assert!(matches!(missing, TriggerError::TaskNotFound(_)));
    assert_eq!(missing.error_code(), "task_not_found");

    let mut paused = shell_task("paused-task", "echo ok");
    paused.spec.paused = true;
    fx.control.save_task(&paused).expect("save paused");
    let denied = fx
        .control
        .run_task("paused-task", RunTrigger::Api)
        .expect_err("paused task");
    assert!(matches!(denied, TriggerError::TaskDisabled(_)));
    assert_eq!(denied.error_code(), "task_disabled");
}

#[test]
fn run_respects_the_concurrency_lock_and_settles_to_success() {
    let fx = fixture();
    fx.control
        .save_task(&shell_task("demo", "sleep 1; echo finished"))
        .expect("save");

    let started = fx
        .control
        .run_task("demo", RunTrigger::Api)
        .expect("first trigger");
    assert_eq!(started.status, "running");

    let denied = fx
        .control
        .run_task("demo", RunTrigger::Api)
        .expect_err("lock is held");
    assert!(matches!(
        denied,
        TriggerError::AlreadyRunning { active: 1, limit: 1, .. }
    ));
    assert_eq!(denied.error_code(), "task_already_running");

    wait_for_run(&fx, &started.run_id, &started.process_id);
    let run = fx.control.state().get_run(&started.run_id).expect("run");
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.trigger, RunTrigger::Api);

    let status = fx.control.task_status("demo").expect("status");
    assert_eq!(status.runtime.active_runs, 0);
    let last = status.runtime.last_run.expect("last run");
    assert_eq!(last.run_id, started.run_id);
    assert_eq!(last.status, RunStatus::Success);

    // The slot is free again.
    fx.control
        .run_task("demo", RunTrigger::Manual)
        .expect("second run after completion");
}

#[test]
fn prompt_rendering_reaches_the_execution() {
    let fx = fixture();
    std::fs::write(
        fx.control.paths().resolve_relative("notes.md"),
        "remember the deadline",
    )
    .expect("write context file");

    let mut task = shell_task("render", "echo \"$0\"");
    task.spec.input.prompt = "Report for {name}".to_string();
    task.spec.input.variables.insert("name".to_string(), "ops".to_string());
    task.spec.input.context_files = vec!["notes.md".to_string(), "missing.md".to_string()];
    fx.control.save_task(&task).expect("save");

    let started = fx.control.run_task("render", RunTrigger::Manual).expect("run");
    wait_for_run(&fx, &started.run_id, &started.process_id);

    let run = fx.control.state().get_run(&started.run_id).expect("run");
    assert_eq!(run.status, RunStatus::Success);
    let artifact =
        std::fs::read_to_string(run.output_path.expect("artifact path")).expect("artifact");
    assert!(artifact.starts_with("Report for ops"));
    assert!(artifact.contains("[Context Files]"));
    assert!(artifact.contains("--- file:notes.md ---"));
    assert!(artifact.contains("remember the deadline"));
    assert!(!artifact.contains("missing.md"));
}

#[test]
fn failed_execution_is_reported_through_status_not_the_trigger() {
    let fx = fixture();
    fx.control
        .save_task(&shell_task("flaky", "exit 7"))
        .expect("save");

    let started = fx
        .control
        .run_task("flaky", RunTrigger::Cron)
        .expect("trigger still accepts");
    wait_for_run(&fx, &started.run_id, &started.process_id);

    let run = fx.control.state().get_run(&started.run_id).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("exit_nonzero"));
    assert!(run.error.is_some());

    let trace = std::fs::read_to_string(run.trace_path.expect("trace path")).expect("trace");
    assert!(trace.contains("\"event\":\"run.failed\""));
    assert!(trace.contains("\"error_code\":\"exit_nonzero\""));
}

#[test]
fn runs_append_lifecycle_events_to_the_trace_path() {
    let fx = fixture();
    fx.control
        .save_task(&shell_task("traced", "echo traced output"))
        .expect("save");

    let started = fx.control.run_task("traced", RunTrigger::Api).expect("run");
    wait_for_run(&fx, &started.run_id, &started.process_id);

    let run = fx.control.state().get_run(&started.run_id).expect("run");
    let trace_path = run.trace_path.expect("trace path");
    let log = std::fs::read_to_string(&trace_path).expect("read event log");
    let events: Vec<String> = log
        .lines()
        .map(|line| {
            let row: serde_json::Value = serde_json::from_str(line).expect("event row");
            assert_eq!(row["run_id"], started.run_id.as_str());
            assert_eq!(row["task_id"], "traced");
            row["event"].as_str().unwrap_or_default().to_string()
        })
        .collect();
    assert_eq!(
        events,
        vec!["run.started", "executor.started", "run.succeeded"]
    );
}

#[test]
fn delete_leaves_the_backend_until_the_next_sync() {
    let fx = fixture();
    fx.control
        .save_task(&shell_task("transient", "echo ok"))
        .expect("save");
    assert_eq!(fx.control.scheduler_status().expect("status").count, 1);

    assert!(fx.control.delete_task("transient").expect("delete"));
    // The entry survives the delete call itself.
    assert_eq!(fx.control.scheduler_status().expect("status").count, 1);

    let report = fx.control.sync().expect("sync");
    assert_eq!(report.removed, vec!["transient"]);
    assert_eq!(fx.control.scheduler_status().expect("status").count, 0);

    assert!(!fx.control.delete_task("transient").expect("second delete"));
}

#[test]
fn pause_and_resume_toggle_the_installed_entry() {
    let fx = fixture();
    fx.control
        .save_task(&shell_task("pausable", "echo ok"))
        .expect("save");
    assert!(fx.control.task_status("pausable").expect("status").backend_installed);

    let paused = fx.control.pause_task("pausable").expect("pause");
    assert!(paused.definition.spec.paused);
    let status = fx.control.task_status("pausable").expect("status");
    assert!(status.paused);
    assert!(!status.backend_installed);

    let resumed = fx.control.resume_task("pausable").expect("resume");
    assert!(!resumed.definition.spec.paused);
    assert!(fx.control.task_status("pausable").expect("status").backend_installed);
}
