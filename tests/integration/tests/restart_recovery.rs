//! A control plane reopened over a root with in-flight records must
//! reclassify them before accepting triggers, and the freed slot must
//! be usable immediately.

use std::time::Duration;

use tempfile::tempdir;

use cadence_control::ControlPlane;
use cadence_core::StoragePaths;
use cadence_cron::{MemoryCrontab, RunInvoker};
use cadence_state::{
    ProcessRecord, ProcessStatus, RunRecord, RunStatus, RunTrigger, PROCESS_LOST_ERROR,
    PROCESS_LOST_ERROR_CODE,
};
use cadence_task::{TaskDefinition, TaskMode};

const WAIT_CEILING: Duration = Duration::from_secs(10);

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

fn running_process(process_id: &str, run_id: &str, task_id: &str) -> ProcessRecord {
    let now = cadence_core::current_unix_timestamp_ms();
    ProcessRecord {
        process_id: process_id.to_string(),
        run_id: Some(run_id.to_string()),
        task_id: Some(task_id.to_string()),
        mode: TaskMode::Agent,
        provider: "/bin/sh".to_string(),
        model: String::new(),
        status: ProcessStatus::Starting,
        pid: None,
        interactive: true,
        timeout_seconds: 600,
        started_at_unix_ms: now,
        updated_at_unix_ms: now,
        ended_at_unix_ms: None,
        returncode: None,
        error: None,
        error_code: None,
        stdout_bytes: 0,
        stderr_bytes: 0,
        log_path: format!("logs/process/{process_id}.jsonl"),
    }
}

fn open_plane(root: &std::path::Path) -> ControlPlane {
    ControlPlane::open(
        StoragePaths::new(root),
        Box::new(MemoryCrontab::default()),
        RunInvoker::new(root, "/usr/bin/cadence"),
    )
    .expect("open control plane")
}

#[test]
fn reopen_reclassifies_orphans_and_frees_the_slot() {
    let root = tempdir().expect("tempdir");

    {
        let control = open_plane(root.path());
        control
            .save_task(&shell_task("demo", "echo ok"))
            .expect("save task");
        let state = control.state();
        state
            .try_begin_run(RunRecord::pending("run_zombie", "demo", RunTrigger::Cron), 1)
            .expect("begin run");
        state
            .insert_process(running_process("proc_zombie", "run_zombie", "demo"))
            .expect("insert process");
        state
            .mark_process_running("proc_zombie", Some(999_999))
            .expect("mark process running");
        state
            .mark_run_running("run_zombie", "proc_zombie")
            .expect("mark run running");
        // Simulated crash: nothing is finalized.
    }

    let control = open_plane(root.path());

    let run = control.state().get_run("run_zombie").expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(PROCESS_LOST_ERROR));
    assert_eq!(run.error_code.as_deref(), Some(PROCESS_LOST_ERROR_CODE));

    let process = control.state().get_process("proc_zombie").expect("process");
    assert_eq!(process.status, ProcessStatus::Lost);
    assert_eq!(process.error_code.as_deref(), Some(PROCESS_LOST_ERROR_CODE));

    let summary = control.state().task_summary("demo");
    assert_eq!(summary.active_runs, 0);

    // The concurrency slot is free: a fresh trigger runs to completion.
    let started = control
        .run_task("demo", RunTrigger::Manual)
        .expect("trigger after recovery");
    let settled = control
        .supervisor()
        .wait(&started.process_id, Some(WAIT_CEILING))
        .expect("wait");
    assert_eq!(settled.status, ProcessStatus::Exited);
    let run = control.state().get_run(&started.run_id).expect("new run");
    assert_eq!(run.status, RunStatus::Success);
}
