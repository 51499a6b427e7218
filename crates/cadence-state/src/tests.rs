//! Tests for the durable run/process store and startup recovery.

use tempfile::tempdir;

use cadence_task::TaskMode;

use super::{
    ProcessRecord, ProcessStatus, RunRecord, RunStatus, RunTrigger, StateError, StateStore,
    PROCESS_LOST_ERROR, PROCESS_LOST_ERROR_CODE,
};

fn sample_process(process_id: &str, run_id: &str, task_id: &str) -> ProcessRecord {
    let now = cadence_core::current_unix_timestamp_ms();
    ProcessRecord {
        process_id: process_id.to_string(),
        run_id: Some(run_id.to_string()),
        task_id: Some(task_id.to_string()),
        mode: TaskMode::Agent,
        provider: "codex".to_string(),
        model: "gpt-5".to_string(),
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

#[test]
fn begin_run_enforces_the_concurrency_ceiling() {
    let tempdir = tempdir().expect("tempdir");
    let store = StateStore::open(tempdir.path().join("state.json")).expect("open");

    store
        .try_begin_run(RunRecord::pending("run_a", "demo", RunTrigger::Api), 1)
        .expect("first acquisition");
    let denied = store
        .try_begin_run(RunRecord::pending("run_b", "demo", RunTrigger::Api), 1)
        .expect_err("second acquisition must fail fast");
    assert!(matches!(
        denied,
        StateError::ConcurrencyExceeded { active: 1, limit: 1, .. }
    ));
    assert!(store.get_run("run_b").is_none());

    // Another task is unaffected by demo's slot.
    store
        .try_begin_run(RunRecord::pending("run_c", "other", RunTrigger::Cron), 1)
        .expect("independent task");

    // Finishing the run releases the slot.
    store
        .finalize_run("run_a", RunStatus::Success, None, None, Some("out.md"))
        .expect("finalize");
    store
        .try_begin_run(RunRecord::pending("run_d", "demo", RunTrigger::Api), 1)
        .expect("slot released");
}

#[test]
fn failed_persist_does_not_occupy_a_concurrency_slot() {
    let tempdir = tempdir().expect("tempdir");
    let path = tempdir.path().join("state.json");
    let store = StateStore::open(&path).expect("open");

    // Block the state file so the flush cannot land.
    std::fs::create_dir_all(&path).expect("block state path");
    let denied = store
        .try_begin_run(RunRecord::pending("run_a", "demo", RunTrigger::Api), 1)
        .expect_err("persist must fail");
    assert!(matches!(denied, StateError::Persist(_)));
    assert!(store.get_run("run_a").is_none());

    // Once the path is writable again the slot must still be free.
    std::fs::remove_dir(&path).expect("unblock state path");
    store
        .try_begin_run(RunRecord::pending("run_b", "demo", RunTrigger::Api), 1)
        .expect("begin after failed persist");
    assert_eq!(store.active_run_count("demo"), 1);
}

#[test]
fn terminal_records_never_change_again() {
    let tempdir = tempdir().expect("tempdir");
    let store = StateStore::open(tempdir.path().join("state.json")).expect("open");

    store
        .try_begin_run(RunRecord::pending("run_a", "demo", RunTrigger::Manual), 1)
        .expect("begin");
    store
        .finalize_run("run_a", RunStatus::Failed, Some("boom"), Some("spawn_failed"), None)
        .expect("finalize");
    assert!(matches!(
        store.mark_run_running("run_a", "proc_x"),
        Err(StateError::TerminalRun(_))
    ));
    assert!(matches!(
        store.finalize_run("run_a", RunStatus::Success, None, None, None),
        Err(StateError::TerminalRun(_))
    ));

    store
        .insert_process(sample_process("proc_x", "run_a", "demo"))
        .expect("insert");
    store
        .finalize_process("proc_x", ProcessStatus::Exited, Some(0), None, None, 10, 0)
        .expect("finalize process");
    assert!(matches!(
        store.mark_process_running("proc_x", Some(123)),
        Err(StateError::TerminalProcess(_))
    ));
}

#[test]
fn lifecycle_round_trips_through_the_state_file() {
    let tempdir = tempdir().expect("tempdir");
    let path = tempdir.path().join("state.json");
    {
        let store = StateStore::open(&path).expect("open");
        store
            .try_begin_run(RunRecord::pending("run_a", "demo", RunTrigger::Cron), 2)
            .expect("begin");
        store
            .insert_process(sample_process("proc_x", "run_a", "demo"))
            .expect("insert");
        store
            .mark_process_running("proc_x", Some(4242))
            .expect("process running");
        store.mark_run_running("run_a", "proc_x").expect("run running");
        store
            .finalize_process("proc_x", ProcessStatus::Exited, Some(0), None, None, 64, 3)
            .expect("process done");
        store
            .finalize_run(
                "run_a",
                RunStatus::Success,
                None,
                None,
                Some("artifacts/demo/run_a/result.md"),
            )
            .expect("run done");
    }

    let store = StateStore::open(&path).expect("reopen");
    assert_eq!(store.recovery_report().recovered_runs, 0);
    let run = store.get_run("run_a").expect("run survives restart");
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.process_id.as_deref(), Some("proc_x"));
    assert_eq!(
        run.output_path.as_deref(),
        Some("artifacts/demo/run_a/result.md")
    );
    let process = store.get_process("proc_x").expect("process survives");
    assert_eq!(process.status, ProcessStatus::Exited);
    assert_eq!(process.returncode, Some(0));
    assert_eq!(process.stdout_bytes, 64);
}

#[test]
fn restart_marks_orphaned_records_lost_exactly_once() {
    let tempdir = tempdir().expect("tempdir");
    let path = tempdir.path().join("state.json");
    {
        let store = StateStore::open(&path).expect("open");
        store
            .try_begin_run(RunRecord::pending("run_a", "demo", RunTrigger::Cron), 1)
            .expect("begin");
        store
            .insert_process(sample_process("proc_x", "run_a", "demo"))
            .expect("insert");
        store
            .mark_process_running("proc_x", Some(31337))
            .expect("running");
        store.mark_run_running("run_a", "proc_x").expect("running");
        // Simulated crash: the store is dropped without finalizing anything.
    }

    let store = StateStore::open(&path).expect("reopen after crash");
    let report = store.recovery_report();
    assert_eq!(report.recovered_runs, 1);
    assert_eq!(report.recovered_processes, 1);

    let run = store.get_run("run_a").expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(PROCESS_LOST_ERROR));
    assert_eq!(run.error_code.as_deref(), Some(PROCESS_LOST_ERROR_CODE));
    assert!(run.ended_at_unix_ms.is_some());

    let process = store.get_process("proc_x").expect("process");
    assert_eq!(process.status, ProcessStatus::Lost);
    assert_eq!(process.error.as_deref(), Some(PROCESS_LOST_ERROR));

    // The slot is free again and a later reopen recovers nothing new.
    store
        .try_begin_run(RunRecord::pending("run_b", "demo", RunTrigger::Api), 1)
        .expect("slot released by recovery");
    store
        .finalize_run("run_b", RunStatus::Success, None, None, None)
        .expect("finalize");
    drop(store);
    let store = StateStore::open(&path).expect("third open");
    assert_eq!(store.recovery_report().recovered_runs, 0);
    assert_eq!(store.recovery_report().recovered_processes, 0);
}

#[test]
fn listings_filter_and_order_newest_first() {
    let tempdir = tempdir().expect("tempdir");
    let store = StateStore::open(tempdir.path().join("state.json")).expect("open");

    let mut early = RunRecord::pending("run_a", "demo", RunTrigger::Cron);
    early.started_at_unix_ms = 1_000;
    let mut late = RunRecord::pending("run_b", "demo", RunTrigger::Api);
    late.started_at_unix_ms = 2_000;
    store.try_begin_run(early, 4).expect("begin early");
    store.try_begin_run(late, 4).expect("begin late");
    store
        .try_begin_run(RunRecord::pending("run_c", "other", RunTrigger::Manual), 4)
        .expect("begin other");

    let runs = store.list_runs(Some("demo"), 10);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, "run_b");
    assert_eq!(runs[1].run_id, "run_a");
    assert_eq!(store.list_runs(None, 1).len(), 1);

    let summary = store.task_summary("demo");
    assert_eq!(summary.active_runs, 2);
    assert_eq!(summary.last_run.expect("last run").run_id, "run_b");
    assert_eq!(store.active_run_count("other"), 1);

    store
        .insert_process(sample_process("proc_x", "run_a", "demo"))
        .expect("insert");
    store
        .insert_process(sample_process("proc_y", "run_c", "other"))
        .expect("insert");
    assert_eq!(store.list_processes(Some("demo"), None, None, 10).len(), 1);
    assert_eq!(
        store.list_processes(None, Some("run_c"), None, 10)[0].process_id,
        "proc_y"
    );
    assert_eq!(
        store
            .list_processes(None, None, Some(ProcessStatus::Starting), 10)
            .len(),
        2
    );
}
