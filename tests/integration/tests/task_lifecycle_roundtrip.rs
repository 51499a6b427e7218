//! Full task lifecycle through the control plane: definition, crontab
//! reconciliation, a real `/bin/sh` execution, artifact capture, and
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::tempdir;

use cadence_control::ControlPlane;
use cadence_core::StoragePaths;
use cadence_cron::{CrontabBackend, MemoryCrontab, RunInvoker, MARKER_BEGIN, MARKER_END};
use cadence_state::{ProcessStatus, RunStatus, RunTrigger};
use cadence_task::{TaskDefinition, TaskMode};

const WAIT_CEILING: Duration = Duration::from_secs(10);

/// Backend handle the test keeps after the control plane takes the box.
#[derive(Clone, Default)]
struct SharedCrontab(Arc<MemoryCrontab>);

impl CrontabBackend for SharedCrontab {
    fn read(&self) -> Result<String> {
        self.0.read()
    }

    fn install(&self, content: &str) -> Result<()> {
        self.0.install(content)
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

#[test]
fn lifecycle_from_definition_to_artifact_and_teardown() {
    let root = tempdir().expect("tempdir");
    let crontab = SharedCrontab::default();
    let paths = StoragePaths::new(root.path());
    let control = ControlPlane::open(
        paths.clone(),
        Box::new(crontab.clone()),
        RunInvoker::new(root.path(), "/usr/bin/cadence"),
    )
    .expect("open control plane");

    control
        .save_task(&shell_task("demo", "echo nightly report body"))
        .expect("save task");

    let installed = crontab.0.content();
    assert!(installed.contains(MARKER_BEGIN));
    assert!(installed.contains(MARKER_END));
    assert!(installed.contains("# cron-agent task=demo"));
    assert!(installed.contains("CRON_TZ=UTC"));
    assert!(installed.contains("*/5 * * * *"));
    assert!(installed.contains("run-task demo --trigger cron"));

    let started = control
        .run_task("demo", RunTrigger::Manual)
        .expect("trigger");
    let process = control
        .supervisor()
        .wait(&started.process_id, Some(WAIT_CEILING))
        .expect("wait for process");
    assert_eq!(process.status, ProcessStatus::Exited);
    assert_eq!(process.returncode, Some(0));

    let run = control.state().get_run(&started.run_id).expect("run");
    assert_eq!(run.status, RunStatus::Success);
    let artifact_path = run.output_path.expect("artifact path");
    assert!(artifact_path.ends_with("result.md"));
    let artifact = std::fs::read_to_string(&artifact_path).expect("read artifact");
    assert!(artifact.contains("nightly report body"));

    let log = std::fs::read_to_string(paths.process_log_path(&started.process_id))
        .expect("read process log");
    assert!(log.lines().count() >= 2);
    assert!(log.contains("\"event\":\"exit\""));

    control.pause_task("demo").expect("pause");
    assert!(!crontab.0.content().contains("# cron-agent task=demo"));
    control.resume_task("demo").expect("resume");
    assert!(crontab.0.content().contains("# cron-agent task=demo"));

    assert!(control.delete_task("demo").expect("delete"));
    control.sync().expect("final sync");
    assert!(!crontab.0.content().contains("# cron-agent task=demo"));
}

#[test]
fn timed_out_execution_fails_the_run_with_a_killed_process() {
    let root = tempdir().expect("tempdir");
    let control = ControlPlane::open(
        StoragePaths::new(root.path()),
        Box::new(MemoryCrontab::default()),
        RunInvoker::new(root.path(), "/usr/bin/cadence"),
    )
    .expect("open control plane");

    let mut task = shell_task("slow", "sleep 10");
    task.spec.execution.timeout_seconds = 1;
    control.save_task(&task).expect("save task");

    let started = control.run_task("slow", RunTrigger::Api).expect("trigger");
    let process = control
        .supervisor()
        .wait(&started.process_id, Some(WAIT_CEILING))
        .expect("wait for process");
    assert_eq!(process.status, ProcessStatus::Killed);
    assert_eq!(process.error_code.as_deref(), Some("timeout"));

    let run = control.state().get_run(&started.run_id).expect("run");
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_code.as_deref(), Some("timeout"));
    assert!(run.error.is_some());
    assert!(run.output_path.is_none());
}
