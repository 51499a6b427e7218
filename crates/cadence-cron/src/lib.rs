//! Crontab backend reconciliation.
//!
//! The system owns exactly one marker-delimited block inside the user
//! crontab. Each managed entry is three lines: a per-task tag comment,
//! a `CRON_TZ` line, and the cron line itself. Sync renders the desired
//! block from the task store, diffs it against whatever is currently
//! installed between the markers, and rewrites the crontab only when
//! the two differ. Everything outside the markers is preserved
//! byte-for-byte.

use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use cadence_task::TaskRecord;


pub const MARKER_BEGIN: &str = "# >>> CRON_AGENT_MANAGED BEGIN >>>";
pub const MARKER_END: &str = "# <<< CRON_AGENT_MANAGED END <<<";
const ENTRY_TAG_PREFIX: &str = "# cron-agent task=";

/// One managed crontab entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronEntry {
    pub task_id: String,
    pub timezone: String,
    pub expression: String,
    pub command: String,
}

/// Minimal surface over the external cron registry so tests and the
/// control plane can swap the real `crontab` binary for a fake.
pub trait CrontabBackend: Send + Sync {
    fn read(&self) -> Result<String>;
    fn install(&self, content: &str) -> Result<()>;
}

/// Talks to the user crontab via the `crontab` binary.
#[derive(Debug, Default)]
pub struct SystemCrontab;

impl CrontabBackend for SystemCrontab {
    fn read(&self) -> Result<String> {
        let output = Command::new("crontab")
            .arg("-l")
            .output()
            .context("failed to invoke crontab -l")?;
        if !output.status.success() {
            // An empty crontab reports "no crontab for <user>" on stderr.
            return Ok(String::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn install(&self, content: &str) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .suffix(".cron")
            .tempfile()
            .context("failed to create crontab staging file")?;
        file.write_all(content.as_bytes())
            .context("failed to stage crontab content")?;
        file.flush().context("failed to flush crontab staging file")?;
        let output = Command::new("crontab")
            .arg(file.path())
            .output()
            .context("failed to invoke crontab install")?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.trim();
            if detail.is_empty() {
                bail!("crontab install failed");
            }
            bail!("crontab install failed: {detail}");
        }
        Ok(())
    }
}

/// In-memory backend used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryCrontab {
    content: Mutex<String>,
}

impl MemoryCrontab {
    pub fn with_content(content: &str) -> Self {
        Self {
            content: Mutex::new(content.to_string()),
        }
    }

    pub fn content(&self) -> String {
        self.content.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CrontabBackend for MemoryCrontab {
    fn read(&self) -> Result<String> {
        Ok(self.content())
    }

    fn install(&self, content: &str) -> Result<()> {
        if let Ok(mut guard) = self.content.lock() {
            *guard = content.to_string();
        }
        Ok(())
    }
}

/// Builds the command each managed entry runs when cron fires.
#[derive(Debug, Clone)]
pub struct RunInvoker {
    root: PathBuf,
    executable: PathBuf,
}

impl RunInvoker {
    pub fn new(root: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            executable: executable.into(),
        }
    }

    pub fn for_current_exe(root: impl Into<PathBuf>) -> Result<Self> {
        let executable =
            std::env::current_exe().context("failed to resolve the current executable path")?;
        Ok(Self::new(root, executable))
    }

    fn command_for(&self, task_id: &str) -> String {
        format!(
            "cd {} && {} run-task {} --trigger cron",
            shell_quote(&self.root.display().to_string()),
            shell_quote(&self.executable.display().to_string()),
            shell_quote(task_id),
        )
    }
}

/// Single-quote shell quoting, safe for arbitrary path bytes.
pub fn shell_quote(raw: &str) -> String {
    if !raw.is_empty()
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b'='))
    {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', r#"'\''"#))
}

/// Desired entry set: one entry per valid, enabled, unpaused cron task.
/// Interval-based definitions never reach here; validation rejects them
/// before they can be persisted, so no long-lived loop survives a sync.
pub fn desired_entries(records: &[TaskRecord], invoker: &RunInvoker) -> Vec<CronEntry> {
    let mut entries: Vec<CronEntry> = records
        .iter()
        .filter(|record| record.is_valid() && record.definition.is_runnable())
        .filter(|record| record.definition.spec.run_backend == "cron")
        .filter_map(|record| {
            let task_id = record.definition.metadata.id.clone();
            let expression = record.definition.spec.schedule.cron.clone()?;
            Some(CronEntry {
                command: invoker.command_for(&task_id),
                timezone: record.definition.spec.schedule.timezone.clone(),
                expression,
                task_id,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.task_id.cmp(&b.task_id));
    entries
}

pub fn render_managed_block(entries: &[CronEntry]) -> String {
    let mut lines = vec![MARKER_BEGIN.to_string()];
    for entry in entries {
        lines.push(format!("{ENTRY_TAG_PREFIX}{}", entry.task_id));
        lines.push(format!("CRON_TZ={}", entry.timezone));
        lines.push(format!("{} {}", entry.expression, entry.command));
    }
    lines.push(MARKER_END.to_string());
    lines.join("\n") + "\n"
}

/// Recovers the entry list from an installed crontab. Lines between the
/// markers that do not follow the three-line shape are dropped; the next
/// install rewrites the block wholesale, so a mangled block self-heals.
pub fn parse_managed_block(content: &str) -> Vec<CronEntry> {
    let mut entries = Vec::new();
    let mut in_block = false;
    let mut pending_task: Option<String> = None;
    let mut pending_timezone: Option<String> = None;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed == MARKER_BEGIN {
            in_block = true;
            continue;
        }
        if trimmed == MARKER_END {
            break;
        }
        if !in_block || trimmed.is_empty() {
            continue;
        }
        if let Some(task_id) = trimmed.strip_prefix(ENTRY_TAG_PREFIX) {
            pending_task = Some(task_id.trim().to_string());
            pending_timezone = None;
            continue;
        }
        if let Some(timezone) = trimmed.strip_prefix("CRON_TZ=") {
            pending_timezone = Some(timezone.trim().to_string());
            continue;
        }
        if trimmed.starts_with('#') {
            continue;
        }
        let (task_id, timezone) = match (pending_task.take(), pending_timezone.take()) {
            (Some(task_id), Some(timezone)) => (task_id, timezone),
            _ => continue,
        };
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        entries.push(CronEntry {
            task_id,
            timezone,
            expression: fields[..5].join(" "),
            command: fields[5..].join(" "),
        });
    }
    entries
}

/// Everything outside the managed block, trailing newline normalized.
pub fn strip_managed_block(content: &str) -> String {
    let Some(start) = content.find(MARKER_BEGIN) else {
        let trimmed = content.trim();
        return if trimmed.is_empty() {
            String::new()
        } else {
            format!("{trimmed}\n")
        };
    };
    let rest = match content.find(MARKER_END) {
        Some(end) => &content[end + MARKER_END.len()..],
        None => "",
    };
    let merged = format!("{}{}", &content[..start], rest);
    let trimmed = merged.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncReport {
    pub installed: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: usize,
    pub task_count: usize,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub backend: &'static str,
    pub installed: bool,
    pub jobs: Vec<String>,
    pub count: usize,
}

/// Reconciles the managed block against a desired entry set.
pub struct CrontabSync {
    backend: Box<dyn CrontabBackend>,
}

impl CrontabSync {
    pub fn new(backend: Box<dyn CrontabBackend>) -> Self {
        Self { backend }
    }

    pub fn system() -> Self {
        Self::new(Box::new(SystemCrontab))
    }

    /// Installs missing entries, removes stale ones, and leaves lines
    /// outside the markers untouched. A second sync with the same
    /// desired set reports zero additions and removals and does not
    /// rewrite the crontab at all.
    pub fn sync(&self, desired: &[CronEntry]) -> Result<SyncReport> {
        let current = self.backend.read().context("failed to read crontab")?;
        let current_entries = parse_managed_block(&current);

        let installed: Vec<String> = desired
            .iter()
            .filter(|entry| !current_entries.contains(entry))
            .map(|entry| entry.task_id.clone())
            .collect();
        let removed: Vec<String> = current_entries
            .iter()
            .filter(|entry| !desired.contains(entry))
            .map(|entry| entry.task_id.clone())
            .collect();
        let unchanged = desired.len() - installed.len();
        let changed = !installed.is_empty() || !removed.is_empty();

        if changed {
            let next = format!(
                "{}{}",
                strip_managed_block(&current),
                render_managed_block(desired)
            );
            self.backend
                .install(&next)
                .context("failed to install crontab")?;
            info!(
                installed = installed.len(),
                removed = removed.len(),
                unchanged,
                "crontab managed block rewritten"
            );
        } else {
            debug!(entries = desired.len(), "crontab already in sync");
        }

        Ok(SyncReport {
            installed,
            removed,
            unchanged,
            task_count: desired.len(),
            changed,
        })
    }

    /// Entries currently installed between the markers.
    pub fn installed_entries(&self) -> Result<Vec<CronEntry>> {
        let current = self.backend.read().context("failed to read crontab")?;
        Ok(parse_managed_block(&current))
    }

    /// Summarizes what is currently installed between the markers.
    pub fn status(&self) -> Result<SchedulerStatus> {
        let current = self.backend.read().context("failed to read crontab")?;
        let jobs: Vec<String> = parse_managed_block(&current)
            .into_iter()
            .map(|entry| format!("{} {}", entry.expression, entry.command))
            .collect();
        Ok(SchedulerStatus {
            backend: "cron",
            installed: current.contains(MARKER_BEGIN),
            count: jobs.len(),
            jobs,
        })
    }
}

impl std::fmt::Debug for CrontabSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrontabSync").finish_non_exhaustive()
    }
}
