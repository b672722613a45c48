//! Background Task Registry — a process-wide handle table for long-running
//! shells and sub-agents promoted out of a turn (§3, §4.4, §9).
//!
//! Created lazily on first background spawn, torn down only at process
//! exit. The registry holds strong references so `TaskOutput` can read a
//! task's buffered output long after the turn that spawned it has ended.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use ac_domain::cancel::CancelToken;

use crate::output_store::Cursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundKind {
    LocalShell,
    LocalAgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

/// A promoted or directly-spawned shell command (or sub-agent) whose
/// lifetime exceeds the turn that started it.
pub struct BackgroundTask {
    pub id: String,
    pub kind: BackgroundKind,
    pub command_or_description: String,
    pub stdout: Cursor,
    pub stderr: Cursor,
    /// Cursor callers have already consumed up to, per stream — used by
    /// `flushBashNotifications` to report "new since last look".
    last_reported_stdout: std::sync::atomic::AtomicUsize,
    last_reported_stderr: std::sync::atomic::AtomicUsize,
    exit_code: AtomicI32,
    has_exit_code: AtomicBool,
    pub interrupted: AtomicBool,
    pub killed: AtomicBool,
    pub timed_out: AtomicBool,
    notified: AtomicBool,
    pub started_at: DateTime<Utc>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub cancel: CancelToken,
    pub output_file: std::path::PathBuf,
    kill_tx: RwLock<Option<mpsc::Sender<()>>>,
}

/// No real exit code is representable as `i32::MIN` internally; the public
/// getter turns that back into `None`.
const NO_EXIT_CODE: i32 = i32::MIN;

impl BackgroundTask {
    pub fn new(
        id: String,
        kind: BackgroundKind,
        command_or_description: String,
        output_file: std::path::PathBuf,
        timeout_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            kind,
            command_or_description,
            stdout: Cursor::new(),
            stderr: Cursor::new(),
            last_reported_stdout: std::sync::atomic::AtomicUsize::new(0),
            last_reported_stderr: std::sync::atomic::AtomicUsize::new(0),
            exit_code: AtomicI32::new(NO_EXIT_CODE),
            has_exit_code: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            notified: AtomicBool::new(false),
            started_at: Utc::now(),
            timeout_at,
            cancel: CancelToken::new(),
            output_file,
            kill_tx: RwLock::new(None),
        }
    }

    pub fn set_kill_sender(&self, tx: mpsc::Sender<()>) {
        *self.kill_tx.write() = Some(tx);
    }

    pub fn kill(&self) -> bool {
        if let Some(tx) = self.kill_tx.read().clone() {
            self.killed.store(true, Ordering::Release);
            let _ = tx.try_send(());
            true
        } else {
            false
        }
    }

    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
        self.has_exit_code.store(true, Ordering::Release);
        self.kill_tx.write().take();
    }

    pub fn exit_code(&self) -> Option<i32> {
        if self.has_exit_code.load(Ordering::Acquire) {
            Some(self.exit_code.load(Ordering::Acquire))
        } else {
            None
        }
    }

    pub fn status(&self) -> BackgroundStatus {
        match self.exit_code() {
            None => BackgroundStatus::Running,
            Some(_) if self.killed.load(Ordering::Acquire) => BackgroundStatus::Killed,
            Some(0) => BackgroundStatus::Completed,
            Some(_) => BackgroundStatus::Failed,
        }
    }

    /// Mark as notified exactly once; returns `true` the first time it's
    /// called after the task finished, `false` on every call after (or
    /// before completion).
    pub fn take_notification(&self) -> bool {
        if self.exit_code().is_none() {
            return false;
        }
        !self.notified.swap(true, Ordering::AcqRel)
    }

    /// Advance the stdout cursor and return what's new since the last call.
    pub fn drain_stdout(&self) -> String {
        let from = self.last_reported_stdout.load(Ordering::Acquire);
        let (chunk, next) = self.stdout.read_since(from);
        self.last_reported_stdout.store(next, Ordering::Release);
        chunk
    }

    pub fn drain_stderr(&self) -> String {
        let from = self.last_reported_stderr.load(Ordering::Acquire);
        let (chunk, next) = self.stderr.read_since(from);
        self.last_reported_stderr.store(next, Ordering::Release);
        chunk
    }
}

/// `readBackground(id, {filter?})`: an incremental read plus optional
/// line-level regex filtering.
pub struct ReadBackgroundResult {
    pub stdout: String,
    pub stderr: String,
    pub status: BackgroundStatus,
    pub exit_code: Option<i32>,
}

/// Allocate a background task id: `b` + 6 lowercase hex chars.
pub fn new_task_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("b{}", &hex[..6])
}

/// Process-wide handle table. One per process; created lazily, torn down
/// only at process exit (the registry itself outlives every turn).
#[derive(Default)]
pub struct BackgroundTaskRegistry {
    tasks: RwLock<HashMap<String, Arc<BackgroundTask>>>,
}

impl BackgroundTaskRegistry {
    pub fn new() -> Self {
        Self { tasks: RwLock::new(HashMap::new()) }
    }

    /// Allocate and register a new task, retrying the id on the
    /// vanishingly unlikely collision. `output_dir` is the task-output
    /// directory the id's `.log` mirror file lives under; the final path is
    /// built from the id allocated here, never a caller-guessed one.
    pub fn register(
        &self,
        kind: BackgroundKind,
        command_or_description: String,
        output_dir: &std::path::Path,
        timeout_at: Option<DateTime<Utc>>,
    ) -> Arc<BackgroundTask> {
        let mut tasks = self.tasks.write();
        loop {
            let id = new_task_id();
            if !tasks.contains_key(&id) {
                let output_file = output_dir.join(format!("{id}.log"));
                let task = Arc::new(BackgroundTask::new(
                    id.clone(),
                    kind,
                    command_or_description,
                    output_file,
                    timeout_at,
                ));
                tasks.insert(id, task.clone());
                return task;
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<BackgroundTask>> {
        self.tasks.read().get(id).cloned()
    }

    pub fn read(&self, id: &str, filter: Option<&regex::Regex>) -> Option<ReadBackgroundResult> {
        let task = self.get(id)?;
        let mut stdout = task.drain_stdout();
        let mut stderr = task.drain_stderr();
        if let Some(re) = filter {
            stdout = filter_lines(&stdout, re);
            stderr = filter_lines(&stderr, re);
        }
        Some(ReadBackgroundResult {
            stdout,
            stderr,
            status: task.status(),
            exit_code: task.exit_code(),
        })
    }

    pub fn kill(&self, id: &str) -> bool {
        self.get(id).map(|t| t.kill()).unwrap_or(false)
    }

    /// `flushBashNotifications` (§4.4): tasks that finished since they were
    /// last flushed, marked so each is reported exactly once.
    pub fn drain_finished_notifications(&self) -> Vec<Arc<BackgroundTask>> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.take_notification())
            .cloned()
            .collect()
    }

    pub fn list(&self) -> Vec<Arc<BackgroundTask>> {
        self.tasks.read().values().cloned().collect()
    }
}

fn filter_lines(text: &str, re: &regex::Regex) -> String {
    text.lines().filter(|l| re.is_match(l)).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_format() {
        let id = new_task_id();
        assert_eq!(id.len(), 7);
        assert!(id.starts_with('b'));
        assert!(id[1..].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn status_transitions_from_exit_code() {
        let t = BackgroundTask::new(
            "b000001".into(),
            BackgroundKind::LocalShell,
            "sleep 1".into(),
            "/tmp/b000001.log".into(),
            None,
        );
        assert_eq!(t.status(), BackgroundStatus::Running);
        t.set_exit_code(0);
        assert_eq!(t.status(), BackgroundStatus::Completed);
    }

    #[test]
    fn killed_status_overrides_nonzero_exit() {
        let t = BackgroundTask::new(
            "b000002".into(),
            BackgroundKind::LocalShell,
            "cmd".into(),
            "/tmp/b000002.log".into(),
            None,
        );
        t.killed.store(true, Ordering::Release);
        t.set_exit_code(137);
        assert_eq!(t.status(), BackgroundStatus::Killed);
    }

    #[test]
    fn notification_fires_exactly_once() {
        let t = BackgroundTask::new(
            "b000003".into(),
            BackgroundKind::LocalShell,
            "cmd".into(),
            "/tmp/b000003.log".into(),
            None,
        );
        assert!(!t.take_notification(), "not finished yet");
        t.set_exit_code(0);
        assert!(t.take_notification());
        assert!(!t.take_notification());
    }

    #[test]
    fn drain_stdout_advances_cursor() {
        let t = BackgroundTask::new(
            "b000004".into(),
            BackgroundKind::LocalShell,
            "cmd".into(),
            "/tmp/b000004.log".into(),
            None,
        );
        t.stdout.push("hello ");
        assert_eq!(t.drain_stdout(), "hello ");
        t.stdout.push("world");
        assert_eq!(t.drain_stdout(), "world");
        assert_eq!(t.drain_stdout(), "");
    }

    #[test]
    fn registry_register_and_get() {
        let reg = BackgroundTaskRegistry::new();
        let task = reg.register(
            BackgroundKind::LocalShell,
            "echo hi".into(),
            std::path::Path::new("/tmp"),
            None,
        );
        assert!(reg.get(&task.id).is_some());
        assert!(task.output_file.starts_with("/tmp"));
        assert!(reg.get("bdeadbe").is_none());
    }

    #[test]
    fn drain_finished_notifications_only_returns_completed_once() {
        let reg = BackgroundTaskRegistry::new();
        let t1 = reg.register(
            BackgroundKind::LocalShell,
            "a".into(),
            std::path::Path::new("/tmp"),
            None,
        );
        let _t2 = reg.register(
            BackgroundKind::LocalShell,
            "b".into(),
            std::path::Path::new("/tmp"),
            None,
        );
        t1.set_exit_code(0);

        let flushed = reg.drain_finished_notifications();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, t1.id);

        assert!(reg.drain_finished_notifications().is_empty());
    }
}
