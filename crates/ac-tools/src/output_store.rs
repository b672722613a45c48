//! Output Store — append-only per-task byte log with a file mirror (§3).
//!
//! A [`BackgroundTask`] keeps its latest output in memory for cheap
//! incremental reads, but every chunk is also mirrored to a file under the
//! task-output directory so a crashed or restarted process can still recover
//! a finished task's full output, and so `SessionStart` env injection has a
//! stable `CLAUDE_ENV_FILE`-shaped path to point at (§6).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// One append-only log, mirrored to `<dir>/<task_id>.log`.
pub struct OutputStore {
    dir: PathBuf,
}

impl OutputStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.log"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the mirror file for a task, truncating any stale content.
    pub async fn create(&self, task_id: &str) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(task_id);
        OpenOptions::new().create(true).write(true).truncate(true).open(&path).await?;
        Ok(path)
    }

    /// Append a chunk to the task's mirror file.
    pub async fn append(&self, task_id: &str, chunk: &str) -> std::io::Result<()> {
        let path = self.path_for(task_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(chunk.as_bytes()).await
    }
}

/// In-memory append-only buffer with a byte cursor, used by
/// [`crate::background::BackgroundTask`] for stdout/stderr. Cheap clones
/// share the same backing storage so cursors can be handed out freely.
#[derive(Clone, Default)]
pub struct Cursor(Arc<Mutex<String>>);

impl Cursor {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(String::new())))
    }

    pub fn push(&self, chunk: &str) {
        self.0.lock().push_str(chunk);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Read everything appended since byte offset `from`, and the new
    /// offset to pass on the next call (monotonically advancing).
    pub fn read_since(&self, from: usize) -> (String, usize) {
        let buf = self.0.lock();
        let start = from.min(buf.len());
        (buf[start..].to_owned(), buf.len())
    }

    pub fn snapshot(&self) -> String {
        self.0.lock().clone()
    }

    pub fn line_count(&self) -> usize {
        self.0.lock().lines().count()
    }
}

/// Resolve the per-session task-output directory: `<base>/<session_id>/tasks`.
pub fn task_output_dir(base: &Path, session_id: &str) -> PathBuf {
    base.join(session_id).join("tasks")
}
