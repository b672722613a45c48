//! Built-in [`ToolCapability`] implementations — the concrete tools the
//! Tool Registry hands to the Queue. Each wraps a primitive from
//! [`crate::file_ops`], [`crate::shell`], [`crate::background`] or
//! [`crate::search`] behind the capability record seam; none of them holds
//! turn- or session-level state, only the collaborators they need (a
//! workspace root, a shell executor, a task registry).

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use ac_domain::capability::{ToolCapability, ToolEvent, ToolEventStream};
use ac_domain::context::ToolUseContext;
use ac_domain::{Error, Result};

use crate::background::BackgroundTaskRegistry;
use crate::file_ops::{
    self, FileDeleteRequest, FileEditRequest, FileListRequest, FileMoveRequest, FileReadRequest,
    FileWriteRequest,
};
use crate::search::{self, GlobRequest, GrepRequest};
use crate::shell::{ShellExecutor, ShellOutcome, ShellRequest};

/// Wraps a future resolving to one terminal [`ToolEvent`] (or an error) into
/// the one-shot stream every [`ToolCapability::call`] returns.
fn single_event(fut: impl Future<Output = Result<ToolEvent>> + Send + 'static) -> ToolEventStream {
    Box::pin(futures_util::stream::once(fut))
}

fn to_domain_err(message: impl Into<String>) -> Error {
    Error::InvalidInput(message.into())
}

async fn file_mtime_millis(path: &std::path::Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    let modified = meta.modified().ok()?;
    let millis = modified.duration_since(std::time::UNIX_EPOCH).ok()?.as_millis();
    i64::try_from(millis).ok()
}

/// Requires a file that exists to have been read by this agent, and not
/// modified on disk since, before it can be blindly written or edited —
/// the same "stale read" guard [`ToolUseContext::last_read_file_timestamps`]
/// exists for.
async fn require_fresh_read(workspace_root: &std::path::Path, rel_path: &str, ctx: &ToolUseContext) -> Result<()> {
    let absolute = workspace_root.join(rel_path);
    let Some(current_mtime) = file_mtime_millis(&absolute).await else {
        return Ok(()); // file doesn't exist yet: nothing to protect against
    };
    match ctx.last_read_at(rel_path) {
        None => Err(to_domain_err(format!(
            "'{rel_path}' exists but has not been read in this turn; read it before writing or editing it"
        ))),
        Some(recorded) if recorded < current_mtime => Err(to_domain_err(format!(
            "'{rel_path}' has changed on disk since it was last read; re-read it before writing or editing it"
        ))),
        Some(_) => Ok(()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ReadTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for ReadTool {
    fn name(&self) -> &'static str {
        "Read"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "offset": { "type": "integer", "minimum": 0 },
                "limit": { "type": "integer", "minimum": 1 },
            },
            "required": ["path"],
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        serde_json::from_value::<FileReadRequest>(input.clone())
            .map(|_| ())
            .map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: FileReadRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let path = req.path.clone();
            let absolute = workspace_root.join(&path);
            let result = file_ops::file_read(&workspace_root, req).await.map_err(to_domain_err)?;
            let render = result["content"].as_str().unwrap_or_default().to_string();

            let event = ToolEvent::ok(result, render);
            let event = match file_mtime_millis(&absolute).await {
                Some(mtime) => {
                    let modifier: ac_domain::context::ContextModifier =
                        Arc::new(move |ctx: &mut ToolUseContext| ctx.note_read(path.clone(), mtime));
                    event.with_modifier(modifier)
                }
                None => event,
            };
            Ok(event)
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WriteTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for WriteTool {
    fn name(&self) -> &'static str {
        "Write"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" },
            },
            "required": ["path", "content"],
        })
    }

    async fn validate_input(&self, input: &Value, ctx: &ToolUseContext) -> Result<()> {
        let req: FileWriteRequest = serde_json::from_value(input.clone()).map_err(|e| to_domain_err(e.to_string()))?;
        require_fresh_read(&self.workspace_root, &req.path, ctx).await
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: FileWriteRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = file_ops::file_write(&workspace_root, req).await.map_err(to_domain_err)?;
            Ok(ToolEvent::ok(result.clone(), format!("Wrote {} bytes", result["bytes_written"])))
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Edit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EditTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for EditTool {
    fn name(&self) -> &'static str {
        "Edit"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "old_string": { "type": "string" },
                "new_string": { "type": "string" },
                "replace_all": { "type": "boolean" },
            },
            "required": ["path", "old_string", "new_string"],
        })
    }

    async fn validate_input(&self, input: &Value, ctx: &ToolUseContext) -> Result<()> {
        let req: FileEditRequest = serde_json::from_value(input.clone()).map_err(|e| to_domain_err(e.to_string()))?;
        require_fresh_read(&self.workspace_root, &req.path, ctx).await
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: FileEditRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = file_ops::file_edit(&workspace_root, req).await.map_err(to_domain_err)?;
            Ok(ToolEvent::ok(result.clone(), format!("Replaced {} occurrence(s)", result["replacements"])))
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// List / Move / Delete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ListTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for ListTool {
    fn name(&self) -> &'static str {
        "ListDir"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        serde_json::from_value::<FileListRequest>(input.clone())
            .map(|_| ())
            .map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: FileListRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = file_ops::file_list(&workspace_root, req).await.map_err(to_domain_err)?;
            let render = result["entries"]
                .as_array()
                .map(|entries| entries.iter().filter_map(|e| e["name"].as_str()).collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();
            Ok(ToolEvent::ok(result, render))
        })
    }
}

pub struct MoveTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for MoveTool {
    fn name(&self) -> &'static str {
        "MoveFile"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": { "type": "string" },
                "destination": { "type": "string" },
            },
            "required": ["source", "destination"],
        })
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        serde_json::from_value::<FileMoveRequest>(input.clone())
            .map(|_| ())
            .map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: FileMoveRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = file_ops::file_move(&workspace_root, req).await.map_err(to_domain_err)?;
            Ok(ToolEvent::ok(result.clone(), format!("Moved to {}", result["destination"])))
        })
    }
}

pub struct DeleteTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for DeleteTool {
    fn name(&self) -> &'static str {
        "DeleteFile"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        })
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        serde_json::from_value::<FileDeleteRequest>(input.clone())
            .map(|_| ())
            .map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: FileDeleteRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = file_ops::file_delete(&workspace_root, req).await.map_err(to_domain_err)?;
            Ok(ToolEvent::ok(result.clone(), format!("Deleted {}", result["path"])))
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Glob / Grep
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GlobTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for GlobTool {
    fn name(&self) -> &'static str {
        "Glob"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string" },
            },
            "required": ["pattern"],
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        serde_json::from_value::<GlobRequest>(input.clone())
            .map(|_| ())
            .map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: GlobRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = search::glob_search(&workspace_root, req).await.map_err(to_domain_err)?;
            let render = result["matches"]
                .as_array()
                .map(|m| m.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join("\n"))
                .unwrap_or_default();
            Ok(ToolEvent::ok(result, render))
        })
    }
}

pub struct GrepTool {
    pub workspace_root: PathBuf,
}

#[async_trait]
impl ToolCapability for GrepTool {
    fn name(&self) -> &'static str {
        "Grep"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string" },
                "glob": { "type": "string" },
                "case_insensitive": { "type": "boolean" },
            },
            "required": ["pattern"],
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        serde_json::from_value::<GrepRequest>(input.clone())
            .map(|_| ())
            .map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let workspace_root = self.workspace_root.clone();
        single_event(async move {
            let req: GrepRequest = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let result = search::grep_search(&workspace_root, req).await.map_err(to_domain_err)?;
            let render = result["matches"]
                .as_array()
                .map(|m| {
                    m.iter()
                        .map(|entry| format!("{}:{}:{}", entry["path"].as_str().unwrap_or_default(), entry["line_number"], entry["line"].as_str().unwrap_or_default()))
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            Ok(ToolEvent::ok(result, render))
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bash
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, serde::Deserialize)]
struct BashInput {
    command: String,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    run_in_background: bool,
}

pub struct BashTool {
    pub executor: Arc<ShellExecutor>,
    pub workdir: PathBuf,
}

#[async_trait]
impl ToolCapability for BashTool {
    fn name(&self) -> &'static str {
        "Bash"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string" },
                "timeout": { "type": "integer", "minimum": 1 },
                "run_in_background": { "type": "boolean" },
            },
            "required": ["command"],
        })
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        let parsed: BashInput = serde_json::from_value(input.clone()).map_err(|e| to_domain_err(e.to_string()))?;
        let req = ShellRequest {
            command: parsed.command,
            workdir: self.workdir.clone(),
            env: Default::default(),
            yield_ms: None,
            timeout_sec: parsed.timeout,
            run_in_background: parsed.run_in_background,
        };
        self.executor.validate(&req).map_err(|e| to_domain_err(e.to_string()))
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let executor = self.executor.clone();
        let workdir = self.workdir.clone();
        single_event(async move {
            let parsed: BashInput = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let req = ShellRequest {
                command: parsed.command,
                workdir,
                env: Default::default(),
                yield_ms: None,
                timeout_sec: parsed.timeout,
                run_in_background: parsed.run_in_background,
            };
            match executor.run(req).await.map_err(|e| to_domain_err(e.to_string()))? {
                ShellOutcome::Completed { exit_code, output, .. } => {
                    let is_error = exit_code.map(|c| c != 0).unwrap_or(false);
                    Ok(ToolEvent::Result {
                        data: json!({ "exit_code": exit_code, "output": output }),
                        render_for_assistant: output,
                        is_error,
                        context_modifier: None,
                        followups: Vec::new(),
                    })
                }
                ShellOutcome::Backgrounded { task_id, tail } => Ok(ToolEvent::ok(
                    json!({ "task_id": task_id, "tail": tail }),
                    format!("Running in background as task {task_id}\n{tail}"),
                )),
            }
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// BashOutput / KillBash
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, serde::Deserialize)]
struct BashOutputInput {
    task_id: String,
    #[serde(default)]
    filter: Option<String>,
}

pub struct BashOutputTool {
    pub registry: Arc<BackgroundTaskRegistry>,
}

#[async_trait]
impl ToolCapability for BashOutputTool {
    fn name(&self) -> &'static str {
        "BashOutput"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task_id": { "type": "string" },
                "filter": { "type": "string" },
            },
            "required": ["task_id"],
        })
    }

    fn is_read_only(&self) -> bool {
        true
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        let parsed: BashOutputInput = serde_json::from_value(input.clone()).map_err(|e| to_domain_err(e.to_string()))?;
        if self.registry.get(&parsed.task_id).is_none() {
            return Err(to_domain_err(format!("no background task with id '{}'", parsed.task_id)));
        }
        Ok(())
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let registry = self.registry.clone();
        single_event(async move {
            let parsed: BashOutputInput = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let filter = parsed
                .filter
                .as_deref()
                .map(regex::Regex::new)
                .transpose()
                .map_err(|e| to_domain_err(e.to_string()))?;
            let result = registry
                .read(&parsed.task_id, filter.as_ref())
                .ok_or_else(|| to_domain_err(format!("no background task with id '{}'", parsed.task_id)))?;
            let render = format!("{}{}", result.stdout, result.stderr);
            Ok(ToolEvent::ok(
                json!({
                    "status": format!("{:?}", result.status),
                    "exit_code": result.exit_code,
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                }),
                render,
            ))
        })
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct KillBashInput {
    task_id: String,
}

pub struct KillBashTool {
    pub registry: Arc<BackgroundTaskRegistry>,
}

#[async_trait]
impl ToolCapability for KillBashTool {
    fn name(&self) -> &'static str {
        "KillBash"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "task_id": { "type": "string" } },
            "required": ["task_id"],
        })
    }

    async fn validate_input(&self, input: &Value, _ctx: &ToolUseContext) -> Result<()> {
        let parsed: KillBashInput = serde_json::from_value(input.clone()).map_err(|e| to_domain_err(e.to_string()))?;
        if self.registry.get(&parsed.task_id).is_none() {
            return Err(to_domain_err(format!("no background task with id '{}'", parsed.task_id)));
        }
        Ok(())
    }

    fn call(&self, input: Value, _ctx: ToolUseContext) -> ToolEventStream {
        let registry = self.registry.clone();
        single_event(async move {
            let parsed: KillBashInput = serde_json::from_value(input).map_err(|e| to_domain_err(e.to_string()))?;
            let killed = registry.kill(&parsed.task_id);
            Ok(ToolEvent::ok(
                json!({ "task_id": parsed.task_id, "killed": killed }),
                if killed { format!("Killed task {}", parsed.task_id) } else { format!("Task {} was not running", parsed.task_id) },
            ))
        })
    }
}
