use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;

/// How aggressively the permission check should prompt before letting a
/// tool run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Prompt for everything that isn't explicitly allow-listed.
    Default,
    /// Auto-accept edits, still prompt for shell/network actions.
    AcceptEdits,
    /// Never prompt (tests, CI, `--dangerously-skip-permissions` equivalents).
    BypassPermissions,
    /// Prompt is forced even for tools that would normally be skipped —
    /// used when a PreToolUse hook sets `permissionDecision = ask`.
    Plan,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

/// Per-turn options threaded through the Turn Loop, Queue and Tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOptions {
    /// Tool names available this turn (empty = all registered tools).
    #[serde(default)]
    pub toolset: Vec<String>,
    /// Safe mode disables any tool not marked read-only.
    #[serde(default)]
    pub safe_mode: bool,
    /// Model selector (provider-specific string, opaque to the core).
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub max_thinking_tokens: Option<u32>,
    #[serde(default)]
    pub last_user_prompt: Option<String>,
    /// When false, the session logger collaborator is a no-op (tests).
    #[serde(default = "d_true")]
    pub persist_session: bool,
}

fn d_true() -> bool {
    true
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            toolset: Vec::new(),
            safe_mode: false,
            model: None,
            permission_mode: PermissionMode::Default,
            max_thinking_tokens: None,
            last_user_prompt: None,
            persist_session: true,
        }
    }
}

/// Ambient per-turn state, owned by the Turn Loop and passed by reference
/// to the Queue and every Tool. Mutated only via context-modifiers a tool
/// returns (see the runtime's queue module) — never mutated directly by a
/// running tool, so concurrency-safe tools never need to synchronize on it.
#[derive(Clone)]
pub struct ToolUseContext {
    pub cancel: CancelToken,
    pub options: TurnOptions,
    /// path → last-observed mtime (unix millis), used by write tools to
    /// detect a file changed underneath a stale read.
    pub last_read_file_timestamps: HashMap<String, i64>,
    pub agent_id: String,
    /// Id of the assistant message that owns the tool-use block(s) this
    /// context was built for.
    pub message_id: String,
}

impl ToolUseContext {
    pub fn new(agent_id: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            cancel: CancelToken::new(),
            options: TurnOptions::default(),
            last_read_file_timestamps: HashMap::new(),
            agent_id: agent_id.into(),
            message_id: message_id.into(),
        }
    }

    pub fn is_main_agent(&self) -> bool {
        self.agent_id == "main"
    }

    pub fn note_read(&mut self, path: impl Into<String>, mtime_millis: i64) {
        self.last_read_file_timestamps.insert(path.into(), mtime_millis);
    }

    pub fn last_read_at(&self, path: &str) -> Option<i64> {
        self.last_read_file_timestamps.get(path).copied()
    }
}

/// A pure function `context → context`, returned by a tool call to mutate
/// ambient state without shared mutable references. Non-concurrency-safe
/// modifiers apply immediately after the tool completes; concurrency-safe
/// modifiers are collected and applied at turn end, in enqueue order.
pub type ContextModifier = std::sync::Arc<dyn Fn(&mut ToolUseContext) + Send + Sync>;
