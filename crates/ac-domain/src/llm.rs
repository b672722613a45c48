//! Interfaces the Turn Loop *consumes* but does not implement: the LLM
//! provider adapter, the permission callback, the auto-compact checker, and
//! the session logger. Provider wire formats, streaming transports and log
//! serialization are explicitly out of scope (§1) — this module only
//! specifies the boundary the core calls across.

use async_trait::async_trait;

use crate::capability::ToolUseBlock;
use crate::context::ToolUseContext;
use crate::tool::Message;
use crate::Result;

/// One assistant reply: free text plus zero or more tool-use requests.
#[derive(Debug, Clone, Default)]
pub struct AssistantTurn {
    pub text: String,
    pub tool_uses: Vec<ToolUseBlock>,
    /// Set when the provider itself reported an error for this turn (used
    /// by binary-feedback selection when a retry produced a better answer).
    pub is_api_error: bool,
}

/// `queryLLM` / `queryQuick` from §6. A real adapter streams tokens and
/// assembles tool-use blocks incrementally; the core only needs the final
/// assembled turn plus a cancellation-aware call shape.
#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn query(
        &self,
        history: &[Message],
        system_prompt: &[String],
        max_thinking_tokens: Option<u32>,
        tool_names: &[String],
        ctx: &ToolUseContext,
    ) -> Result<AssistantTurn>;

    /// A cheap, single-shot call used by prompt hooks (§4.6) — no tools, no
    /// history, just a system prompt and one user turn.
    async fn query_quick(&self, system: &str, user: &str, ctx: &ToolUseContext) -> Result<String>;
}

/// `(tool, input, context-with-tool-use-id, owning-assistant-message) ->
/// {result:true} | {result:false, message}` from §6.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(
        &self,
        tool_name: &str,
        input: &serde_json::Value,
        tool_use_id: &str,
        ctx: &ToolUseContext,
    ) -> PermissionOutcome;
}

#[derive(Debug, Clone)]
pub enum PermissionOutcome {
    Allow,
    Deny { message: String },
}

/// `checkAutoCompact(history, ctx) -> {messages, wasCompacted}` from §6. The
/// summarization algorithm itself is an external collaborator; the Turn Loop
/// only consumes the boolean and the replacement history.
#[async_trait]
pub trait AutoCompactChecker: Send + Sync {
    async fn check(&self, history: &[Message], ctx: &ToolUseContext) -> Result<CompactOutcome>;
}

#[derive(Debug, Clone)]
pub struct CompactOutcome {
    pub messages: Vec<Message>,
    pub was_compacted: bool,
}

/// `appendSessionJsonlFromMessage` from §6. A no-op implementation is used
/// whenever `persist_session = false` (tests, `NODE_ENV=test` equivalent).
#[async_trait]
pub trait SessionLogger: Send + Sync {
    async fn append(&self, message: &crate::message::TurnMessage, ctx: &ToolUseContext);
}

pub struct NoopSessionLogger;

#[async_trait]
impl SessionLogger for NoopSessionLogger {
    async fn append(&self, _message: &crate::message::TurnMessage, _ctx: &ToolUseContext) {}
}
