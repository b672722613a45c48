//! The `Tool` capability record (§3 of the runtime's data model) and the
//! lazy event stream every tool call produces.
//!
//! A tool is not an enum of builtin behaviors — it is a capability record
//! {name, schema, predicates, validate, call} that the Tool Registry hands
//! to the Queue. Dynamic tool typing lives at exactly one seam: the JSON
//! input value a tool receives is opaque until `validate_input` narrows it.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::{ContextModifier, ToolUseContext};
use crate::message::TurnMessage;
use crate::Result;

/// One `tool_use` (or `server_tool_use` / `mcp_tool_use`) block extracted
/// from an assistant message.
#[derive(Debug, Clone)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// A boxed, `Send`, finite lazy sequence of tool events. Ends after exactly
/// one [`ToolEvent::Result`] (success or error) or the stream yields an
/// `Err` and terminates.
pub type ToolEventStream = Pin<Box<dyn futures_core::Stream<Item = Result<ToolEvent>> + Send>>;

/// One element of a tool's lazy output sequence.
#[derive(Debug, Clone)]
pub enum ToolEvent {
    /// Transient, UI-facing progress. Never the final event.
    Progress {
        text: String,
        #[allow(dead_code)]
        data: Option<Value>,
    },
    /// The terminal event. Exactly one is produced per successful call.
    Result {
        /// Structured data a caller (e.g. another tool, a test) can inspect.
        data: Value,
        /// The text the next LLM turn actually sees.
        render_for_assistant: String,
        is_error: bool,
        /// A pure `context -> context` update to apply (see §5 semantics
        /// on when non-concurrency-safe vs. concurrency-safe modifiers land).
        context_modifier: Option<ContextModifier>,
        /// Messages to emit into the transcript right after this result
        /// (e.g. a hook's `systemMessage`).
        followups: Vec<TurnMessage>,
    },
}

impl ToolEvent {
    pub fn ok(data: Value, render_for_assistant: impl Into<String>) -> Self {
        ToolEvent::Result {
            data,
            render_for_assistant: render_for_assistant.into(),
            is_error: false,
            context_modifier: None,
            followups: Vec::new(),
        }
    }

    pub fn err(render_for_assistant: impl Into<String>) -> Self {
        let text = render_for_assistant.into();
        ToolEvent::Result {
            data: Value::Null,
            render_for_assistant: text,
            is_error: true,
            context_modifier: None,
            followups: Vec::new(),
        }
    }

    pub fn with_modifier(mut self, modifier: ContextModifier) -> Self {
        if let ToolEvent::Result { context_modifier, .. } = &mut self {
            *context_modifier = Some(modifier);
        }
        self
    }
}

/// The capability record every tool implements. `name`, `input_schema`,
/// `is_read_only` and `is_concurrency_safe` are pure/cheap; `validate_input`
/// may touch the filesystem (existence, read-timestamp freshness) but must
/// not mutate anything observable; `call` is where side effects happen.
#[async_trait]
pub trait ToolCapability: Send + Sync {
    fn name(&self) -> &'static str;

    /// JSON Schema describing this tool's input shape, surfaced to the LLM.
    fn input_schema(&self) -> Value;

    /// Read-only tools are always concurrency-safe and never prompt for
    /// write/execute permission under `safe_mode`.
    fn is_read_only(&self) -> bool {
        false
    }

    /// Pure predicate over *validated* input. A tool that is concurrency-safe
    /// promises it performs no observable mutation that could race a sibling.
    fn is_concurrency_safe(&self, input: &Value) -> bool {
        self.is_read_only()
    }

    /// Semantic validation beyond JSON Schema: existence checks, read-time
    /// freshness, cross-field constraints. Schema validation happens earlier,
    /// in the invoker, using [`ToolCapability::input_schema`].
    async fn validate_input(&self, input: &Value, ctx: &ToolUseContext) -> Result<()>;

    /// Normalize input after hooks have had a chance to rewrite it (e.g. the
    /// shell tool strips a leading `cd <cwd> &&`). Default is a no-op.
    fn normalize_input(&self, input: Value, _ctx: &ToolUseContext) -> Value {
        input
    }

    /// Execute the tool. Returns a lazy stream terminating in one `Result`
    /// event, or an `Err` if the tool could not even start.
    fn call(&self, input: Value, ctx: ToolUseContext) -> ToolEventStream;
}

/// Convenience alias used by call sites that build a boxed future for
/// validate_input manually (e.g. test doubles implemented without the
/// `async_trait` macro).
pub type ValidateFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
