//! Turn Loop (§4.1): the outer `query()` generator. Turns one external call
//! — a user message (or a tool-continuation from a prior call) plus the
//! history so far — into a finished assistant reply, looping through LLM
//! calls and tool-use queues until the model stops requesting tools, a Stop
//! hook exhausts its retry budget, or the turn is cancelled.

use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use futures_util::StreamExt;

use ac_domain::cancel::CancelMap;
use ac_domain::config::hooks::HookEvent;
use ac_domain::config::tools::ExecConfig;
use ac_domain::context::{PermissionMode, ToolUseContext};
use ac_domain::llm::{AssistantTurn, AutoCompactChecker, SessionLogger};
use ac_domain::message::{interrupt_messages, TurnMessage};
use ac_domain::tool::{normalize_messages_for_api, ContentPart, Message, MessageContent, Role};
use ac_domain::trace::TraceEvent;
use ac_tools::background::BackgroundTaskRegistry;

use super::hooks::HookPayload;
use super::invoker::{HookMeta, ToolInvoker};
use super::queue::ToolUseQueue;

/// Per-`query()` cap on Stop/SubagentStop hook-forced continuations, so a
/// misbehaving hook can't keep a turn alive forever (§4.1, §9).
const MAX_STOP_HOOK_ATTEMPTS: usize = 5;

/// Defensive upper bound on LLM-call/tool-queue round-trips within one
/// `query()` call — real conversations never get close to this; it only
/// guards against a runaway tool-use/stop-hook interaction.
const MAX_TOOL_LOOPS: usize = 50;

/// The collaborators a session wires up once and reuses across every turn.
pub struct TurnRuntime {
    pub invoker: Arc<ToolInvoker>,
    pub auto_compact: Arc<dyn AutoCompactChecker>,
    pub session_logger: Arc<dyn SessionLogger>,
    pub background: Arc<BackgroundTaskRegistry>,
    pub exec_config: ExecConfig,
    pub cancel_map: Arc<CancelMap>,
}

/// One external `query()` call's input.
pub struct QueryInput {
    pub history: Vec<Message>,
    pub system_prompt: Vec<String>,
    pub ctx: ToolUseContext,
    pub hook_meta: HookMeta,
    /// Key this turn registers under in the shared [`CancelMap`] — a
    /// session id for a top-level turn, or a synthesized sub-agent key.
    pub turn_key: String,
}

impl TurnRuntime {
    /// Run one external query, yielding every [`TurnMessage`] produced along
    /// the way (progress, assistant replies, tool results, background-task
    /// notifications). The stream ends once the turn is finished, cancelled,
    /// or gives up on the model ever stopping.
    pub fn query(self: Arc<Self>, input: QueryInput) -> Pin<Box<dyn Stream<Item = TurnMessage> + Send>> {
        Box::pin(async_stream::stream! {
            let QueryInput { mut history, system_prompt, mut ctx, hook_meta, turn_key } = input;

            // The turn registers its own token under `turn_key` so a caller
            // can cancel it later by key; a caller that already cancelled
            // the incoming context (e.g. a race with a user interrupt)
            // still has that signal carried over onto the registered token.
            let cancel = self.cancel_map.register(&turn_key);
            if ctx.cancel.is_cancelled() {
                cancel.cancel();
            }
            ctx.cancel = cancel.clone();

            TraceEvent::TurnStarted { session_key: turn_key.clone(), history_len: history.len() }.emit();

            // UserPromptSubmit fires once per external query(), not on every
            // internal LLM-call iteration that follows a tool-use round trip.
            let prompt_payload = HookPayload {
                session_id: hook_meta.session_id.clone(),
                transcript_path: hook_meta.transcript_path.clone(),
                cwd: hook_meta.cwd.clone(),
                hook_event_name: HookEvent::UserPromptSubmit.as_str(),
                permission_mode: format!("{:?}", ctx.options.permission_mode),
                tool_name: None,
                tool_input: None,
                tool_result: None,
                tool_use_id: None,
                user_prompt: ctx.options.last_user_prompt.clone(),
                reason: None,
            };
            let prompt_outcome = self
                .invoker
                .hooks
                .run(HookEvent::UserPromptSubmit, None, &prompt_payload, Some(self.invoker.llm.as_ref()), Some(&ctx))
                .await;

            if prompt_outcome.blocked {
                let message = TurnMessage::interrupt_text(
                    prompt_outcome.block_message.unwrap_or_else(|| "blocked by UserPromptSubmit hook".into()),
                );
                yield message;
                self.cancel_map.remove(&turn_key);
                TraceEvent::TurnFinished { session_key: turn_key, tool_loops: 0, cancelled: false }.emit();
                return;
            }
            if let Some(extra) = prompt_outcome.additional_context {
                history.push(Message::user(extra));
            }

            let mut tool_loops = 0usize;
            let mut stop_attempts = 0usize;
            let mut cancelled = false;

            loop {
                if cancel.is_cancelled() {
                    TraceEvent::Cancelled { session_key: turn_key.clone(), scope: "turn" }.emit();
                    yield TurnMessage::interrupt_text(interrupt_messages::INTERRUPT_MESSAGE);
                    cancelled = true;
                    break;
                }
                if tool_loops >= MAX_TOOL_LOOPS {
                    yield TurnMessage::interrupt_text("[turn ended: maximum tool loops exceeded]");
                    break;
                }

                if let Ok(outcome) = self.auto_compact.check(&history, &ctx).await {
                    if outcome.was_compacted {
                        let turns_compacted = history.len().saturating_sub(outcome.messages.len());
                        let summary_len = outcome
                            .messages
                            .last()
                            .map(|m| m.content.extract_all_text().len())
                            .unwrap_or(0);
                        history = outcome.messages;
                        TraceEvent::TurnCompacted { session_key: turn_key.clone(), turns_compacted, summary_len }.emit();
                    }
                }

                for notice in flush_background_notifications(&self.background, &self.exec_config) {
                    if let Some(domain) = to_domain(&notice) {
                        history.push(domain);
                    }
                    yield notice;
                }

                if cancel.is_cancelled() {
                    TraceEvent::Cancelled { session_key: turn_key.clone(), scope: "turn" }.emit();
                    yield TurnMessage::interrupt_text(interrupt_messages::INTERRUPT_MESSAGE);
                    cancelled = true;
                    break;
                }

                let normalized = normalize_messages_for_api(&history);
                let tool_names = self.resolve_tool_names(&ctx);
                let turn = match self
                    .invoker
                    .llm
                    .query(&normalized, &system_prompt, ctx.options.max_thinking_tokens, &tool_names, &ctx)
                    .await
                {
                    Ok(turn) => turn,
                    Err(e) => {
                        yield TurnMessage::interrupt_text(format!("[LLM error: {e}]"));
                        break;
                    }
                };

                let assistant_message = assistant_turn_message(&turn);
                if let Some(domain) = to_domain(&assistant_message) {
                    history.push(domain);
                }
                self.session_logger.append(&assistant_message, &ctx).await;
                yield assistant_message;

                if turn.tool_uses.is_empty() {
                    let event = if ctx.is_main_agent() { HookEvent::Stop } else { HookEvent::SubagentStop };
                    let payload = HookPayload {
                        session_id: hook_meta.session_id.clone(),
                        transcript_path: hook_meta.transcript_path.clone(),
                        cwd: hook_meta.cwd.clone(),
                        hook_event_name: event.as_str(),
                        permission_mode: format!("{:?}", ctx.options.permission_mode),
                        tool_name: None,
                        tool_input: None,
                        tool_result: None,
                        tool_use_id: None,
                        user_prompt: None,
                        reason: None,
                    };
                    let outcome = self
                        .invoker
                        .hooks
                        .run(event, None, &payload, Some(self.invoker.llm.as_ref()), Some(&ctx))
                        .await;

                    if outcome.blocked && stop_attempts < MAX_STOP_HOOK_ATTEMPTS {
                        stop_attempts += 1;
                        let reason = outcome.block_message.unwrap_or_else(|| "continue".into());
                        history.push(Message::user(reason));
                        continue;
                    }
                    break;
                }

                tool_loops += 1;
                let skip_permission = matches!(ctx.options.permission_mode, PermissionMode::BypassPermissions);
                let queue = Arc::new(ToolUseQueue::new(
                    self.invoker.clone(),
                    turn.tool_uses.clone(),
                    ctx.clone(),
                    hook_meta.clone(),
                    skip_permission,
                ));

                let mut drained = queue.clone().drain();
                while let Some(result_message) = drained.next().await {
                    if let Some(domain) = to_domain(&result_message) {
                        history.push(domain);
                    }
                    yield result_message;
                }

                queue.get_updated_context(&mut ctx);
                for followup in queue.followups() {
                    if let Some(domain) = to_domain(&followup) {
                        history.push(domain);
                    }
                    yield followup;
                }

                if cancel.is_cancelled() {
                    TraceEvent::Cancelled { session_key: turn_key.clone(), scope: "tool_use" }.emit();
                    yield TurnMessage::interrupt_text(interrupt_messages::INTERRUPT_MESSAGE_FOR_TOOL_USE);
                    cancelled = true;
                    break;
                }
            }

            self.cancel_map.remove(&turn_key);
            TraceEvent::TurnFinished { session_key: turn_key, tool_loops, cancelled }.emit();
        })
    }

    /// Tool names the LLM is offered this turn: read-only only under
    /// `safe_mode`, the explicit toolset when one was requested, otherwise
    /// every registered tool.
    fn resolve_tool_names(&self, ctx: &ToolUseContext) -> Vec<String> {
        if ctx.options.safe_mode {
            return self.invoker.registry.read_only_names();
        }
        if ctx.options.toolset.is_empty() {
            self.invoker.registry.names()
        } else {
            ctx.options.toolset.clone()
        }
    }
}

/// Fold a persisted [`TurnMessage`] into the LLM-wire-format history.
/// `Progress` is transient and UI-only — it never reaches the model.
fn to_domain(msg: &TurnMessage) -> Option<Message> {
    match msg {
        TurnMessage::User { id, content } => Some(Message {
            role: Role::User,
            content: MessageContent::Parts(content.clone()),
            id: Some(id.clone()),
            is_api_error: false,
        }),
        TurnMessage::Assistant { id, content } => Some(Message {
            role: Role::Assistant,
            content: MessageContent::Parts(content.clone()),
            id: Some(id.clone()),
            is_api_error: false,
        }),
        TurnMessage::Progress { .. } => None,
    }
}

fn assistant_turn_message(turn: &AssistantTurn) -> TurnMessage {
    let mut parts = Vec::new();
    if !turn.text.is_empty() {
        parts.push(ContentPart::Text { text: turn.text.clone() });
    }
    for tool_use in &turn.tool_uses {
        parts.push(ContentPart::ToolUse {
            id: tool_use.id.clone(),
            name: tool_use.name.clone(),
            input: tool_use.input.clone(),
        });
    }
    TurnMessage::new_assistant(parts)
}

/// `flushBashNotifications` (§4.4): render every background task that
/// finished since it was last flushed as a user-turn message, skipping
/// notification entirely when the config says not to bother.
fn flush_background_notifications(registry: &BackgroundTaskRegistry, cfg: &ExecConfig) -> Vec<TurnMessage> {
    if !cfg.notify_on_exit {
        return Vec::new();
    }
    registry
        .drain_finished_notifications()
        .into_iter()
        .filter_map(|task| {
            let stdout = task.drain_stdout();
            let stderr = task.drain_stderr();
            let exit_code = task.exit_code();
            if cfg.notify_on_exit_empty_success && exit_code == Some(0) && stdout.is_empty() && stderr.is_empty() {
                return None;
            }
            let mut text = format!("[background task {} finished: {:?}", task.id, task.status());
            if let Some(code) = exit_code {
                text.push_str(&format!(", exit code {code}"));
            }
            text.push(']');
            if !stdout.is_empty() {
                text.push_str(&format!("\nstdout:\n{stdout}"));
            }
            if !stderr.is_empty() {
                text.push_str(&format!("\nstderr:\n{stderr}"));
            }
            Some(TurnMessage::new_user(vec![ContentPart::Text { text }]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ac_domain::capability::{ToolCapability, ToolEvent, ToolEventStream, ToolUseBlock};
    use ac_domain::config::hooks::HooksConfig;
    use ac_domain::context::{PermissionMode, ToolUseContext, TurnOptions};
    use ac_domain::llm::{CompactOutcome, LlmAdapter, PermissionChecker, PermissionOutcome};
    use ac_domain::Result as AcResult;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::super::hooks::HookRunner;
    use super::super::registry::ToolRegistry;

    struct AllowAll;
    #[async_trait]
    impl PermissionChecker for AllowAll {
        async fn check(&self, _tool: &str, _input: &Value, _id: &str, _ctx: &ToolUseContext) -> PermissionOutcome {
            PermissionOutcome::Allow
        }
    }

    struct NoopCompact;
    #[async_trait]
    impl AutoCompactChecker for NoopCompact {
        async fn check(&self, history: &[Message], _ctx: &ToolUseContext) -> AcResult<CompactOutcome> {
            Ok(CompactOutcome { messages: history.to_vec(), was_compacted: false })
        }
    }

    struct RecordingLogger {
        appended: Mutex<Vec<String>>,
    }
    #[async_trait]
    impl SessionLogger for RecordingLogger {
        async fn append(&self, message: &TurnMessage, _ctx: &ToolUseContext) {
            self.appended.lock().push(message.id().to_string());
        }
    }

    /// Replies with a tool-use on its first call, then no tool-uses (the
    /// turn stops naturally after one tool round trip).
    struct OneShotToolLlm {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl LlmAdapter for OneShotToolLlm {
        async fn query(
            &self,
            _history: &[Message],
            _system_prompt: &[String],
            _max_thinking_tokens: Option<u32>,
            _tool_names: &[String],
            _ctx: &ToolUseContext,
        ) -> AcResult<AssistantTurn> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(AssistantTurn {
                    text: "let me check".into(),
                    tool_uses: vec![ToolUseBlock { id: "t1".into(), name: "Echo".into(), input: json!({}) }],
                    is_api_error: false,
                })
            } else {
                Ok(AssistantTurn { text: "done".into(), tool_uses: vec![], is_api_error: false })
            }
        }
        async fn query_quick(&self, _system: &str, _user: &str, _ctx: &ToolUseContext) -> AcResult<String> {
            Ok(String::new())
        }
    }

    struct NeverStopsToolLlm;
    #[async_trait]
    impl LlmAdapter for NeverStopsToolLlm {
        async fn query(
            &self,
            _history: &[Message],
            _system_prompt: &[String],
            _max_thinking_tokens: Option<u32>,
            _tool_names: &[String],
            _ctx: &ToolUseContext,
        ) -> AcResult<AssistantTurn> {
            Ok(AssistantTurn {
                text: String::new(),
                tool_uses: vec![ToolUseBlock { id: "loop".into(), name: "Echo".into(), input: json!({}) }],
                is_api_error: false,
            })
        }
        async fn query_quick(&self, _system: &str, _user: &str, _ctx: &ToolUseContext) -> AcResult<String> {
            Ok(String::new())
        }
    }

    struct EchoTool;
    #[async_trait]
    impl ToolCapability for EchoTool {
        fn name(&self) -> &'static str {
            "Echo"
        }
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn is_read_only(&self) -> bool {
            true
        }
        async fn validate_input(&self, _input: &Value, _ctx: &ToolUseContext) -> AcResult<()> {
            Ok(())
        }
        fn call(&self, _input: Value, _ctx: ToolUseContext) -> ToolEventStream {
            Box::pin(futures_util::stream::once(async { Ok(ToolEvent::ok(json!("ok"), "ok")) }))
        }
    }

    fn ctx() -> ToolUseContext {
        ToolUseContext {
            options: TurnOptions { permission_mode: PermissionMode::BypassPermissions, ..TurnOptions::default() },
            ..ToolUseContext::new("main", "m1")
        }
    }

    fn hook_meta() -> HookMeta {
        HookMeta { session_id: "s".into(), transcript_path: "/tmp/t".into(), cwd: "/tmp".into() }
    }

    fn runtime(llm: Arc<dyn LlmAdapter>) -> Arc<TurnRuntime> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let invoker = Arc::new(ToolInvoker {
            registry: Arc::new(registry),
            hooks: Arc::new(HookRunner::new(HooksConfig::default(), "/tmp".into())),
            permission: Arc::new(AllowAll),
            llm,
        });
        Arc::new(TurnRuntime {
            invoker,
            auto_compact: Arc::new(NoopCompact),
            session_logger: Arc::new(RecordingLogger { appended: Mutex::new(Vec::new()) }),
            background: Arc::new(BackgroundTaskRegistry::new()),
            exec_config: ExecConfig::default(),
            cancel_map: Arc::new(CancelMap::new()),
        })
    }

    #[tokio::test]
    async fn one_tool_round_trip_then_stops() {
        let rt = runtime(Arc::new(OneShotToolLlm { calls: AtomicUsize::new(0) }));
        let input = QueryInput {
            history: vec![Message::user("check something")],
            system_prompt: vec!["be helpful".into()],
            ctx: ctx(),
            hook_meta: hook_meta(),
            turn_key: "turn-1".into(),
        };
        let messages: Vec<_> = rt.query(input).collect().await;

        // First assistant message (with the tool-use), the tool result, and
        // the final assistant message.
        let assistants: Vec<_> = messages
            .iter()
            .filter(|m| matches!(m, TurnMessage::Assistant { .. }))
            .collect();
        assert_eq!(assistants.len(), 2);
        assert!(messages.iter().any(|m| matches!(m, TurnMessage::User { content, .. } if content.iter().any(|p| matches!(p, ContentPart::ToolResult { .. })))));
    }

    #[tokio::test]
    async fn cancellation_before_first_llm_call_yields_interrupt_message() {
        let rt = runtime(Arc::new(NeverStopsToolLlm));
        let c = ctx();
        c.cancel.cancel();
        let input = QueryInput {
            history: vec![Message::user("hi")],
            system_prompt: vec![],
            ctx: c,
            hook_meta: hook_meta(),
            turn_key: "turn-cancelled".into(),
        };
        let messages: Vec<_> = rt.query(input).collect().await;
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            TurnMessage::Assistant { content, .. } => {
                assert!(content.iter().any(|p| matches!(p, ContentPart::Text { text } if text == interrupt_messages::INTERRUPT_MESSAGE)));
            }
            _ => panic!("expected an assistant interrupt message"),
        }
    }

    #[tokio::test]
    async fn runaway_tool_loop_is_bounded() {
        let rt = runtime(Arc::new(NeverStopsToolLlm));
        let input = QueryInput {
            history: vec![Message::user("keep going forever")],
            system_prompt: vec![],
            ctx: ctx(),
            hook_meta: hook_meta(),
            turn_key: "turn-bounded".into(),
        };
        let messages: Vec<_> = rt.query(input).collect().await;
        assert!(!rt.cancel_map.is_running("turn-bounded"));
        assert!(messages.len() > MAX_TOOL_LOOPS);
    }
}
