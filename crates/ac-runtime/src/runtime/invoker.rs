//! Tool Invoker (§4.3): `check-permissions-and-call-tool`. Input
//! preprocessing, schema validation, semantic validation, `PreToolUse` /
//! `PostToolUse` hooks, permission checking, normalization, and driving the
//! tool's own event stream to completion — the full per-tool-use lifecycle
//! the Queue drives one entry through.

use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use futures_util::StreamExt;
use jsonschema::JSONSchema;
use serde_json::Value;

use ac_domain::capability::{ToolEvent, ToolUseBlock};
use ac_domain::config::hooks::HookEvent;
use ac_domain::context::{ContextModifier, PermissionMode, ToolUseContext};
use ac_domain::llm::{LlmAdapter, PermissionChecker, PermissionOutcome};
use ac_domain::message::TurnMessage;

use super::hooks::{HookPayload, HookRunner};
use super::registry::ToolRegistry;

/// The maximum length of a formatted tool error before head/tail truncation
/// kicks in (§4.3, §7).
const MAX_ERROR_CHARS: usize = 10_000;

/// One event the invoker yields while driving a single tool-use block.
pub enum InvocationEvent {
    Progress(TurnMessage),
    Result {
        message: TurnMessage,
        is_error: bool,
        context_modifier: Option<ContextModifier>,
        followups: Vec<TurnMessage>,
    },
}

/// Everything the invoker needs beyond the tool-use block and context
/// itself: where to look tools up, how to run hooks, how to check
/// permissions, and (for prompt hooks) an LLM adapter.
pub struct ToolInvoker {
    pub registry: Arc<ToolRegistry>,
    pub hooks: Arc<HookRunner>,
    pub permission: Arc<dyn PermissionChecker>,
    pub llm: Arc<dyn LlmAdapter>,
}

/// Fixed metadata threaded into every hook payload for one turn.
#[derive(Clone)]
pub struct HookMeta {
    pub session_id: String,
    pub transcript_path: String,
    pub cwd: String,
}

impl ToolInvoker {
    /// Drive one tool-use block through the full invocation lifecycle,
    /// producing a stream of [`InvocationEvent`]. `skip_permission` is the
    /// turn-level baseline (e.g. `BypassPermissions`); read-only tools and
    /// hook-forced `permissionDecision`s can further override it.
    pub fn invoke(
        self: Arc<Self>,
        block: ToolUseBlock,
        ctx: ToolUseContext,
        hook_meta: HookMeta,
        skip_permission: bool,
        sibling_tool_use_ids: Vec<String>,
    ) -> Pin<Box<dyn Stream<Item = InvocationEvent> + Send>> {
        Box::pin(async_stream::stream! {
            let Some(tool) = self.registry.get(&block.name) else {
                yield error_result(&block, format!("no such tool: {}", block.name));
                return;
            };

            // 1. Input preprocessing (no-op at this layer; normalization
            //    proper happens after hooks, step 6).
            let mut input = block.input.clone();

            // 2. JSON Schema validation.
            if let Err(message) = validate_schema(&tool.input_schema(), &input, &block.name) {
                yield error_result(&block, message);
                return;
            }

            // 3. Tool-specific semantic validation.
            if let Err(e) = tool.validate_input(&input, &ctx).await {
                yield error_result(&block, e.to_string());
                return;
            }

            // 4. PreToolUse hooks.
            let payload = HookPayload {
                session_id: hook_meta.session_id.clone(),
                transcript_path: hook_meta.transcript_path.clone(),
                cwd: hook_meta.cwd.clone(),
                hook_event_name: "PreToolUse",
                permission_mode: format!("{:?}", ctx.options.permission_mode),
                tool_name: Some(block.name.clone()),
                tool_input: Some(input.clone()),
                tool_result: None,
                tool_use_id: Some(block.id.clone()),
                user_prompt: None,
                reason: None,
            };
            let pre = self
                .hooks
                .run(HookEvent::PreToolUse, Some(&block.name), &payload, Some(self.llm.as_ref()), Some(&ctx))
                .await;

            if pre.blocked {
                yield error_result(&block, pre.block_message.unwrap_or_else(|| "blocked by PreToolUse hook".into()));
                return;
            }
            let mut followups = Vec::new();
            if let Some(system_message) = &pre.system_message {
                followups.push(TurnMessage::interrupt_text(system_message.clone()));
            }
            if let Some(updated) = pre.updated_input {
                input = updated;
                if let Err(message) = validate_schema(&tool.input_schema(), &input, &block.name) {
                    yield error_result(&block, message);
                    return;
                }
                if let Err(e) = tool.validate_input(&input, &ctx).await {
                    yield error_result(&block, e.to_string());
                    return;
                }
            }

            // 5. Permission check, unless skipped.
            let mut effective_skip = skip_permission || tool.is_read_only();
            match pre.permission_decision.as_deref() {
                Some("allow") => effective_skip = true,
                Some("deny") => {
                    yield error_result(&block, pre.block_message.unwrap_or_else(|| "denied by PreToolUse hook".into()));
                    return;
                }
                Some("ask") => effective_skip = false,
                _ => {}
            }
            if matches!(ctx.options.permission_mode, PermissionMode::BypassPermissions) {
                effective_skip = true;
            }

            if !effective_skip {
                match self.permission.check(&block.name, &input, &block.id, &ctx).await {
                    PermissionOutcome::Allow => {}
                    PermissionOutcome::Deny { message } => {
                        yield error_result(&block, message);
                        return;
                    }
                }
            }

            // 6. Input normalization, now that hooks/permissions have had
            //    their say.
            let input = tool.normalize_input(input, &ctx);

            // 7. Call the tool and drive its stream.
            let mut stream = tool.call(input.clone(), ctx.clone());
            let mut produced_result = false;
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ToolEvent::Progress { text, .. }) => {
                        yield InvocationEvent::Progress(TurnMessage::progress(
                            block.id.clone(),
                            sibling_tool_use_ids.clone(),
                            text,
                        ));
                    }
                    Ok(ToolEvent::Result { data: _, render_for_assistant, is_error, context_modifier, followups: tool_followups }) => {
                        produced_result = true;
                        let post_payload = HookPayload {
                            tool_result: Some(Value::String(render_for_assistant.clone())),
                            hook_event_name: "PostToolUse",
                            ..payload.clone()
                        };
                        let post = self
                            .hooks
                            .run(HookEvent::PostToolUse, Some(&block.name), &post_payload, Some(self.llm.as_ref()), Some(&ctx))
                            .await;

                        let mut all_followups = followups.clone();
                        all_followups.extend(tool_followups);
                        if let Some(system_message) = &post.system_message {
                            all_followups.push(TurnMessage::interrupt_text(system_message.clone()));
                        }
                        let rendered = match &post.additional_context {
                            Some(extra) => format!("{render_for_assistant}\n\n{extra}"),
                            None => render_for_assistant,
                        };
                        let final_is_error = is_error || post.blocked;
                        let rendered = if post.blocked {
                            post.block_message.clone().unwrap_or(rendered)
                        } else {
                            rendered
                        };

                        yield InvocationEvent::Result {
                            message: TurnMessage::tool_result(block.id.clone(), rendered, final_is_error),
                            is_error: final_is_error,
                            context_modifier,
                            followups: all_followups,
                        };
                    }
                    Err(e) => {
                        produced_result = true;
                        yield InvocationEvent::Result {
                            message: TurnMessage::tool_result(block.id.clone(), format_error(&e.to_string()), true),
                            is_error: true,
                            context_modifier: None,
                            followups: std::mem::take(&mut followups),
                        };
                    }
                }
            }

            if !produced_result {
                yield InvocationEvent::Result {
                    message: TurnMessage::tool_result(block.id.clone(), format_error("tool produced no result"), true),
                    is_error: true,
                    context_modifier: None,
                    followups,
                };
            }
        })
    }
}

fn error_result(block: &ToolUseBlock, message: impl Into<String>) -> InvocationEvent {
    InvocationEvent::Result {
        message: TurnMessage::tool_result(block.id.clone(), format_error(&message.into()), true),
        is_error: true,
        context_modifier: None,
        followups: Vec::new(),
    }
}

/// Truncate an overlong error, preserving head and tail (§4.3, §7).
fn format_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_CHARS {
        return message.to_string();
    }
    let half = (MAX_ERROR_CHARS - 5) / 2;
    let chars: Vec<char> = message.chars().collect();
    let head: String = chars[..half].iter().collect();
    let tail: String = chars[chars.len() - half..].iter().collect();
    format!("{head}\n...\n{tail}")
}

fn validate_schema(schema: &Value, input: &Value, tool_name: &str) -> Result<(), String> {
    let compiled = JSONSchema::compile(schema).map_err(|e| format!("invalid schema for {tool_name}: {e}"))?;
    if let Err(errors) = compiled.validate(input) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        let hint = if input.as_object().map(|o| o.is_empty()).unwrap_or(false) && tool_name == "Read" {
            " (Read requires at least a 'path' argument)"
        } else {
            ""
        };
        return Err(format!("invalid input for {tool_name}: {}{hint}", messages.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use ac_domain::capability::{ToolCapability, ToolEvent, ToolEventStream};
    use ac_domain::config::hooks::{HookDefinition, HookEvent as ConfigHookEvent, HookMatcherRule, HooksConfig};
    use ac_domain::context::{PermissionMode, ToolUseContext, TurnOptions};
    use ac_domain::llm::{AssistantTurn, LlmAdapter, PermissionChecker, PermissionOutcome};
    use ac_domain::Result as AcResult;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;

    use super::super::registry::ToolRegistry;

    /// Requires a `value` string so a hook that strips it fails re-validation.
    struct RequiresValueTool;

    #[async_trait]
    impl ToolCapability for RequiresValueTool {
        fn name(&self) -> &'static str {
            "Echo"
        }
        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": { "value": { "type": "string" } },
                "required": ["value"],
            })
        }
        async fn validate_input(&self, _input: &Value, _ctx: &ToolUseContext) -> AcResult<()> {
            Ok(())
        }
        fn call(&self, _input: Value, _ctx: ToolUseContext) -> ToolEventStream {
            Box::pin(async_stream::stream! {
                yield Ok(ToolEvent::ok(json!("done"), "done"));
            })
        }
    }

    struct AllowAll;
    #[async_trait]
    impl PermissionChecker for AllowAll {
        async fn check(&self, _tool: &str, _input: &Value, _id: &str, _ctx: &ToolUseContext) -> PermissionOutcome {
            PermissionOutcome::Allow
        }
    }

    struct NoopLlm;
    #[async_trait]
    impl LlmAdapter for NoopLlm {
        async fn query(
            &self,
            _history: &[ac_domain::tool::Message],
            _system_prompt: &[String],
            _max_thinking_tokens: Option<u32>,
            _tool_names: &[String],
            _ctx: &ToolUseContext,
        ) -> AcResult<AssistantTurn> {
            unimplemented!()
        }
        async fn query_quick(&self, _system: &str, _user: &str, _ctx: &ToolUseContext) -> AcResult<String> {
            Ok(String::new())
        }
    }

    fn ctx() -> ToolUseContext {
        ToolUseContext {
            options: TurnOptions { permission_mode: PermissionMode::BypassPermissions, ..TurnOptions::default() },
            ..ToolUseContext::new("main", "m1")
        }
    }

    /// A PreToolUse hook that always strips the `value` field via
    /// `updatedInput`, to exercise the step-4 re-validation path.
    fn hooks_stripping_value() -> HookRunner {
        let mut rules = HashMap::new();
        rules.insert(
            ConfigHookEvent::PreToolUse,
            vec![HookMatcherRule {
                matcher: "*".into(),
                hooks: vec![HookDefinition::Command {
                    command: r#"echo '{"hookSpecificOutput": {"updatedInput": {}}}'"#.into(),
                    timeout_sec: None,
                }],
            }],
        );
        HookRunner::new(HooksConfig { rules }, "/tmp".into())
    }

    #[tokio::test]
    async fn pre_tool_use_hooks_updated_input_is_re_validated_and_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RequiresValueTool));
        let invoker = Arc::new(ToolInvoker {
            registry: Arc::new(registry),
            hooks: Arc::new(hooks_stripping_value()),
            permission: Arc::new(AllowAll),
            llm: Arc::new(NoopLlm),
        });
        let block = ToolUseBlock { id: "tu1".into(), name: "Echo".into(), input: json!({ "value": "x" }) };
        let hook_meta = HookMeta { session_id: "s".into(), transcript_path: "/tmp/t".into(), cwd: "/tmp".into() };

        let mut stream = invoker.invoke(block, ctx(), hook_meta, true, Vec::new());
        let event = stream.next().await.expect("invoker should yield a result");
        match event {
            InvocationEvent::Result { message, is_error, .. } => {
                assert!(is_error, "updatedInput missing the required field must be rejected, not executed");
                let TurnMessage::User { content, .. } = message else {
                    panic!("expected a tool_result user message");
                };
                let rendered = format!("{content:?}");
                assert!(rendered.contains("invalid input for Echo"), "got: {rendered}");
            }
            InvocationEvent::Progress(_) => panic!("expected the rejected result, not a progress event"),
        }
        assert!(stream.next().await.is_none(), "invoker must stop after the re-validation failure");
    }

    #[test]
    fn format_error_passes_short_messages_through() {
        assert_eq!(format_error("boom"), "boom");
    }

    #[test]
    fn format_error_truncates_long_messages_preserving_head_and_tail() {
        let long = "a".repeat(20_000);
        let formatted = format_error(&long);
        assert!(formatted.len() < long.len());
        assert!(formatted.starts_with('a'));
        assert!(formatted.ends_with('a'));
        assert!(formatted.contains("..."));
    }

    #[test]
    fn validate_schema_rejects_missing_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        });
        let err = validate_schema(&schema, &serde_json::json!({}), "Read").unwrap_err();
        assert!(err.contains("Read requires at least a 'path' argument"));
    }

    #[test]
    fn validate_schema_accepts_matching_input() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"],
        });
        assert!(validate_schema(&schema, &serde_json::json!({"path": "a.txt"}), "Read").is_ok());
    }
}
