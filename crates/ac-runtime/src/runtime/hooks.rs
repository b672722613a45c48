//! Hook Runner (§4.6): resolves matcher rules for a lifecycle event, spawns
//! command hooks as subprocesses (or runs prompt hooks through a quick LLM
//! pass), decodes their exit code / stdout into a structured outcome, and
//! aggregates the outcomes of every hook that matched.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use ac_domain::config::hooks::{HookDefinition, HookEvent, HooksConfig};
use ac_domain::context::ToolUseContext;
use ac_domain::llm::LlmAdapter;
use ac_domain::trace::TraceEvent;

/// One hook's view of "what's happening" — the stdin JSON payload shape
/// and template-substitution source for prompt hooks.
#[derive(Debug, Clone, Serialize)]
pub struct HookPayload {
    pub session_id: String,
    pub transcript_path: String,
    pub cwd: String,
    pub hook_event_name: &'static str,
    pub permission_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Structured decode of a hook's (exit code, stdout, stderr). A hook that
/// produced no JSON and exited zero decodes to `HookOutcome::default()`.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub blocked: bool,
    pub block_message: Option<String>,
    pub warning: Option<String>,
    pub system_message: Option<String>,
    pub permission_decision: Option<String>,
    pub updated_input: Option<Value>,
    pub additional_context: Option<String>,
}

impl HookOutcome {
    fn merge(mut self, other: HookOutcome) -> Self {
        if other.blocked {
            self.blocked = true;
            self.block_message = other.block_message.or(self.block_message);
        }
        if other.warning.is_some() {
            self.warning = other.warning;
        }
        if let Some(sm) = other.system_message {
            self.system_message = Some(match self.system_message {
                Some(prev) => format!("{prev}\n{sm}"),
                None => sm,
            });
        }
        if other.permission_decision.is_some() {
            self.permission_decision = other.permission_decision;
        }
        if other.updated_input.is_some() {
            self.updated_input = other.updated_input;
        }
        if let Some(ctx) = other.additional_context {
            self.additional_context = Some(match self.additional_context {
                Some(prev) => format!("{prev}\n{ctx}"),
                None => ctx,
            });
        }
        self
    }
}

pub struct HookRunner {
    config: HooksConfig,
    project_dir: PathBuf,
    plugin_root: Option<String>,
    env_file: Option<PathBuf>,
}

impl HookRunner {
    pub fn new(config: HooksConfig, project_dir: PathBuf) -> Self {
        Self { config, project_dir, plugin_root: None, env_file: None }
    }

    pub fn with_plugin_root(mut self, root: impl Into<String>) -> Self {
        self.plugin_root = Some(root.into());
        self
    }

    pub fn with_env_file(mut self, path: PathBuf) -> Self {
        self.env_file = Some(path);
        self
    }

    /// Run every matching rule's hooks for `event`, in parallel, and
    /// aggregate their outcomes. `subject` is the tool name for tool-scoped
    /// events, or `None` for session/turn-scoped events (matched against `*`).
    pub async fn run(
        &self,
        event: HookEvent,
        subject: Option<&str>,
        payload: &HookPayload,
        llm: Option<&dyn LlmAdapter>,
        llm_ctx: Option<&ToolUseContext>,
    ) -> HookOutcome {
        let rules = self.config.rules_for(event);
        if rules.is_empty() {
            return HookOutcome::default();
        }
        let subject = subject.unwrap_or("*");

        let mut futures = FuturesUnordered::new();
        for rule in rules {
            if !matcher_matches(&rule.matcher, subject) {
                continue;
            }
            for hook in &rule.hooks {
                futures.push(self.run_one(event, rule.matcher.clone(), hook, payload, llm, llm_ctx));
            }
        }

        let mut aggregate = HookOutcome::default();
        while let Some(outcome) = futures.next().await {
            aggregate = aggregate.merge(outcome);
        }
        aggregate
    }

    async fn run_one(
        &self,
        event: HookEvent,
        matcher: String,
        hook: &HookDefinition,
        payload: &HookPayload,
        llm: Option<&dyn LlmAdapter>,
        llm_ctx: Option<&ToolUseContext>,
    ) -> HookOutcome {
        let started = std::time::Instant::now();
        let timeout = Duration::from_secs(hook.timeout_sec());
        let kind = match hook {
            HookDefinition::Command { .. } => "command",
            HookDefinition::Prompt { .. } => "prompt",
        };

        let result = match hook {
            HookDefinition::Command { command, .. } => {
                tokio::time::timeout(timeout, self.run_command(command, payload)).await
            }
            HookDefinition::Prompt { template, .. } => {
                tokio::time::timeout(timeout, self.run_prompt(template, payload, llm, llm_ctx)).await
            }
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(_) => HookOutcome {
                warning: Some(format!("hook for {} timed out after {}s", event.as_str(), hook.timeout_sec())),
                ..Default::default()
            },
        };

        TraceEvent::HookInvoked {
            event: event.as_str().to_string(),
            matcher,
            kind,
            duration_ms: started.elapsed().as_millis() as u64,
            outcome: if outcome.blocked { "blocked".into() } else { "ok".into() },
        }
        .emit();

        outcome
    }

    async fn run_command(&self, command: &str, payload: &HookPayload) -> HookOutcome {
        let stdin_json = serde_json::to_vec(payload).unwrap_or_default();

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.project_dir)
            .env("CLAUDE_PROJECT_DIR", &self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(root) = &self.plugin_root {
            cmd.env("CLAUDE_PLUGIN_ROOT", root);
        }
        if let Some(env_file) = &self.env_file {
            cmd.env("CLAUDE_ENV_FILE", env_file);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return HookOutcome {
                    warning: Some(format!("failed to spawn hook command: {e}")),
                    ..Default::default()
                }
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&stdin_json).await;
        }

        let output = match child.wait_with_output().await {
            Ok(output) => output,
            Err(e) => {
                return HookOutcome {
                    warning: Some(format!("hook command wait failed: {e}")),
                    ..Default::default()
                }
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        decode(output.status.code(), &stdout, &stderr)
    }

    async fn run_prompt(
        &self,
        template: &str,
        payload: &HookPayload,
        llm: Option<&dyn LlmAdapter>,
        llm_ctx: Option<&ToolUseContext>,
    ) -> HookOutcome {
        let Some(llm) = llm else {
            return HookOutcome {
                warning: Some("prompt hook configured but no LLM adapter is available".into()),
                ..Default::default()
            };
        };
        let Some(ctx) = llm_ctx else {
            return HookOutcome::default();
        };

        let user_prompt = substitute_template(template, payload);
        let system = "You are a hook evaluating one agent action. Reply with a single JSON \
            object: {\"decision\": \"approve\"|\"block\", \"reason\": string (optional), \
            \"systemMessage\": string (optional)}. Reply with nothing else.";

        match llm.query_quick(system, &user_prompt, ctx).await {
            Ok(text) => decode(Some(0), &text, ""),
            Err(e) => HookOutcome {
                warning: Some(format!("prompt hook call failed: {e}")),
                ..Default::default()
            },
        }
    }
}

/// `"$TOOL_INPUT"`, `"$TOOL_RESULT"`, `"$USER_PROMPT"` substitution.
fn substitute_template(template: &str, payload: &HookPayload) -> String {
    let tool_input = payload.tool_input.as_ref().map(|v| v.to_string()).unwrap_or_default();
    let tool_result = payload.tool_result.as_ref().map(|v| v.to_string()).unwrap_or_default();
    let user_prompt = payload.user_prompt.clone().unwrap_or_default();
    template
        .replace("$TOOL_INPUT", &tool_input)
        .replace("$TOOL_RESULT", &tool_result)
        .replace("$USER_PROMPT", &user_prompt)
}

/// Exit-code / JSON decoding (§4.6): `2` blocks, any other nonzero exit is a
/// non-blocking warning, `0` with a leading JSON object on stdout decodes
/// the structured fields, `0` with no JSON is a silent success.
fn decode(exit_code: Option<i32>, stdout: &str, stderr: &str) -> HookOutcome {
    match exit_code {
        Some(2) => {
            let message = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else if !stdout.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                "blocked by hook".to_string()
            };
            return HookOutcome { blocked: true, block_message: Some(message), ..Default::default() };
        }
        Some(0) | None => {}
        Some(_) => {
            let message = if !stderr.trim().is_empty() {
                stderr.trim().to_string()
            } else {
                stdout.trim().to_string()
            };
            return HookOutcome { warning: if message.is_empty() { None } else { Some(message) }, ..Default::default() };
        }
    }

    let Some(json_str) = first_balanced_json_object(stdout) else {
        return HookOutcome::default();
    };
    let Ok(value) = serde_json::from_str::<Value>(&json_str) else {
        return HookOutcome::default();
    };

    let mut outcome = HookOutcome::default();
    if let Some(system_message) = value.get("systemMessage").and_then(Value::as_str) {
        outcome.system_message = Some(system_message.to_string());
    }
    if let Some(decision) = value.get("decision").and_then(Value::as_str) {
        if decision == "block" {
            outcome.blocked = true;
            outcome.block_message = value
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or_else(|| outcome.system_message.clone());
        }
    }
    if let Some(specific) = value.get("hookSpecificOutput") {
        if let Some(decision) = specific.get("permissionDecision").and_then(Value::as_str) {
            outcome.permission_decision = Some(decision.to_string());
        }
        if let Some(updated) = specific.get("updatedInput") {
            outcome.updated_input = Some(updated.clone());
        }
        if let Some(ctx) = specific.get("additionalContext").and_then(Value::as_str) {
            outcome.additional_context = Some(ctx.to_string());
        }
    }
    outcome
}

/// Scans for the first top-level `{...}` object in `text`, honoring quoted
/// strings and escapes, and returns its substring if the braces balance.
fn first_balanced_json_object(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Tool-name (or `"*"` for non-tool events) matcher resolution: exact
/// match, `"*"`/`"all"` wildcard, glob, or (as a fallback) regex.
fn matcher_matches(matcher: &str, subject: &str) -> bool {
    if matcher == "*" || matcher.eq_ignore_ascii_case("all") {
        return true;
    }
    if matcher == subject {
        return true;
    }
    if let Ok(pattern) = glob::Pattern::new(matcher) {
        if pattern.matches(subject) {
            return true;
        }
    }
    regex::Regex::new(matcher).map(|re| re.is_match(subject)).unwrap_or(false)
}

/// Parses a dotenv-style `KEY=VALUE` file, one assignment per line, for the
/// `SessionEnd` env-file import side channel (§4.6, §6). Blank lines and
/// lines starting with `#` are ignored; values are not shell-unquoted.
pub fn parse_env_file(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matcher_wildcard_matches_anything() {
        assert!(matcher_matches("*", "Bash"));
        assert!(matcher_matches("all", "Write"));
    }

    #[test]
    fn matcher_exact_match() {
        assert!(matcher_matches("Bash", "Bash"));
        assert!(!matcher_matches("Bash", "Write"));
    }

    #[test]
    fn matcher_glob_match() {
        assert!(matcher_matches("mcp__*", "mcp__server__tool"));
    }

    #[test]
    fn matcher_regex_fallback() {
        assert!(matcher_matches("^(Read|Write)$", "Write"));
        assert!(!matcher_matches("^(Read|Write)$", "Bash"));
    }

    #[test]
    fn decode_exit_2_blocks_with_stderr_message() {
        let outcome = decode(Some(2), "", "not allowed");
        assert!(outcome.blocked);
        assert_eq!(outcome.block_message.as_deref(), Some("not allowed"));
    }

    #[test]
    fn decode_nonzero_is_warning_not_block() {
        let outcome = decode(Some(1), "bad arg", "");
        assert!(!outcome.blocked);
        assert_eq!(outcome.warning.as_deref(), Some("bad arg"));
    }

    #[test]
    fn decode_zero_with_no_json_is_silent_success() {
        let outcome = decode(Some(0), "all good, nothing structured", "");
        assert!(!outcome.blocked);
        assert!(outcome.warning.is_none());
        assert!(outcome.system_message.is_none());
    }

    #[test]
    fn decode_zero_with_json_extracts_fields() {
        let stdout = r#"noise before {"systemMessage": "heads up", "hookSpecificOutput": {"permissionDecision": "allow", "additionalContext": "extra"}} trailing"#;
        let outcome = decode(Some(0), stdout, "");
        assert_eq!(outcome.system_message.as_deref(), Some("heads up"));
        assert_eq!(outcome.permission_decision.as_deref(), Some("allow"));
        assert_eq!(outcome.additional_context.as_deref(), Some("extra"));
    }

    #[test]
    fn decode_zero_with_block_decision() {
        let stdout = r#"{"decision": "block", "reason": "no thanks"}"#;
        let outcome = decode(Some(0), stdout, "");
        assert!(outcome.blocked);
        assert_eq!(outcome.block_message.as_deref(), Some("no thanks"));
    }

    #[test]
    fn first_balanced_json_object_handles_nested_braces_and_strings() {
        let text = r#"prefix {"a": {"b": "c}d"}, "e": 1} suffix"#;
        let extracted = first_balanced_json_object(text).unwrap();
        let value: Value = serde_json::from_str(&extracted).unwrap();
        assert_eq!(value["e"], 1);
    }

    #[test]
    fn parse_env_file_skips_comments_and_blanks() {
        let contents = "# comment\nFOO=bar\n\nBAZ=qux\n";
        let vars = parse_env_file(contents);
        assert_eq!(vars.get("FOO"), Some(&"bar".to_string()));
        assert_eq!(vars.get("BAZ"), Some(&"qux".to_string()));
        assert_eq!(vars.len(), 2);
    }

    #[tokio::test]
    async fn run_command_hook_echoes_and_decodes() {
        let runner = HookRunner::new(HooksConfig::default(), std::env::temp_dir());
        let payload = HookPayload {
            session_id: "s1".into(),
            transcript_path: "/tmp/t.jsonl".into(),
            cwd: "/tmp".into(),
            hook_event_name: "PreToolUse",
            permission_mode: "default".into(),
            tool_name: Some("Bash".into()),
            tool_input: Some(serde_json::json!({"command": "ls"})),
            tool_result: None,
            tool_use_id: Some("tu1".into()),
            user_prompt: None,
            reason: None,
        };
        let outcome = runner.run_command(r#"echo '{"systemMessage": "seen"}'"#, &payload).await;
        assert_eq!(outcome.system_message.as_deref(), Some("seen"));
    }
}
