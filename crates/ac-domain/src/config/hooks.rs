use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hook settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One of the lifecycle points the Hook Runner dispatches at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum HookEvent {
    PreToolUse,
    PostToolUse,
    Stop,
    SubagentStop,
    UserPromptSubmit,
    SessionStart,
    SessionEnd,
}

impl HookEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::Stop => "Stop",
            HookEvent::SubagentStop => "SubagentStop",
            HookEvent::UserPromptSubmit => "UserPromptSubmit",
            HookEvent::SessionStart => "SessionStart",
            HookEvent::SessionEnd => "SessionEnd",
        }
    }
}

/// A single `{matcher, hooks[]}` rule loaded from merged settings or a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookMatcherRule {
    /// `"*"`, `"all"`, an exact tool name, a glob, or (as a fallback) a regex.
    pub matcher: String,
    pub hooks: Vec<HookDefinition>,
}

/// One configured hook: either a subprocess command or an LLM prompt template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookDefinition {
    Command {
        command: String,
        #[serde(default)]
        timeout_sec: Option<u64>,
    },
    Prompt {
        template: String,
        #[serde(default)]
        timeout_sec: Option<u64>,
    },
}

impl HookDefinition {
    pub fn timeout_sec(&self) -> u64 {
        match self {
            HookDefinition::Command { timeout_sec, .. } => timeout_sec.unwrap_or(60),
            HookDefinition::Prompt { timeout_sec, .. } => timeout_sec.unwrap_or(30),
        }
    }
}

/// Merged hook configuration: one rule list per event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default)]
    pub rules: HashMap<HookEvent, Vec<HookMatcherRule>>,
}

impl HooksConfig {
    pub fn rules_for(&self, event: HookEvent) -> &[HookMatcherRule] {
        self.rules.get(&event).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeout_command_is_60() {
        let h = HookDefinition::Command {
            command: "echo hi".into(),
            timeout_sec: None,
        };
        assert_eq!(h.timeout_sec(), 60);
    }

    #[test]
    fn default_timeout_prompt_is_30() {
        let h = HookDefinition::Prompt {
            template: "check $TOOL_INPUT".into(),
            timeout_sec: None,
        };
        assert_eq!(h.timeout_sec(), 30);
    }

    #[test]
    fn rules_for_missing_event_is_empty() {
        let cfg = HooksConfig::default();
        assert!(cfg.rules_for(HookEvent::PreToolUse).is_empty());
    }
}
