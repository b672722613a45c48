use serde::{Deserialize, Serialize};

/// Wire format the [`crate::llm::LlmAdapter`] boundary speaks — the shape a
/// provider adapter normalizes its own request/response format to and from.
/// Provider-specific transports are out of scope here; this is the seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A message in the conversation (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /// Shared by consecutive assistant messages that belong to one logical
    /// turn (text blocks plus tool-use blocks emitted across more than one
    /// provider chunk). `normalize_messages_for_api` merges on this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Set on an assistant message synthesized to represent a provider-side
    /// API failure. Stripped by `normalize_messages_for_api` once a
    /// non-error reply for the same turn exists.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_api_error: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image {
        url: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
            id: None,
            is_api_error: false,
        }
    }
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
            id: None,
            is_api_error: false,
        }
    }
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
            id: None,
            is_api_error: false,
        }
    }
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: MessageContent::Parts(vec![ContentPart::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error: false,
            }]),
            id: None,
            is_api_error: false,
        }
    }
}

/// `normalize-messages-for-api` (§4.1): merge consecutive user messages
/// (tool-result blocks ordered before text blocks), drop synthetic API-error
/// assistant messages, and merge consecutive assistant messages that share
/// an `id`. Idempotent: re-running on the output is a no-op.
pub fn normalize_messages_for_api(history: &[Message]) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(history.len());

    for msg in history {
        if msg.role == Role::Assistant && msg.is_api_error {
            continue;
        }

        match out.last_mut() {
            Some(prev) if prev.role == Role::User && msg.role == Role::User => {
                merge_user_content(prev, msg);
            }
            Some(prev)
                if prev.role == Role::Assistant
                    && msg.role == Role::Assistant
                    && prev.id.is_some()
                    && prev.id == msg.id =>
            {
                merge_parts(prev, msg);
            }
            _ => out.push(msg.clone()),
        }
    }

    out
}

fn merge_user_content(prev: &mut Message, next: &Message) {
    let mut tool_results = Vec::new();
    let mut texts = Vec::new();
    for part in as_parts(&prev.content).into_iter().chain(as_parts(&next.content)) {
        match part {
            ContentPart::ToolResult { .. } => tool_results.push(part),
            other => texts.push(other),
        }
    }
    tool_results.extend(texts);
    prev.content = MessageContent::Parts(tool_results);
}

fn merge_parts(prev: &mut Message, next: &Message) {
    let merged = as_parts(&prev.content)
        .into_iter()
        .chain(as_parts(&next.content))
        .collect();
    prev.content = MessageContent::Parts(merged);
}

fn as_parts(content: &MessageContent) -> Vec<ContentPart> {
    match content {
        MessageContent::Text(t) if t.is_empty() => Vec::new(),
        MessageContent::Text(t) => vec![ContentPart::Text { text: t.clone() }],
        MessageContent::Parts(parts) => parts.clone(),
    }
}

impl MessageContent {
    /// Extract the plain-text content (first text part, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(t) => Some(t.as_str()),
            MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Extract and join all text content, returning an owned String.
    ///
    /// For `Text` variant, returns the string directly.
    /// For `Parts` variant, joins all `Text` parts with `"\n"`.
    /// Non-text parts (ToolUse, ToolResult, Image) are skipped.
    pub fn extract_all_text(&self) -> String {
        match self {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_all_text_from_text_variant() {
        let content = MessageContent::Text("hello world".into());
        assert_eq!(content.extract_all_text(), "hello world");
    }

    #[test]
    fn extract_all_text_from_parts_joins_with_newline() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text { text: "line one".into() },
            ContentPart::ToolUse {
                id: "c1".into(),
                name: "exec".into(),
                input: serde_json::json!({}),
            },
            ContentPart::Text { text: "line two".into() },
        ]);
        assert_eq!(content.extract_all_text(), "line one\nline two");
    }

    #[test]
    fn extract_all_text_empty_parts() {
        let content = MessageContent::Parts(vec![]);
        assert_eq!(content.extract_all_text(), "");
    }

    // ── normalize_messages_for_api ──────────────────────────────────

    #[test]
    fn normalize_merges_consecutive_user_messages_tool_results_first() {
        let history = vec![
            Message::user("please do the thing"),
            Message::tool_result("t1", "done"),
        ];
        let out = normalize_messages_for_api(&history);
        assert_eq!(out.len(), 1);
        match &out[0].content {
            MessageContent::Parts(parts) => {
                assert!(matches!(parts[0], ContentPart::ToolResult { .. }));
                assert!(matches!(parts[1], ContentPart::Text { .. }));
            }
            _ => panic!("expected merged parts"),
        }
    }

    #[test]
    fn normalize_drops_api_error_assistant_messages() {
        let mut err_msg = Message::assistant("rate limited, retrying");
        err_msg.is_api_error = true;
        let history = vec![err_msg, Message::assistant("here is the answer")];
        let out = normalize_messages_for_api(&history);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content.text(), Some("here is the answer"));
    }

    #[test]
    fn normalize_merges_assistant_messages_sharing_id() {
        let mut first = Message::assistant("partial ");
        first.id = Some("m1".into());
        let mut second = Message::assistant("rest");
        second.id = Some("m1".into());
        let out = normalize_messages_for_api(&[first, second]);
        assert_eq!(out.len(), 1);
        match &out[0].content {
            MessageContent::Parts(parts) => assert_eq!(parts.len(), 2),
            _ => panic!("expected merged parts"),
        }
    }

    #[test]
    fn normalize_is_idempotent() {
        let history = vec![Message::user("a"), Message::tool_result("t1", "b")];
        let once = normalize_messages_for_api(&history);
        let twice = normalize_messages_for_api(&once);
        assert_eq!(
            serde_json::to_string(&once).unwrap(),
            serde_json::to_string(&twice).unwrap()
        );
    }

    #[test]
    fn normalize_leaves_unrelated_messages_untouched() {
        let history = vec![Message::system("sys"), Message::user("hi")];
        let out = normalize_messages_for_api(&history);
        assert_eq!(out.len(), 2);
    }
}
