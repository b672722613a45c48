use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ContentPart;

/// The message variants a running turn can yield to its caller. Every
/// message carries an immutable unique id. Only `User` and `Assistant`
/// variants are ever folded back into the next LLM call; `Progress` is
/// transient, UI-only, and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TurnMessage {
    User {
        id: String,
        content: Vec<ContentPart>,
    },
    Assistant {
        id: String,
        content: Vec<ContentPart>,
    },
    /// References the tool-use id this progress event belongs to, plus
    /// every sibling tool-use id enqueued in the same assistant turn, so a
    /// UI can render one combined "working…" view for the whole batch.
    Progress {
        id: String,
        tool_use_id: String,
        sibling_tool_use_ids: Vec<String>,
        /// A short, transient assistant-shaped message for display only.
        display: Box<TurnMessage>,
    },
}

impl TurnMessage {
    pub fn id(&self) -> &str {
        match self {
            TurnMessage::User { id, .. } => id,
            TurnMessage::Assistant { id, .. } => id,
            TurnMessage::Progress { id, .. } => id,
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, TurnMessage::Progress { .. })
    }

    pub fn new_user(content: Vec<ContentPart>) -> Self {
        TurnMessage::User {
            id: Uuid::new_v4().to_string(),
            content,
        }
    }

    pub fn new_assistant(content: Vec<ContentPart>) -> Self {
        TurnMessage::Assistant {
            id: Uuid::new_v4().to_string(),
            content,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        TurnMessage::new_user(vec![ContentPart::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }])
    }

    pub fn interrupt_text(text: impl Into<String>) -> Self {
        TurnMessage::new_assistant(vec![ContentPart::Text { text: text.into() }])
    }

    pub fn progress(
        tool_use_id: impl Into<String>,
        sibling_tool_use_ids: Vec<String>,
        display_text: impl Into<String>,
    ) -> Self {
        TurnMessage::Progress {
            id: Uuid::new_v4().to_string(),
            tool_use_id: tool_use_id.into(),
            sibling_tool_use_ids,
            display: Box::new(TurnMessage::new_assistant(vec![ContentPart::Text {
                text: display_text.into(),
            }])),
        }
    }
}

/// The fixed interrupt strings the Turn Loop and Tool-Use Queue produce on
/// cancellation or sibling failure.
pub mod interrupt_messages {
    pub const INTERRUPT_MESSAGE: &str = "[Request interrupted by user]";
    pub const INTERRUPT_MESSAGE_FOR_TOOL_USE: &str =
        "[Request interrupted by user while a tool was running]";
    pub const REJECT_MESSAGE: &str = "The user doesn't want to proceed with this tool use.";
    /// Synthesized for a queued entry that never got to run because an
    /// earlier sibling in the same assistant turn already errored.
    pub const SIBLING_ERROR_MESSAGE: &str =
        "This tool call is blocked because a sibling tool call has failed.";
    /// Emitted once for an entry queued behind a non-concurrency-safe
    /// sibling's exclusive execution window (§4.2).
    pub const WAITING_MESSAGE: &str = "Waiting…";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_never_persisted() {
        let msg = TurnMessage::progress("t1", vec!["t1".into(), "t2".into()], "Waiting…");
        assert!(msg.is_progress());
    }

    #[test]
    fn tool_result_wraps_error_flag() {
        let msg = TurnMessage::tool_result("t1", "denied", true);
        match msg {
            TurnMessage::User { content, .. } => match &content[0] {
                ContentPart::ToolResult { is_error, .. } => assert!(*is_error),
                _ => panic!("expected tool result"),
            },
            _ => panic!("expected user message"),
        }
    }

    #[test]
    fn ids_are_unique() {
        let a = TurnMessage::new_assistant(vec![]);
        let b = TurnMessage::new_assistant(vec![]);
        assert_ne!(a.id(), b.id());
    }
}
