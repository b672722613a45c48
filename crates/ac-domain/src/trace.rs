use serde::Serialize;

/// Structured trace events emitted across the runtime, tools and domain
/// crates. Each is logged as a single `tracing::info!` call carrying the
/// serialized event as a field, so a JSON log pipeline can index on `event`
/// without parsing free-text messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    TurnStarted {
        session_key: String,
        history_len: usize,
    },
    TurnCompacted {
        session_key: String,
        turns_compacted: usize,
        summary_len: usize,
    },
    TurnFinished {
        session_key: String,
        tool_loops: usize,
        cancelled: bool,
    },
    ToolEnqueued {
        tool_use_id: String,
        tool_name: String,
        concurrency_safe: bool,
    },
    ToolDispatched {
        tool_use_id: String,
        tool_name: String,
        duration_ms: u64,
        is_error: bool,
    },
    HookInvoked {
        event: String,
        matcher: String,
        kind: &'static str,
        duration_ms: u64,
        outcome: String,
    },
    SandboxProfileBuilt {
        platform: String,
        network_restricted: bool,
    },
    SandboxDenied {
        command: String,
    },
    ProxyDecision {
        host: String,
        allowed: bool,
        source: &'static str,
    },
    BackgroundTaskPromoted {
        task_id: String,
        command: String,
    },
    BackgroundTaskFinished {
        task_id: String,
        exit_code: Option<i32>,
    },
    Cancelled {
        session_key: String,
        scope: &'static str,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "ac_event");
    }
}
