//! The turn-loop and tool-dispatch engine: the Hook Runner, Tool Registry,
//! Tool Invoker, Tool-Use Queue and Turn Loop that drive a conversation
//! between a user, an LLM adapter, and side-effecting tools.
//!
//! This crate owns orchestration only. Data types live in `ac-domain`;
//! side-effecting tool implementations live in `ac-tools`. Nothing here
//! touches a filesystem or child process directly — it only holds `Arc<dyn
//! ToolCapability>` handles and drives their streams.

pub mod runtime;

pub use runtime::{HookMeta, HookOutcome, HookPayload, HookRunner};
pub use runtime::{InvocationEvent, ToolInvoker};
pub use runtime::{QueryInput, ToolRegistry, ToolUseQueue, TurnRuntime};
