//! The runtime proper: Hook Runner, Tool Registry, Tool Invoker, Tool-Use
//! Queue and Turn Loop — the pieces that turn a capability-record table and
//! an LLM adapter into a running agent turn.

pub mod hooks;
pub mod invoker;
pub mod queue;
pub mod registry;
pub mod turn_loop;

pub use hooks::{HookOutcome, HookPayload, HookRunner};
pub use invoker::{HookMeta, InvocationEvent, ToolInvoker};
pub use queue::ToolUseQueue;
pub use registry::ToolRegistry;
pub use turn_loop::{QueryInput, TurnRuntime};
