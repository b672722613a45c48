//! Shared data model for the agent core: messages, tool capability records,
//! ambient per-turn context, configuration, and the error/trace vocabulary
//! every other crate in the workspace builds on.
//!
//! This crate has no I/O of its own — it is pure types plus the small amount
//! of logic (cancellation fan-out, context bookkeeping) that needs to be
//! shared rather than duplicated between the runtime and the tools.

pub mod cancel;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod message;
pub mod stream;
pub mod tool;
pub mod trace;

pub use error::{Error, Result};
