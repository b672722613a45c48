//! Built-in tool implementations: the Shell Executor, Sandbox Profile
//! Builder, Proxy Gateway, Background Task Registry, Output Store, and the
//! file-operation primitives every [`ac_domain::capability::ToolCapability`]
//! in [`builtin`] is assembled from.
//!
//! This crate owns all side-effecting I/O. `ac-runtime` never touches a
//! filesystem or child process directly — it only holds `Arc<dyn
//! ToolCapability>` handles into this crate.

pub mod background;
pub mod builtin;
pub mod file_ops;
pub mod output_store;
pub mod proxy;
pub mod sandbox;
pub mod search;
pub mod shell;

pub use background::{BackgroundKind, BackgroundTask, BackgroundTaskRegistry};
pub use output_store::OutputStore;
pub use proxy::ProxyGateway;
pub use shell::{ShellExecutor, ShellOutcome, ShellRequest};
