/// Shared error type used across the runtime, tools and domain crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    /// Schema or semantic validation of a tool's input failed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The permission callback (or a deny-listed rule) refused the call.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A hook returned a blocking decision.
    #[error("blocked by hook: {0}")]
    HookBlock(String),

    /// Sandboxing was required by policy but is unavailable on this host.
    #[error("sandbox required but unavailable: {0}")]
    SandboxUnavailable(String),

    /// The turn or a tool invocation was cancelled.
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
