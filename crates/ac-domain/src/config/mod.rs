pub mod compaction;
pub mod hooks;
pub mod observability;
pub mod sandbox;
pub mod tools;

pub use compaction::*;
pub use hooks::*;
pub use observability::*;
pub use sandbox::*;
pub use tools::*;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Merged runtime configuration (user + project + local layers already
/// flattened by the caller). The core only reads from this; it never
/// knows how the layers were merged or where they came from on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub hooks: HooksConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sandbox_disabled() {
        let cfg = Config::default();
        assert!(!cfg.sandbox.enabled);
    }

    #[test]
    fn deserialize_empty_toml_uses_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.tools.exec.timeout_sec, 120);
        assert!(cfg.compaction.auto);
    }
}
