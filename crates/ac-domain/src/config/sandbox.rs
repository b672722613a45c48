use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sandbox settings (merged user / project / local)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// User-visible shell sandbox settings. Merged from user, project and
/// local config layers before being handed to the Sandbox Profile Builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// Master switch. When false, commands run unsandboxed.
    #[serde(default)]
    pub enabled: bool,
    /// When a command is running inside a sandbox, auto-approve plain
    /// Bash calls that would otherwise need a permission prompt.
    #[serde(default)]
    pub auto_allow_bash_if_sandboxed: bool,
    /// Commands allowed to run unsandboxed even when `enabled` is true.
    #[serde(default)]
    pub allow_unsandboxed_commands: Vec<String>,
    /// Commands that must never be wrapped by the sandbox (e.g. already
    /// privileged tooling that manages its own isolation).
    #[serde(default)]
    pub excluded_commands: Vec<String>,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub permissions: PermissionSettings,
    /// What's writable, denied-within-allowed, and unreadable for the
    /// Sandbox Profile Builder (§3's Sandbox Profile data model).
    #[serde(default)]
    pub filesystem: FilesystemSettings,
    /// Tool-specific proxy environment variables to inject alongside the
    /// generic `HTTP_PROXY`/`HTTPS_PROXY`/`ALL_PROXY`/`NO_PROXY` set.
    #[serde(default)]
    pub proxy_tool_env: ProxyToolEnv,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_allow_bash_if_sandboxed: false,
            allow_unsandboxed_commands: Vec::new(),
            excluded_commands: Vec::new(),
            network: NetworkSettings::default(),
            permissions: PermissionSettings::default(),
            filesystem: FilesystemSettings::default(),
            proxy_tool_env: ProxyToolEnv::default(),
        }
    }
}

/// Network isolation settings for one sandboxed command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Hosts the proxy allows outright (glob, e.g. `*.github.com`).
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    /// Hosts the proxy denies outright. Deny wins over allow.
    #[serde(default)]
    pub denied_domains: Vec<String>,
    /// Unix domain socket paths the sandbox may connect to.
    #[serde(default)]
    pub allow_unix_sockets: Vec<String>,
    /// Allow connecting to *any* unix socket (overrides `allow_unix_sockets`).
    #[serde(default)]
    pub allow_all_unix_sockets: bool,
    /// Allow the sandboxed process to bind/listen on localhost.
    #[serde(default)]
    pub allow_local_binding: bool,
}

/// Tool-rule permission list, e.g. `WebFetch(domain:example.com)`,
/// `Write(/tmp/**)`, `Read(/etc/passwd)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionSettings {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Filesystem shape handed to the profile builder: what's writable, what's
/// explicitly denied even inside a writable root, and what's unreadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilesystemSettings {
    /// Roots the sandboxed process may write under. Empty means
    /// "no write restriction" (bind `/` read-write).
    #[serde(default)]
    pub write_allow: Vec<String>,
    /// Paths inside an allowed write root that are nonetheless read-only.
    #[serde(default)]
    pub write_deny_within_allow: Vec<String>,
    /// Paths (files or directories) hidden from reads entirely.
    #[serde(default)]
    pub read_deny: Vec<String>,
}

/// Extra environment variables injected per tool when the proxy is active
/// (Git SSH `ProxyCommand`, gRPC, cloud SDKs, rsync, Docker, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyToolEnv {
    #[serde(default)]
    pub extra: HashMap<String, String>,
}
