//! Sandbox Profile Builder (§4.5) — turns merged [`ac_domain::config::SandboxSettings`]
//! plus a per-command writable-root list into a platform-specific isolation
//! command line: bubblewrap arguments on Linux, a seatbelt S-expression
//! profile on macOS.
//!
//! The profile is immutable once built and is reused verbatim by the Shell
//! Executor to wrap a single command invocation.

use std::path::{Path, PathBuf};

use ac_domain::config::SandboxSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Macos,
    Unsupported,
}

pub fn current_platform() -> Platform {
    if cfg!(target_os = "linux") {
        Platform::Linux
    } else if cfg!(target_os = "macos") {
        Platform::Macos
    } else {
        Platform::Unsupported
    }
}

/// Resolved, per-command filesystem/network shape the builder consumes.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub needs_network_restriction: bool,
    pub read_deny: Vec<PathBuf>,
    pub write_allow: Vec<PathBuf>,
    pub write_deny_within_allow: Vec<PathBuf>,
    pub allowed_unix_sockets: Vec<PathBuf>,
    pub allow_all_unix_sockets: bool,
    pub allow_local_binding: bool,
    pub http_proxy_port: Option<u16>,
    pub socks_proxy_port: Option<u16>,
}

impl SandboxRequest {
    pub fn from_settings(settings: &SandboxSettings, cwd: &Path) -> Self {
        // A command always needs to write within its own working directory,
        // regardless of network settings, plus whatever extra roots the
        // merged config grants.
        let mut write_allow = vec![normalize_path(cwd)];
        write_allow.extend(settings.filesystem.write_allow.iter().map(|p| normalize_path(Path::new(p))));
        Self {
            needs_network_restriction: !settings.network.allowed_domains.is_empty()
                || !settings.network.denied_domains.is_empty(),
            read_deny: settings.filesystem.read_deny.iter().map(|p| normalize_path(Path::new(p))).collect(),
            write_allow,
            write_deny_within_allow: settings
                .filesystem
                .write_deny_within_allow
                .iter()
                .map(|p| normalize_path(Path::new(p)))
                .collect(),
            allowed_unix_sockets: settings
                .network
                .allow_unix_sockets
                .iter()
                .map(PathBuf::from)
                .collect(),
            allow_all_unix_sockets: settings.network.allow_all_unix_sockets,
            allow_local_binding: settings.network.allow_local_binding,
            http_proxy_port: None,
            socks_proxy_port: None,
        }
    }
}

/// A fully built, platform-specific sandbox profile for one command.
#[derive(Debug, Clone)]
pub enum SandboxProfile {
    Linux { bwrap_args: Vec<String> },
    Macos { seatbelt_profile: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxBuildError {
    #[error("sandboxing required but unavailable on this platform")]
    Unsupported,
}

impl SandboxProfile {
    pub fn build(req: &SandboxRequest, platform: Platform) -> Result<Self, SandboxBuildError> {
        match platform {
            Platform::Linux => Ok(Self::Linux { bwrap_args: build_bwrap_args(req) }),
            Platform::Macos => Ok(Self::Macos { seatbelt_profile: build_seatbelt_profile(req) }),
            Platform::Unsupported => Err(SandboxBuildError::Unsupported),
        }
    }

    /// Wrap a `/bin/sh -c <command>` invocation, returning the program and
    /// full argv the Shell Executor should spawn instead.
    pub fn wrap_shell_invocation(&self, command: &str) -> (String, Vec<String>) {
        match self {
            SandboxProfile::Linux { bwrap_args } => {
                let mut args = bwrap_args.clone();
                args.push("--".into());
                args.push("/bin/sh".into());
                args.push("-c".into());
                args.push(command.into());
                ("bwrap".into(), args)
            }
            SandboxProfile::Macos { seatbelt_profile } => (
                "sandbox-exec".into(),
                vec!["-p".into(), seatbelt_profile.clone(), "/bin/sh".into(), "-c".into(), command.into()],
            ),
        }
    }
}

fn normalize_path(p: &Path) -> PathBuf {
    p.canonicalize().unwrap_or_else(|_| p.to_path_buf())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Linux (bubblewrap)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_bwrap_args(req: &SandboxRequest) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--die-with-parent".into(),
        "--new-session".into(),
        "--unshare-pid".into(),
        "--unshare-uts".into(),
        "--unshare-ipc".into(),
    ];

    if req.needs_network_restriction {
        args.push("--unshare-net".into());
    }

    if req.write_allow.is_empty() {
        args.push("--bind".into());
        args.push("/".into());
        args.push("/".into());
    } else {
        args.push("--ro-bind".into());
        args.push("/".into());
        args.push("/".into());
        for root in &req.write_allow {
            let s = root.to_string_lossy().into_owned();
            args.push("--bind".into());
            args.push(s.clone());
            args.push(s);
        }
        for deny in &req.write_deny_within_allow {
            if req.write_allow.iter().any(|root| deny.starts_with(root)) {
                let s = deny.to_string_lossy().into_owned();
                args.push("--ro-bind".into());
                args.push(s.clone());
                args.push(s);
            }
        }
    }

    for deny in &req.read_deny {
        let s = deny.to_string_lossy().into_owned();
        if deny.extension().is_some() || !deny.to_string_lossy().ends_with('/') {
            args.push("--ro-bind".into());
            args.push("/dev/null".into());
            args.push(s);
        } else {
            args.push("--tmpfs".into());
            args.push(s);
        }
    }

    args
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// macOS (sandbox-exec / seatbelt)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_seatbelt_profile(req: &SandboxRequest) -> String {
    let mut sexprs = vec![
        "(version 1)".to_string(),
        "(deny default)".to_string(),
        "(allow process*)".to_string(),
        "(allow sysctl-read)".to_string(),
        "(allow mach-lookup)".to_string(),
    ];

    if req.needs_network_restriction {
        if req.allow_local_binding {
            sexprs.push("(allow network-bind (local ip \"localhost:*\"))".into());
        }
        for sock in &req.allowed_unix_sockets {
            sexprs.push(format!(
                "(allow network* (local-socket (path-literal {})))",
                quote_sexpr(&sock.to_string_lossy())
            ));
        }
        if req.allow_all_unix_sockets {
            sexprs.push("(allow network* (local-socket (socket-domain AF_UNIX)))".into());
        }
        if let Some(port) = req.http_proxy_port {
            sexprs.push(format!("(allow network-outbound (remote ip \"localhost:{port}\"))"));
        }
        if let Some(port) = req.socks_proxy_port {
            sexprs.push(format!("(allow network-outbound (remote ip \"localhost:{port}\"))"));
        }
    } else {
        sexprs.push("(allow network*)".into());
    }

    // Reads: allow everything, minus explicit deny entries.
    if req.read_deny.is_empty() {
        sexprs.push("(allow file-read*)".into());
    } else {
        let denies: Vec<String> = req
            .read_deny
            .iter()
            .map(|p| format!("(subpath {})", quote_sexpr(&p.to_string_lossy())))
            .collect();
        sexprs.push(format!("(allow file-read* (require-not (or {})))", denies.join(" ")));
    }

    // Writes: deny by default, explicit allows for writable roots + temp dirs.
    sexprs.push("(deny file-write*)".into());
    for root in &req.write_allow {
        sexprs.push(format!(
            "(allow file-write* (subpath {}))",
            quote_sexpr(&root.to_string_lossy())
        ));
    }
    for dir in ["/tmp", "/var/tmp", "/private/tmp", "/private/var/tmp", "/tmp/kode"] {
        sexprs.push(format!("(allow file-write* (subpath {}))", quote_sexpr(dir)));
    }
    sexprs.push("(allow file-write* (literal \"/dev/null\"))".into());

    for deny in &req.write_deny_within_allow {
        sexprs.push(format!(
            "(deny file-write-unlink (subpath {}))",
            quote_sexpr(&deny.to_string_lossy())
        ));
    }

    sexprs.join("\n")
}

fn quote_sexpr(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Path normalization shared by both backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `~` → home; `./x`/`../x` → resolved against cwd; relative → absolute;
/// realpath-follow where possible. Glob characters survive untouched —
/// callers decide per-platform whether to keep them literal (Linux) or
/// translate them to a regex (macOS).
pub fn normalize_sandbox_path(raw: &str, cwd: &Path) -> PathBuf {
    let expanded = if let Some(rest) = raw.strip_prefix("~/") {
        dirs_home().join(rest)
    } else if raw == "~" {
        dirs_home()
    } else {
        PathBuf::from(raw)
    };

    let joined = if expanded.is_absolute() { expanded } else { cwd.join(expanded) };
    joined.canonicalize().unwrap_or(joined)
}

fn dirs_home() -> PathBuf {
    std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_unrestricted_network_omits_unshare_net() {
        let req = SandboxRequest { needs_network_restriction: false, ..Default::default() };
        let args = build_bwrap_args(&req);
        assert!(!args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn linux_restricted_network_adds_unshare_net() {
        let req = SandboxRequest { needs_network_restriction: true, ..Default::default() };
        let args = build_bwrap_args(&req);
        assert!(args.contains(&"--unshare-net".to_string()));
    }

    #[test]
    fn from_settings_threads_filesystem_config_into_the_request() {
        use ac_domain::config::sandbox::FilesystemSettings;

        let mut settings = SandboxSettings::default();
        settings.filesystem = FilesystemSettings {
            write_allow: vec!["/workspace".into()],
            write_deny_within_allow: vec!["/workspace/.git".into()],
            read_deny: vec!["/etc/shadow".into()],
        };
        let req = SandboxRequest::from_settings(&settings, Path::new("/tmp/cwd"));

        assert!(req.write_allow.contains(&PathBuf::from("/tmp/cwd")));
        assert!(req.write_allow.contains(&PathBuf::from("/workspace")));
        assert!(req.write_deny_within_allow.contains(&PathBuf::from("/workspace/.git")));
        assert!(req.read_deny.contains(&PathBuf::from("/etc/shadow")));
    }

    #[test]
    fn linux_no_write_allow_binds_root_readwrite() {
        let req = SandboxRequest::default();
        let args = build_bwrap_args(&req);
        assert!(args.windows(3).any(|w| w == ["--bind", "/", "/"]));
    }

    #[test]
    fn linux_write_allow_binds_root_readonly_plus_writable_root() {
        let req = SandboxRequest { write_allow: vec![PathBuf::from("/workspace")], ..Default::default() };
        let args = build_bwrap_args(&req);
        assert!(args.windows(3).any(|w| w == ["--ro-bind", "/", "/"]));
        assert!(args.windows(3).any(|w| w[0] == "--bind" && w[1] == "/workspace"));
    }

    #[test]
    fn macos_unrestricted_network_allows_all() {
        let req = SandboxRequest { needs_network_restriction: false, ..Default::default() };
        let profile = build_seatbelt_profile(&req);
        assert!(profile.contains("(allow network*)"));
    }

    #[test]
    fn macos_restricted_network_omits_blanket_allow() {
        let req = SandboxRequest { needs_network_restriction: true, ..Default::default() };
        let profile = build_seatbelt_profile(&req);
        assert!(!profile.contains("(allow network*)"));
    }

    #[test]
    fn macos_denies_write_by_default() {
        let req = SandboxRequest::default();
        let profile = build_seatbelt_profile(&req);
        assert!(profile.contains("(deny file-write*)"));
    }

    #[test]
    fn wrap_shell_invocation_linux_uses_bwrap() {
        let profile = SandboxProfile::Linux { bwrap_args: vec!["--die-with-parent".into()] };
        let (program, args) = profile.wrap_shell_invocation("echo hi");
        assert_eq!(program, "bwrap");
        assert!(args.contains(&"echo hi".to_string()));
    }

    #[test]
    fn build_errs_on_unsupported_platform() {
        let req = SandboxRequest::default();
        let result = SandboxProfile::build(&req, Platform::Unsupported);
        assert!(matches!(result, Err(SandboxBuildError::Unsupported)));
    }
}
