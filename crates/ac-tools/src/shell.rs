//! Shell Executor (§4.4) — runs one command through an optional sandbox
//! profile, promoting it into the Background Task Registry when it either
//! asks to run in the background or outruns its yield deadline.
//!
//! This is the single place `Bash`-shaped tool implementations funnel
//! through; it owns no LLM- or turn-level concepts, only process lifecycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};

use ac_domain::config::{ExecConfig, ExecSecurityConfig, SandboxSettings};

use crate::background::{BackgroundKind, BackgroundTask, BackgroundTaskRegistry};
use crate::output_store::OutputStore;
use crate::proxy::ProxyGateway;
use crate::sandbox::{current_platform, SandboxProfile, SandboxRequest};

#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub env: HashMap<String, String>,
    /// How long to wait before auto-backgrounding. `None` uses the configured
    /// default; `Some(0)` backgrounds immediately.
    pub yield_ms: Option<u64>,
    /// Hard kill timeout in seconds, capped by `max_requestable_timeout_sec`.
    pub timeout_sec: Option<u64>,
    pub run_in_background: bool,
}

#[derive(Debug, Clone)]
pub enum ShellOutcome {
    /// The command finished (or was killed/timed out) before the yield
    /// deadline — full combined output is available immediately.
    Completed {
        exit_code: Option<i32>,
        output: String,
        status: crate::background::BackgroundStatus,
    },
    /// The command outlived its yield window (or was asked to background
    /// outright) and now lives in the registry under `task_id`.
    Backgrounded { task_id: String, tail: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("command denied by security policy: matched pattern `{0}`")]
    DeniedPattern(String),
    #[error("environment variable `{0}` is blocked by security policy")]
    BlockedEnvVar(String),
    #[error("sandbox unavailable on this platform")]
    SandboxUnavailable,
    #[error("Maximum allowed timeout is {max}s, requested {requested}s")]
    TimeoutExceedsMaximum { requested: u64, max: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Exit code surfaced to the assistant when a task was killed or hit its
/// hard timeout rather than exiting on its own.
const KILLED_OR_TIMED_OUT_EXIT_CODE: i32 = 143;

/// Environment variables a command is never allowed to override — doing so
/// would let it escape its own invocation context (dynamic linker injection,
/// credential agents, interpreter startup files).
const BLOCKED_ENV_VARS: &[&str] = &[
    "LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES", "DYLD_LIBRARY_PATH", "DYLD_FRAMEWORK_PATH",
    "PATH", "HOME", "USER", "SHELL",
    "SSH_AUTH_SOCK", "SSH_AGENT_PID",
    "PYTHONPATH", "PYTHONSTARTUP", "PYTHONHOME",
    "NODE_PATH", "NODE_OPTIONS",
    "RUBYLIB", "RUBYOPT",
    "PERL5LIB", "PERL5OPT",
    "CLASSPATH",
    "BASH_ENV", "ENV", "CDPATH", "IFS",
];

pub struct ShellExecutor {
    pub registry: Arc<BackgroundTaskRegistry>,
    pub output_store: Arc<OutputStore>,
    pub exec_config: ExecConfig,
    pub security: ExecSecurityConfig,
    pub sandbox_settings: SandboxSettings,
    pub max_requestable_timeout_sec: u64,
    pub proxy: Option<Arc<ProxyGateway>>,
}

impl ShellExecutor {
    /// Reject obviously-dangerous commands and env overrides before any
    /// process is spawned. Called from `validate_input` on the owning tool,
    /// ahead of the hook chain, per §4.4.
    pub fn validate(&self, req: &ShellRequest) -> Result<(), ShellError> {
        for pattern in &self.security.denied_patterns {
            if let Ok(re) = regex::Regex::new(pattern) {
                if re.is_match(&req.command) {
                    ac_domain::trace::TraceEvent::SandboxDenied { command: req.command.clone() }
                        .emit();
                    return Err(ShellError::DeniedPattern(pattern.clone()));
                }
            }
        }
        for key in req.env.keys() {
            if BLOCKED_ENV_VARS.contains(&key.to_ascii_uppercase().as_str()) {
                return Err(ShellError::BlockedEnvVar(key.clone()));
            }
        }
        if let Some(requested) = req.timeout_sec {
            if requested > self.max_requestable_timeout_sec {
                return Err(ShellError::TimeoutExceedsMaximum {
                    requested,
                    max: self.max_requestable_timeout_sec,
                });
            }
        }
        Ok(())
    }

    fn effective_timeout(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.exec_config.timeout_sec)
    }

    fn command_and_args(&self, req: &ShellRequest) -> Result<(String, Vec<String>), ShellError> {
        if !self.sandbox_settings.enabled
            || self
                .sandbox_settings
                .excluded_commands
                .iter()
                .any(|c| c == &req.command)
        {
            return Ok(("sh".into(), vec!["-c".into(), req.command.clone()]));
        }
        let sandbox_req = SandboxRequest::from_settings(&self.sandbox_settings, &req.workdir);
        let profile = SandboxProfile::build(&sandbox_req, current_platform())
            .map_err(|_| ShellError::SandboxUnavailable)?;
        ac_domain::trace::TraceEvent::SandboxProfileBuilt {
            platform: format!("{:?}", current_platform()),
            network_restricted: sandbox_req.needs_network_restriction,
        }
        .emit();
        Ok(profile.wrap_shell_invocation(&req.command))
    }

    pub async fn run(&self, req: ShellRequest) -> Result<ShellOutcome, ShellError> {
        self.validate(&req)?;

        if self.security.audit_log {
            tracing::info!(command = %req.command, workdir = %req.workdir.display(), "shell exec");
        }

        let (program, args) = self.command_and_args(&req)?;
        let timeout_sec = self.effective_timeout(req.timeout_sec);

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.current_dir(&req.workdir);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::piped());
        for (k, v) in &req.env {
            cmd.env(k, v);
        }
        if let Some(proxy) = &self.proxy {
            for (k, v) in proxy.env_vars() {
                cmd.env(k, v);
            }
        }

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let timeout_at = Some(Utc::now() + ChronoDuration::seconds(timeout_sec as i64));
        let task = self.registry.register(
            BackgroundKind::LocalShell,
            req.command.clone(),
            self.output_store.dir(),
            timeout_at,
        );
        self.output_store.create(&task.id).await.ok();

        let done = Arc::new(Notify::new());
        spawn_monitor(
            child,
            stdout,
            stderr,
            stdin,
            task.clone(),
            self.output_store.clone(),
            timeout_sec,
            done.clone(),
        );

        let background_ms = req.yield_ms.unwrap_or(self.exec_config.background_ms);

        if req.run_in_background || background_ms == 0 {
            ac_domain::trace::TraceEvent::BackgroundTaskPromoted {
                task_id: task.id.clone(),
                command: req.command.clone(),
            }
            .emit();
            return Ok(ShellOutcome::Backgrounded { task_id: task.id.clone(), tail: String::new() });
        }

        tokio::select! {
            _ = done.notified() => {
                let output = task.stdout.snapshot() + &task.stderr.snapshot();
                Ok(ShellOutcome::Completed {
                    exit_code: task.exit_code(),
                    output,
                    status: task.status(),
                })
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(background_ms)) => {
                ac_domain::trace::TraceEvent::BackgroundTaskPromoted {
                    task_id: task.id.clone(),
                    command: req.command.clone(),
                }
                .emit();
                let tail = tail_lines(&task.stdout.snapshot(), 20);
                Ok(ShellOutcome::Backgrounded { task_id: task.id.clone(), tail })
            }
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[allow(clippy::too_many_arguments)]
fn spawn_monitor(
    mut child: tokio::process::Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    stdin: Option<tokio::process::ChildStdin>,
    task: Arc<BackgroundTask>,
    output_store: Arc<OutputStore>,
    timeout_sec: u64,
    done: Arc<Notify>,
) {
    let (_stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(32);
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
    task.set_kill_sender(kill_tx);

    tokio::spawn(async move {
        let stdout_task = {
            let task = task.clone();
            let store = output_store.clone();
            tokio::spawn(async move {
                if let Some(stdout) = stdout {
                    let mut reader = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        task.stdout.push(&line);
                        task.stdout.push("\n");
                        let _ = store.append(&task.id, &format!("{line}\n")).await;
                    }
                }
            })
        };

        let stderr_task = {
            let task = task.clone();
            let store = output_store.clone();
            tokio::spawn(async move {
                if let Some(stderr) = stderr {
                    let mut reader = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = reader.next_line().await {
                        task.stderr.push(&line);
                        task.stderr.push("\n");
                        let _ = store.append(&task.id, &format!("{line}\n")).await;
                    }
                }
            })
        };

        let stdin_task = tokio::spawn(async move {
            if let Some(mut stdin) = stdin {
                while let Some(data) = stdin_rx.recv().await {
                    if stdin.write_all(&data).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            }
        });

        let timeout_dur = std::time::Duration::from_secs(timeout_sec);
        tokio::select! {
            result = child.wait() => {
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                stdin_task.abort();
                match result {
                    Ok(exit) => task.set_exit_code(exit.code().unwrap_or(KILLED_OR_TIMED_OUT_EXIT_CODE)),
                    Err(_) => task.set_exit_code(KILLED_OR_TIMED_OUT_EXIT_CODE),
                }
            }
            _ = kill_rx.recv() => {
                let _ = child.kill().await;
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                stdin_task.abort();
                task.set_exit_code(KILLED_OR_TIMED_OUT_EXIT_CODE);
            }
            _ = tokio::time::sleep(timeout_dur) => {
                let _ = child.kill().await;
                task.timed_out.store(true, std::sync::atomic::Ordering::Release);
                let _ = stdout_task.await;
                let _ = stderr_task.await;
                stdin_task.abort();
                task.set_exit_code(KILLED_OR_TIMED_OUT_EXIT_CODE);
            }
        }

        ac_domain::trace::TraceEvent::BackgroundTaskFinished {
            task_id: task.id.clone(),
            exit_code: task.exit_code(),
        }
        .emit();
        done.notify_waiters();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> ShellExecutor {
        ShellExecutor {
            registry: Arc::new(BackgroundTaskRegistry::new()),
            output_store: Arc::new(OutputStore::new(std::env::temp_dir().join("ac-tools-test"))),
            exec_config: ExecConfig::default(),
            security: ExecSecurityConfig::default(),
            sandbox_settings: SandboxSettings::default(),
            max_requestable_timeout_sec: 600,
            proxy: None,
        }
    }

    #[test]
    fn validate_rejects_denied_pattern() {
        let exec = executor();
        let req = ShellRequest {
            command: "rm -rf /".into(),
            workdir: std::env::temp_dir(),
            env: HashMap::new(),
            yield_ms: None,
            timeout_sec: None,
            run_in_background: false,
        };
        assert!(matches!(exec.validate(&req), Err(ShellError::DeniedPattern(_))));
    }

    #[test]
    fn validate_rejects_blocked_env_var() {
        let exec = executor();
        let mut env = HashMap::new();
        env.insert("LD_PRELOAD".to_string(), "/tmp/evil.so".to_string());
        let req = ShellRequest {
            command: "echo hi".into(),
            workdir: std::env::temp_dir(),
            env,
            yield_ms: None,
            timeout_sec: None,
            run_in_background: false,
        };
        assert!(matches!(exec.validate(&req), Err(ShellError::BlockedEnvVar(_))));
    }

    #[test]
    fn effective_timeout_uses_requested_or_default() {
        let exec = executor();
        assert_eq!(exec.effective_timeout(Some(30)), 30);
        assert_eq!(exec.effective_timeout(None), 120);
    }

    #[test]
    fn validate_rejects_timeout_above_maximum() {
        let exec = executor();
        let req = ShellRequest {
            command: "ls".into(),
            workdir: std::env::temp_dir(),
            env: HashMap::new(),
            yield_ms: None,
            timeout_sec: Some(700_000),
            run_in_background: false,
        };
        let err = exec.validate(&req).unwrap_err();
        assert!(matches!(err, ShellError::TimeoutExceedsMaximum { .. }));
        assert!(err.to_string().contains("Maximum allowed timeout"));
    }

    #[tokio::test]
    async fn run_completes_fast_command_in_foreground() {
        let exec = executor();
        let req = ShellRequest {
            command: "echo hello".into(),
            workdir: std::env::temp_dir(),
            env: HashMap::new(),
            yield_ms: Some(2_000),
            timeout_sec: Some(5),
            run_in_background: false,
        };
        match exec.run(req).await.unwrap() {
            ShellOutcome::Completed { exit_code, output, .. } => {
                assert_eq!(exit_code, Some(0));
                assert!(output.contains("hello"));
            }
            ShellOutcome::Backgrounded { .. } => panic!("expected fast command to complete"),
        }
    }

    #[tokio::test]
    async fn run_backgrounds_when_run_in_background_is_set() {
        let exec = executor();
        let req = ShellRequest {
            command: "sleep 0.2 && echo done".into(),
            workdir: std::env::temp_dir(),
            env: HashMap::new(),
            yield_ms: None,
            timeout_sec: Some(5),
            run_in_background: true,
        };
        match exec.run(req).await.unwrap() {
            ShellOutcome::Backgrounded { task_id, .. } => {
                assert!(task_id.starts_with('b'));
            }
            ShellOutcome::Completed { .. } => panic!("expected backgrounding"),
        }
    }
}
