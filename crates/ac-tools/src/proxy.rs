//! Proxy Gateway (§4.5) — an in-process HTTP CONNECT + SOCKS5 listener that
//! every sandboxed command is routed through when network access is
//! restricted. Lets the core approve or deny outbound connections per-host
//! without needing the sandbox layer itself to parse TLS SNI or DNS.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

use ac_domain::config::{NetworkSettings, ProxyToolEnv};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDecision {
    Allow,
    Deny,
}

/// The three ways a host can relate to the merged allow/deny lists: matched
/// by a rule either way, or caught by neither (which needs a permission
/// callback to resolve, not an automatic decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HostRuleDecision {
    Allow,
    Deny,
    Ask,
}

/// Asks a human (or other out-of-band authority) whether a host neither
/// explicitly allowed nor denied by rule may be reached. Implementations
/// should themselves serialize overlapping prompts if they render UI; the
/// gateway additionally coalesces concurrent asks for the same host and
/// only ever has one prompt in flight at a time.
#[async_trait]
pub trait ProxyPermissionCallback: Send + Sync {
    async fn ask(&self, host: &str) -> bool;
}

/// Deny-wins-over-allow glob matching against the merged allow/deny domain
/// lists: a host matching any deny pattern is rejected even if it also
/// matches an allow pattern. A non-empty allow list that the host doesn't
/// match is `Ask`, not an automatic deny — §4.5 routes that case through
/// the permission callback.
fn rule_decision(host: &str, settings: &NetworkSettings) -> HostRuleDecision {
    if settings.denied_domains.iter().any(|pat| glob_match_host(pat, host)) {
        return HostRuleDecision::Deny;
    }
    if settings.allowed_domains.is_empty() {
        return HostRuleDecision::Allow;
    }
    if settings.allowed_domains.iter().any(|pat| glob_match_host(pat, host)) {
        HostRuleDecision::Allow
    } else {
        HostRuleDecision::Ask
    }
}

/// Rule-only host decision, with no permission callback: used where the
/// gateway has no asker configured. An `Ask` rule verdict fails closed.
pub fn decide_host(host: &str, settings: &NetworkSettings) -> HostDecision {
    match rule_decision(host, settings) {
        HostRuleDecision::Allow => HostDecision::Allow,
        HostRuleDecision::Deny | HostRuleDecision::Ask => HostDecision::Deny,
    }
}

fn glob_match_host(pattern: &str, host: &str) -> bool {
    const CASE_INSENSITIVE: glob::MatchOptions = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    match glob::Pattern::new(pattern) {
        Ok(p) => p.matches_with(host, CASE_INSENSITIVE),
        Err(_) => pattern.eq_ignore_ascii_case(host),
    }
}

/// Per-host decisions are cached for the lifetime of the gateway so a
/// command opening many connections to the same host only prompts (or
/// evaluates the glob list) once. `pending` coalesces concurrent asks for
/// the same not-yet-decided host onto a single in-flight prompt.
#[derive(Default)]
struct DecisionCache {
    entries: Mutex<HashMap<String, HostDecision>>,
    pending: Mutex<HashMap<String, Arc<Notify>>>,
}

impl DecisionCache {
    fn get_or_compute(&self, host: &str, settings: &NetworkSettings) -> HostDecision {
        if let Some(d) = self.entries.lock().get(host) {
            return *d;
        }
        let decision = decide_host(host, settings);
        self.entries.lock().insert(host.to_string(), decision);
        decision
    }

    fn cached(&self, host: &str) -> Option<HostDecision> {
        self.entries.lock().get(host).copied()
    }

    fn store(&self, host: &str, decision: HostDecision) {
        self.entries.lock().insert(host.to_string(), decision);
    }

    /// Resolve a host fully, asking the permission callback (serialized,
    /// coalesced per-host) when the rule set is ambiguous.
    async fn resolve(
        &self,
        host: &str,
        settings: &NetworkSettings,
        permission: &Option<Arc<dyn ProxyPermissionCallback>>,
        prompt_lock: &tokio::sync::Mutex<()>,
    ) -> HostDecision {
        if let Some(d) = self.cached(host) {
            return d;
        }
        match rule_decision(host, settings) {
            HostRuleDecision::Allow => {
                self.store(host, HostDecision::Allow);
                HostDecision::Allow
            }
            HostRuleDecision::Deny => {
                self.store(host, HostDecision::Deny);
                HostDecision::Deny
            }
            HostRuleDecision::Ask => self.ask_coalesced(host, permission, prompt_lock).await,
        }
    }

    async fn ask_coalesced(
        &self,
        host: &str,
        permission: &Option<Arc<dyn ProxyPermissionCallback>>,
        prompt_lock: &tokio::sync::Mutex<()>,
    ) -> HostDecision {
        loop {
            if let Some(d) = self.cached(host) {
                return d;
            }
            let existing = self.pending.lock().get(host).cloned();
            match existing {
                Some(notify) => notify.notified().await,
                None => {
                    let notify = Arc::new(Notify::new());
                    self.pending.lock().insert(host.to_string(), notify.clone());
                    let decision = {
                        // One permission prompt at a time, process-wide.
                        let _serialize = prompt_lock.lock().await;
                        match permission {
                            Some(cb) if cb.ask(host).await => HostDecision::Allow,
                            _ => HostDecision::Deny,
                        }
                    };
                    self.store(host, decision);
                    self.pending.lock().remove(host);
                    notify.notify_waiters();
                    return decision;
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("malformed CONNECT request")]
    MalformedRequest,
    #[error("unsupported SOCKS version {0}")]
    UnsupportedSocksVersion(u8),
}

/// One gateway instance, bound to a single loopback port, proxying both an
/// HTTP CONNECT tunnel and a SOCKS5 tunnel for sandboxed commands whose
/// network namespace only permits talking to this port.
pub struct ProxyGateway {
    http_port: u16,
    socks_port: u16,
    settings: Arc<NetworkSettings>,
    cache: Arc<DecisionCache>,
    permission: Option<Arc<dyn ProxyPermissionCallback>>,
    prompt_lock: Arc<tokio::sync::Mutex<()>>,
    tool_env: ProxyToolEnv,
}

impl ProxyGateway {
    /// Bind both listeners on loopback, picking ephemeral ports, and spawn
    /// their accept loops. Returns immediately; the gateway runs for as
    /// long as the returned handle (or a clone of it) is alive.
    pub async fn spawn(settings: NetworkSettings) -> io::Result<Self> {
        Self::spawn_with_permission(settings, None).await
    }

    /// As [`Self::spawn`], but resolves hosts neither allowed nor denied by
    /// rule through `permission` instead of failing closed.
    pub async fn spawn_with_permission(
        settings: NetworkSettings,
        permission: Option<Arc<dyn ProxyPermissionCallback>>,
    ) -> io::Result<Self> {
        Self::spawn_with_tool_env(settings, permission, ProxyToolEnv::default()).await
    }

    /// As [`Self::spawn_with_permission`], additionally injecting
    /// `tool_env`'s `extra` map alongside the standard per-tool proxy
    /// variables (§4.5's Git SSH / gRPC / Cloud SDK / rsync / Docker
    /// equivalents).
    pub async fn spawn_with_tool_env(
        settings: NetworkSettings,
        permission: Option<Arc<dyn ProxyPermissionCallback>>,
        tool_env: ProxyToolEnv,
    ) -> io::Result<Self> {
        let http_listener = TcpListener::bind("127.0.0.1:0").await?;
        let socks_listener = TcpListener::bind("127.0.0.1:0").await?;
        let http_port = http_listener.local_addr()?.port();
        let socks_port = socks_listener.local_addr()?.port();

        let settings = Arc::new(settings);
        let cache = Arc::new(DecisionCache::default());
        let prompt_lock = Arc::new(tokio::sync::Mutex::new(()));

        tokio::spawn(accept_loop(
            http_listener,
            settings.clone(),
            cache.clone(),
            permission.clone(),
            prompt_lock.clone(),
            ConnKind::Http,
        ));
        tokio::spawn(accept_loop(
            socks_listener,
            settings.clone(),
            cache.clone(),
            permission.clone(),
            prompt_lock.clone(),
            ConnKind::Socks5,
        ));

        Ok(Self { http_port, socks_port, settings, cache, permission, prompt_lock, tool_env })
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Env vars the Shell Executor injects into a sandboxed command so its
    /// HTTP/SOCKS clients discover this gateway (§6 `ProxyToolEnv`). `NO_PROXY`
    /// excludes loopback and the RFC1918 private ranges so a command can
    /// still talk to itself or another sandboxed peer without tunnelling.
    /// Beyond the four generic vars, also sets the tool-specific equivalents
    /// named in SPEC_FULL.md §4.5 (Git SSH, gRPC, cloud SDKs, rsync, Docker)
    /// keyed off the same ports, then layers in any caller-configured
    /// `ProxyToolEnv::extra` overrides on top.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        let http = format!("http://127.0.0.1:{}", self.http_port);
        let socks = format!("socks5h://127.0.0.1:{}", self.socks_port);
        let mut vars = vec![
            ("HTTP_PROXY".into(), http.clone()),
            ("HTTPS_PROXY".into(), http.clone()),
            ("ALL_PROXY".into(), socks.clone()),
            (
                "NO_PROXY".into(),
                "localhost,127.0.0.0/8,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16".into(),
            ),
            // Git over SSH routed through the SOCKS tunnel via `nc`-style ProxyCommand.
            ("GIT_SSH_COMMAND".into(), format!("ssh -o ProxyCommand='nc -X 5 -x 127.0.0.1:{} %h %p'", self.socks_port)),
            // gRPC clients (grpc-go, grpc-java) read lowercase `grpc_proxy`.
            ("grpc_proxy".into(), http.clone()),
            // rsync's `RSYNC_PROXY` expects `host:port`, no scheme.
            ("RSYNC_PROXY".into(), format!("127.0.0.1:{}", self.http_port)),
            // gcloud/aws/az CLIs honor the generic HTTPS_PROXY but also check this.
            ("CLOUDSDK_PROXY_ADDRESS".into(), "127.0.0.1".into()),
            ("CLOUDSDK_PROXY_PORT".into(), self.http_port.to_string()),
            ("CLOUDSDK_PROXY_TYPE".into(), "http".into()),
            // Docker CLI / daemon proxy config.
            ("DOCKER_HTTP_PROXY".into(), http.clone()),
            ("DOCKER_HTTPS_PROXY".into(), http),
        ];
        for (k, v) in &self.tool_env.extra {
            if let Some(existing) = vars.iter_mut().find(|(key, _)| key == k) {
                existing.1 = v.clone();
            } else {
                vars.push((k.clone(), v.clone()));
            }
        }
        vars
    }

    pub async fn decide(&self, host: &str) -> HostDecision {
        self.cache
            .resolve(host, &self.settings, &self.permission, &self.prompt_lock)
            .await
    }
}

#[derive(Clone, Copy)]
enum ConnKind {
    Http,
    Socks5,
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    settings: Arc<NetworkSettings>,
    cache: Arc<DecisionCache>,
    permission: Option<Arc<dyn ProxyPermissionCallback>>,
    prompt_lock: Arc<tokio::sync::Mutex<()>>,
    kind: ConnKind,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "proxy gateway accept failed");
                continue;
            }
        };
        let settings = settings.clone();
        let cache = cache.clone();
        let permission = permission.clone();
        let prompt_lock = prompt_lock.clone();
        tokio::spawn(async move {
            let result = match kind {
                ConnKind::Http => handle_http(stream, &settings, &cache, &permission, &prompt_lock).await,
                ConnKind::Socks5 => handle_socks5(stream, &settings, &cache, &permission, &prompt_lock).await,
            };
            if let Err(err) = result {
                tracing::debug!(%peer, error = %err, "proxy gateway connection ended");
            }
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP CONNECT
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatches a freshly-accepted HTTP listener connection to either the
/// CONNECT tunnel path (used for HTTPS) or plain HTTP/1.1 forwarding (used
/// for unencrypted requests, which never go through a tunnel handshake).
async fn handle_http(
    mut stream: TcpStream,
    settings: &NetworkSettings,
    cache: &DecisionCache,
    permission: &Option<Arc<dyn ProxyPermissionCallback>>,
    prompt_lock: &tokio::sync::Mutex<()>,
) -> Result<(), ProxyError> {
    let mut reader = BufReader::new(&mut stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        drop(reader);
        stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(ProxyError::MalformedRequest);
    };
    let method = method.to_string();
    let target = target.to_string();
    let version = version.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
        headers.push(line);
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        return handle_connect(stream, &target, settings, cache, permission, prompt_lock).await;
    }

    handle_plain_http(stream, &method, &target, &version, &headers, settings, cache, permission, prompt_lock).await
}

async fn handle_connect(
    mut stream: TcpStream,
    target: &str,
    settings: &NetworkSettings,
    cache: &DecisionCache,
    permission: &Option<Arc<dyn ProxyPermissionCallback>>,
    prompt_lock: &tokio::sync::Mutex<()>,
) -> Result<(), ProxyError> {
    let host = target.split(':').next().unwrap_or(target);
    let decision = cache.resolve(host, settings, permission, prompt_lock).await;

    ac_domain::trace::TraceEvent::ProxyDecision {
        host: host.to_string(),
        allowed: decision == HostDecision::Allow,
        source: "http_connect",
    }
    .emit();

    if decision == HostDecision::Deny {
        stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await?;
        return Ok(());
    }

    let upstream = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(_) => {
            stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };
    stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
    tunnel(stream, upstream).await
}

/// Forwards a plain (non-TLS) HTTP/1.1 request: rewrite absolute-form
/// targets to origin-form, force `Connection: close`, ensure a `Host`
/// header is present, then copy the upstream response back verbatim.
#[allow(clippy::too_many_arguments)]
async fn handle_plain_http(
    mut client: TcpStream,
    method: &str,
    target: &str,
    version: &str,
    headers: &[String],
    settings: &NetworkSettings,
    cache: &DecisionCache,
    permission: &Option<Arc<dyn ProxyPermissionCallback>>,
    prompt_lock: &tokio::sync::Mutex<()>,
) -> Result<(), ProxyError> {
    let (host_port, origin_path) = split_absolute_form(target)
        .unwrap_or_else(|| (host_header_value(headers).unwrap_or_default(), target.to_string()));

    if host_port.is_empty() {
        client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
        return Err(ProxyError::MalformedRequest);
    }

    let host = host_port.split(':').next().unwrap_or(&host_port);
    let decision = cache.resolve(host, settings, permission, prompt_lock).await;

    ac_domain::trace::TraceEvent::ProxyDecision {
        host: host.to_string(),
        allowed: decision == HostDecision::Allow,
        source: "http_plain",
    }
    .emit();

    if decision == HostDecision::Deny {
        client.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await?;
        return Ok(());
    }

    let addr = if host_port.contains(':') { host_port.clone() } else { format!("{host_port}:80") };
    let mut upstream = match TcpStream::connect(&addr).await {
        Ok(s) => s,
        Err(_) => {
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            return Ok(());
        }
    };

    let mut request = format!("{method} {origin_path} {version}\r\n");
    let mut saw_host = false;
    for line in headers {
        if line.to_ascii_lowercase().starts_with("host:") {
            saw_host = true;
        }
        if line.to_ascii_lowercase().starts_with("connection:") {
            continue;
        }
        request.push_str(line);
    }
    if !saw_host {
        request.push_str(&format!("Host: {host_port}\r\n"));
    }
    request.push_str("Connection: close\r\n\r\n");

    upstream.write_all(request.as_bytes()).await?;
    tokio::io::copy(&mut upstream, &mut client).await?;
    Ok(())
}

/// Splits an absolute-form request target (`http://host:port/path`) into
/// its host:port and origin-form path. Returns `None` for origin-form
/// targets (a bare `/path`), which already carry no host.
fn split_absolute_form(target: &str) -> Option<(String, String)> {
    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    Some((authority.to_string(), if path.is_empty() { "/".to_string() } else { path.to_string() }))
}

fn host_header_value(headers: &[String]) -> Option<String> {
    headers.iter().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("host") {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SOCKS5 (no-auth, CONNECT command only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn handle_socks5(
    mut stream: TcpStream,
    settings: &NetworkSettings,
    cache: &DecisionCache,
    permission: &Option<Arc<dyn ProxyPermissionCallback>>,
    prompt_lock: &tokio::sync::Mutex<()>,
) -> Result<(), ProxyError> {
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    let [version, nmethods] = greeting;
    if version != 0x05 {
        return Err(ProxyError::UnsupportedSocksVersion(version));
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?; // no-auth

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [_ver, cmd, _rsv, atyp] = header;

    let host = match atyp {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        0x04 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        _other => {
            write_socks_reply(&mut stream, 0x08).await?;
            return Err(ProxyError::MalformedRequest);
        }
    };
    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;
    let port = u16::from_be_bytes(port_buf);

    if cmd != 0x01 {
        write_socks_reply(&mut stream, 0x07).await?;
        return Ok(());
    }

    let decision = cache.resolve(&host, settings, permission, prompt_lock).await;
    ac_domain::trace::TraceEvent::ProxyDecision {
        host: host.clone(),
        allowed: decision == HostDecision::Allow,
        source: "socks5",
    }
    .emit();

    if decision == HostDecision::Deny {
        write_socks_reply(&mut stream, 0x02).await?;
        return Ok(());
    }

    let target: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(_) => {
            // Hostname rather than literal address: let the OS resolver handle it.
            match tokio::net::lookup_host((host.as_str(), port)).await?.next() {
                Some(addr) => addr,
                None => {
                    write_socks_reply(&mut stream, 0x04).await?;
                    return Ok(());
                }
            }
        }
    };

    let upstream = match TcpStream::connect(target).await {
        Ok(s) => s,
        Err(_) => {
            write_socks_reply(&mut stream, 0x01).await?;
            return Ok(());
        }
    };
    write_socks_reply(&mut stream, 0x00).await?;
    tunnel(stream, upstream).await
}

async fn write_socks_reply(stream: &mut TcpStream, rep: u8) -> io::Result<()> {
    stream
        .write_all(&[0x05, rep, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

async fn tunnel(mut a: TcpStream, mut b: TcpStream) -> Result<(), ProxyError> {
    tokio::io::copy_bidirectional(&mut a, &mut b).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(allowed: &[&str], denied: &[&str]) -> NetworkSettings {
        NetworkSettings {
            allowed_domains: allowed.iter().map(|s| s.to_string()).collect(),
            denied_domains: denied.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn empty_allow_list_allows_everything_not_denied() {
        let s = settings(&[], &["evil.example"]);
        assert_eq!(decide_host("anything.example", &s), HostDecision::Allow);
        assert_eq!(decide_host("evil.example", &s), HostDecision::Deny);
    }

    #[test]
    fn allow_list_restricts_to_matches() {
        let s = settings(&["api.example.com"], &[]);
        assert_eq!(decide_host("api.example.com", &s), HostDecision::Allow);
        assert_eq!(decide_host("other.example.com", &s), HostDecision::Deny);
    }

    #[test]
    fn deny_wins_over_allow() {
        let s = settings(&["*.example.com"], &["evil.example.com"]);
        assert_eq!(decide_host("evil.example.com", &s), HostDecision::Deny);
        assert_eq!(decide_host("good.example.com", &s), HostDecision::Allow);
    }

    #[test]
    fn glob_wildcard_matches_subdomains() {
        let s = settings(&["*.internal.example.com"], &[]);
        assert_eq!(decide_host("svc.internal.example.com", &s), HostDecision::Allow);
        assert_eq!(decide_host("internal.example.com", &s), HostDecision::Deny);
    }

    #[test]
    fn host_matching_is_case_insensitive() {
        assert!(glob_match_host("example.com", "EXAMPLE.com"));
        assert!(glob_match_host("*.Example.com", "api.example.com"));
    }

    #[test]
    fn decision_cache_is_stable_across_calls() {
        let s = settings(&["api.example.com"], &[]);
        let cache = DecisionCache::default();
        assert_eq!(cache.get_or_compute("api.example.com", &s), HostDecision::Allow);
        assert_eq!(cache.get_or_compute("api.example.com", &s), HostDecision::Allow);
    }

    #[tokio::test]
    async fn gateway_spawns_and_reports_distinct_ports() {
        let gateway = ProxyGateway::spawn(NetworkSettings::default()).await.unwrap();
        assert_ne!(gateway.http_port(), gateway.socks_port());
        assert!(gateway.env_vars().iter().any(|(k, _)| k == "HTTP_PROXY"));
        assert!(gateway.env_vars().iter().any(|(k, v)| k == "ALL_PROXY" && v.starts_with("socks5h://")));
        assert!(gateway.env_vars().iter().any(|(k, _)| k == "NO_PROXY"));
    }

    #[tokio::test]
    async fn env_vars_include_tool_specific_equivalents_and_overrides() {
        let mut tool_env = ProxyToolEnv::default();
        tool_env.extra.insert("grpc_proxy".into(), "http://override:1".into());
        tool_env.extra.insert("CUSTOM_TOOL_PROXY".into(), "custom://value".into());
        let gateway =
            ProxyGateway::spawn_with_tool_env(NetworkSettings::default(), None, tool_env).await.unwrap();
        let vars = gateway.env_vars();
        assert!(vars.iter().any(|(k, v)| k == "GIT_SSH_COMMAND" && v.contains("ProxyCommand")));
        assert!(vars.iter().any(|(k, _)| k == "RSYNC_PROXY"));
        assert!(vars.iter().any(|(k, _)| k == "DOCKER_HTTP_PROXY"));
        // Caller-supplied extras override the built-in default...
        assert!(vars.iter().any(|(k, v)| k == "grpc_proxy" && v == "http://override:1"));
        // ...and add brand-new keys the standard set doesn't cover.
        assert!(vars.iter().any(|(k, v)| k == "CUSTOM_TOOL_PROXY" && v == "custom://value"));
    }

    struct AlwaysAllow;

    #[async_trait]
    impl ProxyPermissionCallback for AlwaysAllow {
        async fn ask(&self, _host: &str) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn ambiguous_host_without_callback_fails_closed() {
        let s = settings(&["api.example.com"], &[]);
        let cache = DecisionCache::default();
        let prompt_lock = tokio::sync::Mutex::new(());
        let decision = cache.resolve("other.example.com", &s, &None, &prompt_lock).await;
        assert_eq!(decision, HostDecision::Deny);
    }

    #[tokio::test]
    async fn ambiguous_host_asks_callback_and_caches() {
        let s = settings(&["api.example.com"], &[]);
        let cache = DecisionCache::default();
        let permission: Option<Arc<dyn ProxyPermissionCallback>> = Some(Arc::new(AlwaysAllow));
        let prompt_lock = tokio::sync::Mutex::new(());
        let decision = cache.resolve("other.example.com", &s, &permission, &prompt_lock).await;
        assert_eq!(decision, HostDecision::Allow);
        // Second call hits the cache, not the callback again.
        let decision2 = cache.resolve("other.example.com", &s, &permission, &prompt_lock).await;
        assert_eq!(decision2, HostDecision::Allow);
    }

    #[tokio::test]
    async fn concurrent_asks_for_same_host_coalesce() {
        let s = Arc::new(settings(&["api.example.com"], &[]));
        let cache = Arc::new(DecisionCache::default());
        let permission: Option<Arc<dyn ProxyPermissionCallback>> = Some(Arc::new(AlwaysAllow));
        let prompt_lock = Arc::new(tokio::sync::Mutex::new(()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let s = s.clone();
            let permission = permission.clone();
            let prompt_lock = prompt_lock.clone();
            handles.push(tokio::spawn(async move {
                cache.resolve("ambiguous.example.com", &s, &permission, &prompt_lock).await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), HostDecision::Allow);
        }
    }
}
