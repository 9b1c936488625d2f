//! SSH backend with named, persistent sessions.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Handler};
use russh::keys::known_hosts::{check_known_hosts, learn_known_hosts};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{load_openssh_certificate, load_secret_key, HashAlg, PublicKey};
use russh::ChannelMsg;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::target::{AuthMethod, HostKeyPolicy, RemoteTarget};
use super::{Backend, ExecRequest, RawOutput};
use crate::command::{join_tokens, shell_quote};
use crate::error::CmdChainError;
use crate::execution::OutputChunk;
use crate::Result;

/// Session used when none has been selected.
pub const DEFAULT_SESSION: &str = "default";

/// Exit code reported when the server closes a channel without a status.
const MISSING_EXIT_STATUS: i32 = 255;

/// Render argv plus working directory and environment as one remote
/// shell line: `cd <dir> && env K=V ... <cmd>`.
pub fn remote_command_line(
    tokens: &[String],
    working_dir: Option<&Path>,
    env: &BTreeMap<String, String>,
) -> String {
    let mut line = String::new();
    if let Some(dir) = working_dir {
        line.push_str("cd ");
        line.push_str(&shell_quote(&dir.to_string_lossy()));
        line.push_str(" && ");
    }
    if !env.is_empty() {
        line.push_str("env");
        for (key, value) in env {
            line.push(' ');
            line.push_str(&shell_quote(&format!("{key}={value}")));
        }
        line.push(' ');
    }
    line.push_str(&join_tokens(tokens));
    line
}

/// Host key verification against `~/.ssh/known_hosts`.
struct HostKeyCheck {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        if self.policy == HostKeyPolicy::AcceptAny {
            warn!(host = %self.host, %fingerprint, "host key verification disabled");
            return Ok(true);
        }

        match check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) if self.policy == HostKeyPolicy::AcceptNew => {
                warn!(host = %self.host, %fingerprint, "learning new host key");
                if let Err(e) = learn_known_hosts(&self.host, self.port, server_public_key) {
                    warn!(host = %self.host, error = %e, "could not record host key");
                }
                Ok(true)
            }
            Ok(false) => {
                error!(host = %self.host, %fingerprint, "unknown host key");
                Ok(false)
            }
            Err(e) => {
                error!(
                    host = %self.host,
                    %fingerprint,
                    error = %e,
                    "host key verification failed"
                );
                Ok(false)
            }
        }
    }
}

/// One authenticated SSH connection.
struct SshSession {
    handle: Handle<HostKeyCheck>,
}

impl SshSession {
    async fn connect(target: &RemoteTarget) -> Result<Self> {
        let transport = &target.transport;
        let config = Arc::new(Config {
            inactivity_timeout: transport.inactivity_timeout,
            keepalive_interval: transport.keepalive_interval,
            keepalive_max: transport.keepalive_max,
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: target.host.clone(),
            port: target.port,
            policy: transport.host_key_policy,
        };

        let connect_err = |reason: String| CmdChainError::Connect {
            host: target.host.clone(),
            reason,
        };
        let addr = (target.host.as_str(), target.port);
        let mut handle = timeout(transport.connect_timeout, client::connect(config, addr, handler))
            .await
            .map_err(|_| {
                connect_err(format!(
                    "connection timeout after {:?}",
                    transport.connect_timeout
                ))
            })?
            .map_err(|e| connect_err(e.to_string()))?;

        authenticate(&mut handle, target).await?;
        info!(target = %target.key(), "SSH session established");
        Ok(Self { handle })
    }

    async fn exec(&self, line: &str, request: &ExecRequest) -> Result<RawOutput> {
        let start = Instant::now();
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| CmdChainError::Channel(format!("failed to open channel: {e}")))?;

        channel
            .exec(true, line)
            .await
            .map_err(|e| CmdChainError::Channel(format!("failed to execute command: {e}")))?;

        if let Some(data) = &request.stdin {
            channel
                .data(&data[..])
                .await
                .map_err(|e| CmdChainError::Channel(format!("failed to write stdin: {e}")))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| CmdChainError::Channel(format!("failed to close stdin: {e}")))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        // ExitStatus may arrive before or after Eof; read until the channel closes.
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    stdout.extend_from_slice(&data);
                    forward(request, OutputChunk::stdout(data.to_vec())).await;
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    stderr.extend_from_slice(&data);
                    forward(request, OutputChunk::stderr(data.to_vec())).await;
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    exit_code = Some(i32::try_from(exit_status).unwrap_or(MISSING_EXIT_STATUS));
                }
                _ => {}
            }
        }

        Ok(RawOutput {
            exit_code: exit_code.unwrap_or(MISSING_EXIT_STATUS),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            duration: start.elapsed(),
        })
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(error = %e, "disconnect failed");
        }
    }
}

async fn forward(request: &ExecRequest, chunk: OutputChunk) {
    if let Some(sink) = &request.output_sink {
        let _ = sink.send(chunk).await;
    }
}

/// Try each configured method in order until the server accepts one.
async fn authenticate(handle: &mut Handle<HostKeyCheck>, target: &RemoteTarget) -> Result<()> {
    let mut failures = Vec::new();

    for method in &target.auth {
        match try_method(handle, &target.user, method).await {
            Ok(true) => {
                debug!(target = %target.key(), method = method.kind(), "authenticated");
                return Ok(());
            }
            Ok(false) => failures.push(format!("{}: rejected", method.kind())),
            Err(reason) => failures.push(format!("{}: {reason}", method.kind())),
        }
        warn!(target = %target.key(), method = method.kind(), "authentication method failed");
    }

    let reason = if failures.is_empty() {
        "no authentication methods configured".to_string()
    } else {
        failures.join("; ")
    };
    Err(CmdChainError::Auth {
        user: target.user.clone(),
        host: target.host.clone(),
        reason,
    })
}

/// `Ok(false)` means the server refused; `Err` means the attempt could not
/// be made at all.
async fn try_method(
    handle: &mut Handle<HostKeyCheck>,
    user: &str,
    method: &AuthMethod,
) -> std::result::Result<bool, String> {
    match method {
        AuthMethod::Password(password) => handle
            .authenticate_password(user, password)
            .await
            .map(|r| r.success())
            .map_err(|e| e.to_string()),
        AuthMethod::KeyFile { path, passphrase } => {
            let key = load_secret_key(expand_tilde(path), passphrase.as_deref())
                .map_err(|e| format!("{}: {e}", path.display()))?;
            let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map(|r| r.success())
                .map_err(|e| e.to_string())
        }
        AuthMethod::Certificate {
            key_path,
            cert_path,
            passphrase,
        } => {
            let key = load_secret_key(expand_tilde(key_path), passphrase.as_deref())
                .map_err(|e| format!("{}: {e}", key_path.display()))?;
            let cert = load_openssh_certificate(expand_tilde(cert_path))
                .map_err(|e| format!("{}: {e}", cert_path.display()))?;
            handle
                .authenticate_openssh_cert(user, Arc::new(key), cert)
                .await
                .map(|r| r.success())
                .map_err(|e| e.to_string())
        }
        AuthMethod::Agent => agent_auth(handle, user).await,
        AuthMethod::Gssapi => Err("not supported by the SSH transport".to_string()),
    }
}

#[cfg(unix)]
async fn agent_auth(
    handle: &mut Handle<HostKeyCheck>,
    user: &str,
) -> std::result::Result<bool, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("agent connection failed: {e}"))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("failed to list agent identities: {e}"))?;

    for public_key in &identities {
        let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
        match handle
            .authenticate_publickey_with(user, public_key.clone(), hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(e) => debug!(error = %e, "agent identity failed"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn agent_auth(
    _handle: &mut Handle<HostKeyCheck>,
    _user: &str,
) -> std::result::Result<bool, String> {
    Err("SSH agent not supported on this platform".to_string())
}

fn expand_tilde(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// Runs commands over SSH on one [`RemoteTarget`].
///
/// Commands go to the active session, [`DEFAULT_SESSION`] unless switched.
/// Sessions connect on creation (the default one on first use) and stay
/// open until closed, timed out or the backend is dropped.
pub struct RemoteBackend {
    target: RemoteTarget,
    sessions: Mutex<HashMap<String, Arc<SshSession>>>,
    active: RwLock<String>,
}

impl RemoteBackend {
    pub fn new(target: RemoteTarget) -> Self {
        Self {
            target,
            sessions: Mutex::new(HashMap::new()),
            active: RwLock::new(DEFAULT_SESSION.to_string()),
        }
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Open a new named session.
    pub async fn create_session(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(id) {
            return Err(CmdChainError::SessionExists(id.to_string()));
        }
        let session = SshSession::connect(&self.target).await?;
        sessions.insert(id.to_string(), Arc::new(session));
        Ok(())
    }

    /// Make `id` the session used by subsequent commands.
    pub async fn switch_session(&self, id: &str) -> Result<()> {
        if id != DEFAULT_SESSION && !self.sessions.lock().await.contains_key(id) {
            return Err(CmdChainError::SessionNotFound(id.to_string()));
        }
        *self.active.write().map_err(|_| CmdChainError::LockPoisoned)? = id.to_string();
        Ok(())
    }

    /// Disconnect and forget a session. Closing the active session makes
    /// [`DEFAULT_SESSION`] active again.
    pub async fn close_session(&self, id: &str) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| CmdChainError::SessionNotFound(id.to_string()))?;
        session.disconnect().await;

        let mut active = self.active.write().map_err(|_| CmdChainError::LockPoisoned)?;
        if *active == id {
            *active = DEFAULT_SESSION.to_string();
        }
        Ok(())
    }

    pub fn active_session(&self) -> Result<String> {
        self.active
            .read()
            .map(|a| a.clone())
            .map_err(|_| CmdChainError::LockPoisoned)
    }

    /// Names of open sessions, sorted.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Active session, connecting it first if it is the default one.
    async fn session(&self, id: &str) -> Result<Arc<SshSession>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(id) {
            return Ok(Arc::clone(session));
        }
        if id != DEFAULT_SESSION {
            return Err(CmdChainError::SessionNotFound(id.to_string()));
        }
        let session = Arc::new(SshSession::connect(&self.target).await?);
        sessions.insert(id.to_string(), Arc::clone(&session));
        Ok(session)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn execute(&self, request: ExecRequest) -> Result<RawOutput> {
        let request = request.into_elevated();
        let id = self.active_session()?;
        let session = self.session(&id).await?;
        let line =
            remote_command_line(&request.tokens, request.working_dir.as_deref(), &request.env);
        debug!(
            target = %self.target.key(),
            session = %id,
            program = request.program(),
            "executing remote command"
        );

        match timeout(request.timeout, session.exec(&line, &request)).await {
            Ok(output) => output,
            Err(_) => {
                warn!(
                    target = %self.target.key(),
                    session = %id,
                    timeout = ?request.timeout,
                    "remote command timed out, dropping session"
                );
                session.disconnect().await;
                let mut sessions = self.sessions.lock().await;
                if sessions.get(&id).is_some_and(|s| Arc::ptr_eq(s, &session)) {
                    sessions.remove(&id);
                }
                Err(CmdChainError::Timeout(request.timeout))
            }
        }
    }

    fn name(&self) -> String {
        format!("ssh:{}", self.target.key())
    }
}

impl std::fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("target", &self.target)
            .field("active", &self.active_session().ok())
            .finish()
    }
}
