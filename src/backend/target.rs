//! Remote target configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One way of authenticating to the SSH server.
///
/// A target carries an ordered list of these; they are tried in turn
/// until the server accepts one.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    /// Keys offered by the running SSH agent (`SSH_AUTH_SOCK`).
    Agent,
    /// OpenSSH certificate paired with its private key.
    Certificate {
        key_path: PathBuf,
        cert_path: PathBuf,
        passphrase: Option<String>,
    },
    /// Kerberos via GSSAPI. Not offered by the SSH transport; attempts
    /// are reported and skipped.
    Gssapi,
}

impl AuthMethod {
    /// Method name as used in logs and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::KeyFile { .. } => "key",
            Self::Agent => "agent",
            Self::Certificate { .. } => "certificate",
            Self::Gssapi => "gssapi",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
            Self::Agent => f.write_str("Agent"),
            Self::Certificate {
                key_path,
                cert_path,
                ..
            } => f
                .debug_struct("Certificate")
                .field("key_path", key_path)
                .field("cert_path", cert_path)
                .finish(),
            Self::Gssapi => f.write_str("Gssapi"),
        }
    }
}

/// How the server's host key is checked against `~/.ssh/known_hosts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Key must already be known.
    Strict,
    /// Unknown hosts are learned on first use; changed keys are refused.
    #[default]
    AcceptNew,
    /// No verification.
    AcceptAny,
}

/// Per-connection transport overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub inactivity_timeout: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            inactivity_timeout: None,
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

/// Where remote commands run and how to get there.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub auth: Vec<AuthMethod>,
    pub transport: TransportOptions,
    /// Run every command through `sudo`.
    pub use_elevated: bool,
    /// Secondary password for `sudo`, sent on stdin.
    pub elevation_password: Option<String>,
}

impl RemoteTarget {
    /// Target on the default port with no authentication methods yet.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: DEFAULT_SSH_PORT,
            auth: Vec::new(),
            transport: TransportOptions::default(),
            use_elevated: false,
            elevation_password: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_auth(mut self, method: AuthMethod) -> Self {
        self.auth.push(method);
        self
    }

    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.with_auth(AuthMethod::Password(password.into()))
    }

    pub fn with_key_file(self, path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        self.with_auth(AuthMethod::KeyFile {
            path: path.into(),
            passphrase,
        })
    }

    pub fn with_agent(self) -> Self {
        self.with_auth(AuthMethod::Agent)
    }

    pub fn with_certificate(
        self,
        key_path: impl Into<PathBuf>,
        cert_path: impl Into<PathBuf>,
    ) -> Self {
        self.with_auth(AuthMethod::Certificate {
            key_path: key_path.into(),
            cert_path: cert_path.into(),
            passphrase: None,
        })
    }

    pub fn with_gssapi(self) -> Self {
        self.with_auth(AuthMethod::Gssapi)
    }

    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    /// Elevate every command; `password` (if any) feeds `sudo -S`.
    pub fn with_elevation(mut self, password: Option<String>) -> Self {
        self.use_elevated = true;
        self.elevation_password = password;
        self
    }

    /// `user@host:port`, used to key backends and sessions.
    pub fn key(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("auth", &self.auth)
            .field("transport", &self.transport)
            .field("use_elevated", &self.use_elevated)
            .field(
                "elevation_password",
                &self.elevation_password.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}
