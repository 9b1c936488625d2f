//! Configuration management for cmdchain.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{HostKeyPolicy, RemoteTarget, DEFAULT_SSH_PORT};
use crate::cache::{CacheConfig, DEFAULT_MAX_SIZE};
use crate::cli::Args;
use crate::execution::{ExecutionContext, DEFAULT_TIMEOUT};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub execution: ExecutionSection,
    pub cache: CacheSection,
    pub logging: LoggingSection,
    /// Commands run over SSH when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSection>,
}

/// Execution configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Per-command timeout in seconds.
    pub default_timeout_secs: u64,
    /// Stream output while commands run.
    pub live_output: bool,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            live_output: false,
        }
    }
}

/// Result cache configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub max_size: usize,
    pub auto_refresh: bool,
    pub refresh_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            auto_refresh: false,
            refresh_interval_secs: 60,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Remote host configuration section.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub key_file: Option<PathBuf>,
    pub password: Option<String>,
    /// Offer SSH agent identities.
    pub agent: bool,
    /// Run every command through sudo.
    pub use_elevated: bool,
    /// Password for sudo; falls back to `password`.
    pub elevation_password: Option<String>,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            host: String::new(),
            user: String::new(),
            port: DEFAULT_SSH_PORT,
            key_file: None,
            password: None,
            agent: false,
            use_elevated: false,
            elevation_password: None,
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

impl std::fmt::Debug for RemoteSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSection")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("port", &self.port)
            .field("key_file", &self.key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("agent", &self.agent)
            .field("use_elevated", &self.use_elevated)
            .field("host_key_policy", &self.host_key_policy)
            .finish()
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(secs) = var("CMDCHAIN_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.execution.default_timeout_secs = secs;
        }

        if let Some(size) = var("CMDCHAIN_CACHE_SIZE").and_then(|v| v.parse().ok()) {
            self.cache.max_size = size;
        }

        if let Some(host) = var("CMDCHAIN_REMOTE_HOST").filter(|h| !h.is_empty()) {
            self.remote.get_or_insert_with(RemoteSection::default).host = host;
        }

        if let Some(user) = var("CMDCHAIN_REMOTE_USER").filter(|u| !u.is_empty()) {
            if let Some(remote) = self.remote.as_mut() {
                remote.user = user;
            }
        }

        if let Some(level) = var("CMDCHAIN_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(secs) = args.timeout_secs {
            self.execution.default_timeout_secs = secs;
        }

        if args.live {
            self.execution.live_output = true;
        }

        if let Some(ref host) = args.host {
            self.remote.get_or_insert_with(RemoteSection::default).host = host.clone();
        }

        if let Some(remote) = self.remote.as_mut() {
            if let Some(ref user) = args.user {
                remote.user = user.clone();
            }
            if let Some(port) = args.port {
                remote.port = port;
            }
            if let Some(ref identity) = args.identity {
                remote.key_file = Some(identity.clone());
            }
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        // Start with defaults
        let mut config = Config::default();

        // Load from config file if specified
        if let Some(ref path) = args.config {
            config = Config::from_file(path)?;
        }

        // Apply environment variable overrides
        config.apply_env();

        // Apply CLI argument overrides (highest priority)
        config.apply_args(args);

        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.execution.default_timeout_secs.max(1))
    }

    /// Execution context carrying the timeout and remote target.
    pub fn to_context(&self) -> Result<ExecutionContext, ConfigError> {
        let ctx = ExecutionContext::new().with_timeout(self.timeout());
        Ok(match self.remote_target()? {
            Some(target) => ctx.with_remote(target),
            None => ctx,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.cache.max_size,
            auto_refresh: self.cache.auto_refresh,
            refresh_interval: Duration::from_secs(self.cache.refresh_interval_secs),
        }
    }

    /// Remote target from the `remote` section.
    ///
    /// Authentication methods are tried as agent, key file, password. With
    /// none configured, the agent is used.
    pub fn remote_target(&self) -> Result<Option<RemoteTarget>, ConfigError> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        if remote.host.is_empty() {
            return Err(ConfigError::MissingRemoteField("host"));
        }
        if remote.user.is_empty() {
            return Err(ConfigError::MissingRemoteField("user"));
        }

        let mut target = RemoteTarget::new(&remote.host, &remote.user).with_port(remote.port);
        target.transport.host_key_policy = remote.host_key_policy;

        if remote.agent {
            target = target.with_agent();
        }
        if let Some(ref key_file) = remote.key_file {
            target = target.with_key_file(key_file, None);
        }
        if let Some(ref password) = remote.password {
            target = target.with_password(password);
        }
        if target.auth.is_empty() {
            target = target.with_agent();
        }

        if remote.use_elevated {
            let password = remote
                .elevation_password
                .clone()
                .or_else(|| remote.password.clone());
            target = target.with_elevation(password);
        }

        Ok(Some(target))
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Remote section without a required field.
    MissingRemoteField(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::MissingRemoteField(field) => write!(f, "remote {} is not set", field),
        }
    }
}

impl std::error::Error for ConfigError {}
