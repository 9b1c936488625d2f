//! Execution context: where and how commands run.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::{CommandResult, ExecutionId, OutputChunk};
use crate::backend::RemoteTarget;

/// Default execution timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// One line of a context's execution history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextRecord {
    pub id: ExecutionId,
    pub command: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub exit_code: i32,
}

/// Working directory, environment, remote target and history for
/// command executions.
///
/// Cloning (or [`fork`](Self::fork)) gives an independent working
/// directory and environment, so per-run overrides never leak between
/// concurrent executions. The history log is shared between a context
/// and its clones and is append-only.
#[derive(Clone)]
pub struct ExecutionContext {
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    remote: Option<RemoteTarget>,
    timeout: Duration,
    elevation_password: Option<String>,
    output_sink: Option<mpsc::Sender<OutputChunk>>,
    history: Arc<RwLock<Vec<ContextRecord>>>,
}

impl ExecutionContext {
    /// Create a new local context with default settings.
    pub fn new() -> Self {
        Self {
            working_dir: None,
            env: BTreeMap::new(),
            remote: None,
            timeout: DEFAULT_TIMEOUT,
            elevation_password: None,
            output_sink: None,
            history: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Per-execution copy with its own environment and shared history.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    pub fn with_cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Add multiple environment variables.
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Run commands on a remote host instead of locally.
    pub fn with_remote(mut self, target: RemoteTarget) -> Self {
        self.remote = Some(target);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Password handed to `sudo -S` on stdin for local elevated commands.
    pub fn with_elevation_password(mut self, password: impl Into<String>) -> Self {
        self.elevation_password = Some(password.into());
        self
    }

    /// Stream output chunks to `sink` while commands run.
    pub fn with_live_output(mut self, sink: mpsc::Sender<OutputChunk>) -> Self {
        self.output_sink = Some(sink);
        self
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn set_cwd(&mut self, dir: impl Into<PathBuf>) {
        self.working_dir = Some(dir.into());
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn remove_env(&mut self, key: &str) -> Option<String> {
        self.env.remove(key)
    }

    pub fn remote(&self) -> Option<&RemoteTarget> {
        self.remote.as_ref()
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Elevation password for the current target: the remote target's
    /// when running remotely, the context's otherwise.
    pub fn elevation_password(&self) -> Option<&str> {
        match &self.remote {
            Some(target) => target.elevation_password.as_deref(),
            None => self.elevation_password.as_deref(),
        }
    }

    pub fn output_sink(&self) -> Option<&mpsc::Sender<OutputChunk>> {
        self.output_sink.as_ref()
    }

    /// Append an execution to the shared history.
    pub fn record(&self, id: ExecutionId, command: impl Into<String>, result: &CommandResult) {
        let record = ContextRecord {
            id,
            command: command.into(),
            timestamp: Utc::now(),
            success: result.success(),
            exit_code: result.exit_code(),
        };
        if let Ok(mut history) = self.history.write() {
            history.push(record);
        }
    }

    /// Snapshot of the execution history, oldest first.
    pub fn history(&self) -> Vec<ContextRecord> {
        self.history.read().map(|h| h.clone()).unwrap_or_default()
    }

    pub fn last_record(&self) -> Option<ContextRecord> {
        self.history.read().ok().and_then(|h| h.last().cloned())
    }

    pub fn execution_count(&self) -> usize {
        self.history.read().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("remote", &self.remote)
            .field("timeout", &self.timeout)
            .field(
                "elevation_password",
                &self.elevation_password.as_ref().map(|_| "<redacted>"),
            )
            .field("live_output", &self.output_sink.is_some())
            .field("executions", &self.execution_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::parse_output;

    #[test]
    fn test_context_new() {
        let ctx = ExecutionContext::new();
        assert!(ctx.working_dir().is_none());
        assert!(ctx.env().is_empty());
        assert!(!ctx.is_remote());
        assert_eq!(ctx.timeout(), DEFAULT_TIMEOUT);
        assert_eq!(ctx.execution_count(), 0);
    }

    #[test]
    fn test_context_env() {
        let mut ctx = ExecutionContext::new().with_env("PATH", "/usr/bin");
        ctx.set_env("HOME", "/home/user");

        assert_eq!(ctx.get_env("PATH"), Some("/usr/bin"));
        assert_eq!(ctx.get_env("HOME"), Some("/home/user"));
        assert_eq!(ctx.remove_env("PATH"), Some("/usr/bin".to_string()));
        assert_eq!(ctx.get_env("PATH"), None);
    }

    #[test]
    fn test_fork_isolates_overrides() {
        let base = ExecutionContext::new().with_cwd("/srv").with_env("MODE", "base");
        let mut forked = base.fork();
        forked.set_env("MODE", "override");
        forked.set_cwd("/tmp");

        assert_eq!(base.get_env("MODE"), Some("base"));
        assert_eq!(base.working_dir(), Some(Path::new("/srv")));
        assert_eq!(forked.get_env("MODE"), Some("override"));
    }

    #[test]
    fn test_fork_shares_history() {
        let base = ExecutionContext::new();
        let forked = base.fork();

        forked.record(ExecutionId::from_raw(1), "true", &parse_output("true", "", 0, None));
        base.record(ExecutionId::from_raw(2), "false", &parse_output("false", "", 1, None));

        let history = base.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].command, "true");
        assert!(history[0].success);
        assert!(!history[1].success);
        assert_eq!(forked.last_record().unwrap().id, ExecutionId::from_raw(2));
    }

    #[test]
    fn test_debug_redacts_password() {
        let ctx = ExecutionContext::new().with_elevation_password("hunter2");
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("redacted"));
        assert_eq!(ctx.elevation_password(), Some("hunter2"));
    }
}
