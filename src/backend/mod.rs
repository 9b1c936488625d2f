//! Execution backends.
//!
//! A [`Backend`] turns built argv tokens into a real execution and reports
//! exit code, stdout and stderr. Two implementations are provided:
//!
//! - [`LocalBackend`]: a child process with timeout-based hard kill and
//!   optional live output streaming.
//! - [`RemoteBackend`]: named, persistent SSH sessions to one host.
//!
//! A non-zero exit is *data* ([`RawOutput::exit_code`]); only failures to
//! spawn, connect, authenticate or finish in time are errors.

mod local;
mod remote;
mod target;

pub use local::LocalBackend;
pub use remote::{remote_command_line, RemoteBackend, DEFAULT_SESSION};
pub use target::{AuthMethod, HostKeyPolicy, RemoteTarget, TransportOptions, DEFAULT_SSH_PORT};

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::command::SUDO;
use crate::execution::{ExecutionContext, OutputChunk};
use crate::Result;

/// Everything a backend needs for one execution.
#[derive(Clone)]
pub struct ExecRequest {
    /// Argv tokens; the first is the program.
    pub tokens: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Bytes written to the process's stdin, then closed.
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    /// Supplied to `sudo -S` through stdin, never through argv.
    pub elevation_password: Option<String>,
    /// Receives output chunks while the command runs.
    pub output_sink: Option<mpsc::Sender<OutputChunk>>,
}

impl ExecRequest {
    pub fn new(tokens: Vec<String>) -> Self {
        Self {
            tokens,
            working_dir: None,
            env: BTreeMap::new(),
            stdin: None,
            timeout: crate::execution::DEFAULT_TIMEOUT,
            elevation_password: None,
            output_sink: None,
        }
    }

    /// Request carrying the context's directory, environment, timeout,
    /// elevation password and output sink.
    pub fn from_context(tokens: Vec<String>, ctx: &ExecutionContext) -> Self {
        Self {
            tokens,
            working_dir: ctx.working_dir().map(PathBuf::from),
            env: ctx.env().clone(),
            stdin: None,
            timeout: ctx.timeout(),
            elevation_password: ctx.elevation_password().map(str::to_string),
            output_sink: ctx.output_sink().cloned(),
        }
    }

    pub fn with_stdin(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(data.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or_default()
    }

    /// Rewrite a `sudo` invocation to read the password from stdin.
    ///
    /// `sudo cmd` becomes `sudo -S -p '' cmd` and the password line is
    /// placed ahead of any other stdin payload. Requests without a `sudo`
    /// prefix or without a password are returned unchanged.
    pub fn into_elevated(mut self) -> Self {
        let Some(password) = self.elevation_password.take() else {
            return self;
        };
        if self.program() != SUDO {
            return self;
        }

        for (offset, flag) in ["-S", "-p", ""].into_iter().enumerate() {
            self.tokens.insert(1 + offset, flag.to_string());
        }

        let mut stdin = format!("{password}\n").into_bytes();
        if let Some(rest) = self.stdin.take() {
            stdin.extend_from_slice(&rest);
        }
        self.stdin = Some(stdin);
        self
    }
}

impl fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecRequest")
            .field("tokens", &self.tokens)
            .field("working_dir", &self.working_dir)
            .field("env", &self.env)
            .field("stdin_bytes", &self.stdin.as_ref().map(Vec::len))
            .field("timeout", &self.timeout)
            .field(
                "elevation_password",
                &self.elevation_password.as_ref().map(|_| "<redacted>"),
            )
            .field("live_output", &self.output_sink.is_some())
            .finish()
    }
}

/// What a backend observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Executes argv tokens somewhere.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run the request to completion.
    ///
    /// A non-zero exit code is returned as `Ok`; errors are reserved for
    /// transport failures and timeouts.
    async fn execute(&self, request: ExecRequest) -> Result<RawOutput>;

    /// Short label used in logs and result metadata.
    fn name(&self) -> String;
}
