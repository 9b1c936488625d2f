//! Error types for cmdchain.

use std::time::Duration;

use thiserror::Error;

use crate::command::Violation;

/// Main error type for cmdchain operations.
///
/// A command that ran and exited non-zero is *not* an error; it is a
/// [`CommandResult`](crate::CommandResult) with `success == false`. The
/// transport variants cover everything that prevented a command from
/// running to completion at all.
#[derive(Error, Debug)]
pub enum CmdChainError {
    /// Command state is inconsistent; nothing was executed.
    #[error("invalid command: {}", format_violations(.violations))]
    Validation { violations: Vec<Violation> },

    /// No constructor registered under the given name.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// A constructor is already registered under the given name.
    #[error("command already registered: {0}")]
    DuplicateCommand(String),

    /// Registry name or constructor output was rejected.
    #[error("invalid command name '{name}': {reason}")]
    InvalidCommandName { name: String, reason: String },

    /// The local process could not be spawned.
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// Could not establish the SSH transport.
    #[error("connection to {host} failed: {reason}")]
    Connect { host: String, reason: String },

    /// Every configured authentication method was rejected.
    #[error("authentication failed for {user}@{host}: {reason}")]
    Auth {
        user: String,
        host: String,
        reason: String,
    },

    /// An SSH channel failed while the command was running.
    #[error("channel error: {0}")]
    Channel(String),

    /// Command execution timeout.
    #[error("command execution timeout after {0:?}")]
    Timeout(Duration),

    /// Remote session with the given ID was not found.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Remote session with the given ID already exists.
    #[error("session already exists: {0}")]
    SessionExists(String),

    /// The cache refresh task is already running.
    #[error("cache refresh already running")]
    RefreshAlreadyRunning,

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A background task died unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CmdChainError {
    /// True for failures that prevented execution from happening or
    /// completing (spawn, connect, auth, channel, timeout, I/O).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::Connect { .. }
                | Self::Auth { .. }
                | Self::Channel(_)
                | Self::Timeout(_)
                | Self::Io(_)
        )
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convenience Result type for cmdchain operations.
pub type Result<T> = std::result::Result<T, CmdChainError>;
