//! Immutable command builder.

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use super::Violation;
use crate::error::CmdChainError;
use crate::execution::{CommandResult, ExecutionContext, ResultFormat, Runner, Step};
use crate::Result;

/// Program used as the privilege-escalation prefix.
pub const SUDO: &str = "sudo";

/// Value of a named parameter.
///
/// Parameters render as `--key value`. A `Bool(true)` renders as the bare
/// `--key` switch and `Bool(false)` is omitted entirely.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u16> for ParamValue {
    fn from(value: u16) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// An immutable description of a program invocation.
///
/// Every `with_*` / `add_*` method takes `&self` and returns a new
/// `Command`; the receiver is left untouched, so a base command can be
/// shared and specialised freely:
///
/// ```
/// use cmdchain::Command;
///
/// let ls = Command::new("ls");
/// let long = ls.with_option("-l").with_flag("-a");
///
/// assert_eq!(ls.build(), vec!["ls"]);
/// assert_eq!(long.command_line(), "ls -l -a");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    program: String,
    options: Vec<String>,
    flags: Vec<String>,
    params: Vec<(String, ParamValue)>,
    args: Vec<String>,
    requires_privilege: bool,
    format: ResultFormat,
    required_params: Vec<String>,
}

impl Command {
    /// Create a command for the given program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            options: Vec::new(),
            flags: Vec::new(),
            params: Vec::new(),
            args: Vec::new(),
            requires_privilege: false,
            format: ResultFormat::default(),
            required_params: Vec::new(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn requires_privilege(&self) -> bool {
        self.requires_privilege
    }

    pub fn format(&self) -> ResultFormat {
        self.format
    }

    /// Look up a parameter by key.
    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Parameters in insertion order.
    pub fn params(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Append an option token (e.g. `-l`).
    pub fn with_option(&self, option: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.options.push(option.into());
        next
    }

    /// Append a flag token (e.g. `-a`).
    pub fn with_flag(&self, flag: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.flags.push(flag.into());
        next
    }

    /// Set a named parameter.
    ///
    /// Setting a key that already exists replaces its value but keeps the
    /// original position, so `build()` output stays stable.
    pub fn with_param(&self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        let key = key.into();
        let value = value.into();
        let mut next = self.clone();
        match next.params.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => next.params.push((key, value)),
        }
        next
    }

    /// Mark the command as needing privilege escalation.
    pub fn with_sudo(&self) -> Self {
        let mut next = self.clone();
        next.requires_privilege = true;
        next
    }

    /// Append a positional argument.
    pub fn add_arg(&self, arg: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.args.push(arg.into());
        next
    }

    /// Append several positional arguments.
    pub fn add_args<I, S>(&self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut next = self.clone();
        next.args.extend(args.into_iter().map(Into::into));
        next
    }

    /// Declare a parameter that must be set before the command may run.
    pub fn require_param(&self, key: impl Into<String>) -> Self {
        let key = key.into();
        let mut next = self.clone();
        if !next.required_params.contains(&key) {
            next.required_params.push(key);
        }
        next
    }

    /// Choose how output is projected into structured rows.
    pub fn with_format(&self, format: ResultFormat) -> Self {
        let mut next = self.clone();
        next.format = format;
        next
    }

    /// Serialize into argv tokens.
    ///
    /// Order: `[sudo] program options flags params args`. The output depends
    /// only on the command's state.
    pub fn build(&self) -> Vec<String> {
        let mut tokens = Vec::with_capacity(
            2 + self.options.len() + self.flags.len() + self.params.len() * 2 + self.args.len(),
        );
        if self.requires_privilege {
            tokens.push(SUDO.to_string());
        }
        tokens.push(self.program.clone());
        tokens.extend(self.options.iter().cloned());
        tokens.extend(self.flags.iter().cloned());
        for (key, value) in &self.params {
            let switch = param_switch(key);
            match value {
                ParamValue::Bool(false) => {}
                ParamValue::Bool(true) => tokens.push(switch),
                other => {
                    tokens.push(switch);
                    tokens.push(other.to_string());
                }
            }
        }
        tokens.extend(self.args.iter().cloned());
        tokens
    }

    /// The built tokens joined into a single POSIX shell command line.
    pub fn command_line(&self) -> String {
        join_tokens(&self.build())
    }

    /// Check the command for inconsistencies.
    ///
    /// Returns an empty vector when the command may be executed.
    pub fn validate(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.program.trim().is_empty() {
            violations.push(Violation::new("program", "must not be empty"));
        } else if self.program.chars().any(|c| c.is_whitespace() || c == '\0') {
            violations.push(Violation::new(
                "program",
                "must not contain whitespace or NUL bytes",
            ));
        }

        for (field, parts) in [
            ("options", &self.options),
            ("flags", &self.flags),
            ("args", &self.args),
        ] {
            if parts.iter().any(|p| p.contains('\0')) {
                violations.push(Violation::new(field, "must not contain NUL bytes"));
            }
        }

        for (key, value) in &self.params {
            if key.trim().is_empty() {
                violations.push(Violation::new("params", "parameter key must not be empty"));
            } else if matches!(value, ParamValue::Text(s) if s.contains('\0')) {
                violations.push(Violation::new(key.as_str(), "must not contain NUL bytes"));
            }
        }

        for required in &self.required_params {
            if self.param(required).is_none() {
                violations.push(Violation::missing_param(required));
            }
        }

        violations
    }

    /// Like [`validate`](Self::validate), but as a `Result`.
    pub fn ensure_valid(&self) -> Result<()> {
        let violations = self.validate();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(CmdChainError::Validation { violations })
        }
    }

    /// Execute through the runner.
    ///
    /// An invalid command yields a failed result without touching any
    /// backend. `input` (the previous step of a pipe) is fed on stdin.
    pub async fn execute(
        &self,
        runner: &Runner,
        ctx: &ExecutionContext,
        input: Option<&CommandResult>,
    ) -> Result<CommandResult> {
        runner.run(self, ctx, input).await
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

#[async_trait]
impl Step for Command {
    async fn execute(
        &self,
        runner: &Runner,
        ctx: &ExecutionContext,
        input: Option<&CommandResult>,
    ) -> Result<CommandResult> {
        Command::execute(self, runner, ctx, input).await
    }

    fn describe(&self) -> String {
        self.command_line()
    }
}

fn param_switch(key: &str) -> String {
    if key.starts_with('-') {
        key.to_string()
    } else {
        format!("--{key}")
    }
}

/// Quote a token for a POSIX shell. Tokens made only of safe characters
/// are returned unchanged.
pub fn shell_quote(token: &str) -> Cow<'_, str> {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-+=:,./@%".contains(c);
    if !token.is_empty() && token.chars().all(safe) {
        Cow::Borrowed(token)
    } else {
        Cow::Owned(format!("'{}'", token.replace('\'', r"'\''")))
    }
}

/// Join argv tokens into one shell-safe command line.
pub fn join_tokens(tokens: &[String]) -> String {
    tokens
        .iter()
        .map(|t| shell_quote(t))
        .collect::<Vec<_>>()
        .join(" ")
}
