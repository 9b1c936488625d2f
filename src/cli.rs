//! Command-line interface for cmdchain.
//!
//! Options come first; the first positional argument starts the command
//! line, and everything after it is taken verbatim. Literal `|` and `;`
//! arguments split it into piped and sequential stages.
//!
//! Uses lexopt for minimal binary size overhead (~34KB).

use std::ffi::OsString;
use std::path::PathBuf;

use crate::chain::{Chain, FailurePolicy, Link};
use crate::command::Command;

/// Pipe separator argument.
pub const PIPE: &str = "|";

/// Sequence separator argument.
pub const THEN: &str = ";";

/// One command of the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    /// `None` for the first stage.
    pub link: Option<Link>,
    pub tokens: Vec<String>,
}

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Remote host; commands run over SSH when set.
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Private key file for SSH.
    pub identity: Option<PathBuf>,
    /// Per-command timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Run every stage through sudo.
    pub sudo: bool,
    /// Stream output while commands run.
    pub live: bool,
    /// Stop at the first failed stage.
    pub stop_on_failure: bool,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
    pub stages: Vec<Stage>,
}

impl Args {
    /// Chain running the stages in order.
    pub fn to_chain(&self) -> Chain {
        let mut chain = Chain::empty();
        for stage in &self.stages {
            let Some((program, rest)) = stage.tokens.split_first() else {
                continue;
            };
            let mut cmd = Command::new(program.as_str()).add_args(rest.iter().cloned());
            if self.sudo {
                cmd = cmd.with_sudo();
            }
            chain = match stage.link {
                Some(Link::Pipe) => chain.pipe(cmd),
                _ => chain.then(cmd),
            };
        }
        if self.stop_on_failure {
            chain = chain.with_policy(FailurePolicy::StopOnFailure);
        }
        chain
    }
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Short('H') | Long("host") => {
                result.host = Some(parser.value()?.parse()?);
            }
            Short('u') | Long("user") => {
                result.user = Some(parser.value()?.parse()?);
            }
            Short('p') | Long("port") => {
                let value: String = parser.value()?.parse()?;
                result.port = Some(
                    value
                        .parse()
                        .map_err(|_| ArgsError::InvalidValue("port", value))?,
                );
            }
            Short('i') | Long("identity") => {
                result.identity = Some(parser.value()?.parse()?);
            }
            Short('t') | Long("timeout") => {
                let value: String = parser.value()?.parse()?;
                result.timeout_secs = Some(
                    value
                        .parse::<u64>()
                        .ok()
                        .filter(|secs| *secs > 0)
                        .ok_or(ArgsError::InvalidValue("timeout", value))?,
                );
            }
            Long("sudo") => {
                result.sudo = true;
            }
            Long("live") => {
                result.live = true;
            }
            Long("stop-on-failure") => {
                result.stop_on_failure = true;
            }
            Value(first) => {
                let mut words = vec![first.string()?];
                for raw in parser.raw_args()? {
                    words.push(raw.into_string().map_err(lexopt::Error::NonUnicodeValue)?);
                }
                result.stages = split_stages(words)?;
                break;
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

/// Split words on `|` and `;` separators.
pub fn split_stages(words: Vec<String>) -> Result<Vec<Stage>, ArgsError> {
    let mut stages = Vec::new();
    let mut current = Stage {
        link: None,
        tokens: Vec::new(),
    };

    for word in words {
        let link = match word.as_str() {
            PIPE => Link::Pipe,
            THEN => Link::Then,
            _ => {
                current.tokens.push(word);
                continue;
            }
        };
        if current.tokens.is_empty() {
            return Err(ArgsError::EmptyStage(word));
        }
        let next = Stage {
            link: Some(link),
            tokens: Vec::new(),
        };
        stages.push(std::mem::replace(&mut current, next));
    }

    if !current.tokens.is_empty() {
        stages.push(current);
    } else if let Some(link) = current.link {
        let separator = match link {
            Link::Pipe => PIPE,
            Link::Then => THEN,
        };
        return Err(ArgsError::EmptyStage(separator.to_string()));
    }
    Ok(stages)
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"cmdchain {version}
Run commands locally or over SSH, piped or in sequence

USAGE:
    cmdchain [OPTIONS] <PROGRAM> [ARGS]... [ '|' <PROGRAM> [ARGS]... ] [ ';' ... ]

OPTIONS:
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
    -H, --host <HOST>       Run on this host over SSH
    -u, --user <USER>       SSH user
    -p, --port <PORT>       SSH port [default: 22]
    -i, --identity <FILE>   SSH private key file
    -t, --timeout <SECS>    Per-command timeout [default: 30]
        --sudo              Run every command through sudo
        --live              Stream output while commands run
        --stop-on-failure   Stop at the first failed command
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    CMDCHAIN_TIMEOUT        Timeout in seconds (overrides config)
    CMDCHAIN_CACHE_SIZE     Result cache size (overrides config)
    CMDCHAIN_REMOTE_HOST    Remote host (overrides config)
    CMDCHAIN_REMOTE_USER    Remote user (overrides config)
    CMDCHAIN_LOG_LEVEL      Log level (overrides config)
    RUST_LOG                Alternative log level setting

EXAMPLES:
    # Pipe two local commands (quote the separator for your shell)
    cmdchain echo hello '|' tr a-z A-Z

    # Run in sequence on a remote host, stopping on the first failure
    cmdchain -H db1 -u ops --stop-on-failure systemctl status nginx ';' df -h
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("cmdchain {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// A separator with no command on one side.
    EmptyStage(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid value for --{}: '{}'", name, value)
            }
            Self::EmptyStage(separator) => {
                write!(f, "missing command next to '{}'", separator)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("cmdchain")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    fn words(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_args() {
        let result = parse_args_from(args(&[])).unwrap();
        assert!(result.stages.is_empty());
        assert!(result.host.is_none());
        assert!(!result.sudo);
    }

    #[test]
    fn test_options_then_command() {
        let result = parse_args_from(args(&["-t", "5", "--live", "ls", "-l", "/tmp"])).unwrap();
        assert_eq!(result.timeout_secs, Some(5));
        assert!(result.live);
        assert_eq!(result.stages.len(), 1);
        assert_eq!(result.stages[0].tokens, words(&["ls", "-l", "/tmp"]));
    }

    #[test]
    fn test_remote_options() {
        let result = parse_args_from(args(&[
            "-H", "db1", "-u", "ops", "-p", "2222", "-i", "~/.ssh/id_ed25519", "--sudo", "uptime",
        ]))
        .unwrap();
        assert_eq!(result.host.as_deref(), Some("db1"));
        assert_eq!(result.user.as_deref(), Some("ops"));
        assert_eq!(result.port, Some(2222));
        assert_eq!(result.identity, Some(PathBuf::from("~/.ssh/id_ed25519")));
        assert!(result.sudo);
    }

    #[test]
    fn test_pipe_and_then() {
        let result = parse_args_from(args(&["echo", "foo", "|", "cat", ";", "ls"])).unwrap();
        let links: Vec<_> = result.stages.iter().map(|s| s.link).collect();
        assert_eq!(links, vec![None, Some(Link::Pipe), Some(Link::Then)]);
        assert_eq!(result.to_chain().describe(), "echo foo | cat ; ls");
    }

    #[test]
    fn test_chain_flags() {
        let result =
            parse_args_from(args(&["--sudo", "--stop-on-failure", "a", ";", "b"])).unwrap();
        let chain = result.to_chain();
        assert_eq!(chain.policy(), FailurePolicy::StopOnFailure);
        assert_eq!(chain.describe(), "sudo a && sudo b");
    }

    #[test]
    fn test_empty_stage() {
        assert!(matches!(
            split_stages(words(&["ls", "|"])),
            Err(ArgsError::EmptyStage(_))
        ));
        assert!(matches!(
            split_stages(words(&["ls", ";", ";", "pwd"])),
            Err(ArgsError::EmptyStage(_))
        ));
        assert!(matches!(
            parse_args_from(args(&["|", "ls"])),
            Err(ArgsError::EmptyStage(_))
        ));
    }

    #[test]
    fn test_help_and_version() {
        assert!(parse_args_from(args(&["-h"])).unwrap().help);
        assert!(parse_args_from(args(&["--version"])).unwrap().version);
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse_args_from(args(&["-p", "invalid", "ls"])).is_err());
        assert!(parse_args_from(args(&["-t", "0", "ls"])).is_err());
        assert!(parse_args_from(args(&["--bogus", "ls"])).is_err());
    }
}
