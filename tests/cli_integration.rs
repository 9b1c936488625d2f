//! CLI integration tests.
//!
//! These tests verify the CLI argument parsing, configuration loading and
//! the chain a command line turns into.

use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

use cmdchain::cli::{parse_args_from, Args};
use cmdchain::config::Config;
use cmdchain::{ExecutionContext, FailurePolicy, Link, Runner};

fn args(args: &[&str]) -> Vec<OsString> {
    std::iter::once("cmdchain")
        .chain(args.iter().copied())
        .map(OsString::from)
        .collect()
}

// ============================================================================
// CLI Argument Tests
// ============================================================================

#[test]
fn test_cli_defaults() {
    let result = parse_args_from(args(&["uptime"])).unwrap();

    assert!(result.config.is_none());
    assert!(result.host.is_none());
    assert!(result.timeout_secs.is_none());
    assert!(!result.live);
    assert!(!result.stop_on_failure);
    assert_eq!(result.stages.len(), 1);
}

#[test]
fn test_cli_full_options() {
    let result = parse_args_from(args(&[
        "-c",
        "/etc/cmdchain.json",
        "-l",
        "debug",
        "-H",
        "db1",
        "-u",
        "ops",
        "-t",
        "10",
        "--stop-on-failure",
        "df",
        "-h",
        ";",
        "free",
        "-m",
    ]))
    .unwrap();

    assert_eq!(result.config.unwrap().to_str().unwrap(), "/etc/cmdchain.json");
    assert_eq!(result.log_level.as_deref(), Some("debug"));
    assert_eq!(result.host.as_deref(), Some("db1"));
    assert_eq!(result.user.as_deref(), Some("ops"));
    assert_eq!(result.timeout_secs, Some(10));
    assert!(result.stop_on_failure);
    assert_eq!(result.stages[0].tokens, vec!["df", "-h"]);
    assert_eq!(result.stages[1].link, Some(Link::Then));
    assert_eq!(result.stages[1].tokens, vec!["free", "-m"]);
}

#[test]
fn test_cli_options_after_program_belong_to_program() {
    let result = parse_args_from(args(&["grep", "-v", "--count", "x", "|", "wc", "-l"])).unwrap();

    assert!(result.log_level.is_none());
    assert_eq!(result.stages[0].tokens, vec!["grep", "-v", "--count", "x"]);
    assert_eq!(result.stages[1].link, Some(Link::Pipe));
}

#[test]
fn test_cli_invalid_port() {
    let result = parse_args_from(args(&["-p", "not-a-number", "ls"]));
    assert!(result.is_err());
}

#[test]
fn test_cli_dangling_separator() {
    let result = parse_args_from(args(&["ls", "|"]));
    assert!(result.is_err());
}

#[test]
fn test_cli_chain_shape() {
    let parsed = parse_args_from(args(&["--stop-on-failure", "a", "|", "b", ";", "c"])).unwrap();
    let chain = parsed.to_chain();

    assert_eq!(chain.len(), 3);
    assert_eq!(chain.policy(), FailurePolicy::StopOnFailure);
    assert_eq!(chain.describe(), "a | b && c");
}

// ============================================================================
// Configuration Loading Tests
// ============================================================================

#[test]
fn test_config_from_json_file() {
    let json = r#"{
        "execution": {
            "default_timeout_secs": 90,
            "live_output": true
        },
        "cache": {
            "max_size": 25,
            "auto_refresh": true,
            "refresh_interval_secs": 15
        },
        "logging": {
            "level": "debug"
        }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let config = Config::from_file(file.path()).unwrap();

    assert_eq!(config.timeout(), Duration::from_secs(90));
    assert!(config.execution.live_output);
    let cache = config.cache_config();
    assert_eq!(cache.max_size, 25);
    assert!(cache.auto_refresh);
    assert_eq!(cache.refresh_interval, Duration::from_secs(15));
    assert_eq!(config.logging.level, "debug");
    assert!(config.remote.is_none());
}

#[test]
fn test_config_priority_cli_over_file() {
    let json = r#"{
        "execution": { "default_timeout_secs": 90 },
        "remote": { "host": "10.0.0.1", "user": "ops", "port": 2200 }
    }"#;

    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let args = Args {
        config: Some(file.path().to_path_buf()),
        timeout_secs: Some(3),
        host: Some("10.0.0.2".into()),
        ..Args::default()
    };

    let config = Config::load(&args).unwrap();

    assert_eq!(config.timeout(), Duration::from_secs(3));
    let target = config.remote_target().unwrap().unwrap();
    assert_eq!(target.key(), "ops@10.0.0.2:2200");
}

#[test]
fn test_config_missing_file() {
    let args = Args {
        config: Some("/definitely/not/here.json".into()),
        ..Args::default()
    };
    assert!(Config::load(&args).is_err());
}

// ============================================================================
// End-to-end
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_command_line_runs_pipeline() {
    let parsed = parse_args_from(args(&["printf", "b\\na\\n", "|", "sort"])).unwrap();
    let config = Config::load(&parsed).unwrap();
    let ctx = config.to_context().unwrap();

    let result = parsed
        .to_chain()
        .execute(&Runner::new(), &ctx)
        .await
        .unwrap()
        .unwrap();

    assert!(result.success());
    assert_eq!(result.raw_text(), "a\nb\n");
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_line_failure_exit_code() {
    let parsed = parse_args_from(args(&["sh", "-c", "exit 7"])).unwrap();
    let result = parsed
        .to_chain()
        .execute(&Runner::new(), &ExecutionContext::new())
        .await
        .unwrap()
        .unwrap();

    assert!(result.failed());
    assert_eq!(result.exit_code(), 7);
}
