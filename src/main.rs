//! cmdchain binary entry point.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use cmdchain::cli::{self, Args};
use cmdchain::config::Config;
use cmdchain::execution::{OutputChunk, OutputSource, NOT_EXECUTED_EXIT_CODE};
use cmdchain::{logging, CmdChainError, CommandResult, ResultCache, Runner};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Exit status for usage errors.
const EXIT_USAGE: u8 = 2;

/// Exit status when a command timed out, as `timeout(1)` reports it.
const EXIT_TIMEOUT: u8 = 124;

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run 'cmdchain --help' for usage");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }
    if args.stages.is_empty() {
        eprintln!("error: no command given");
        eprintln!("Run 'cmdchain --help' for usage");
        return ExitCode::from(EXIT_USAGE);
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    // A subscriber may already be installed when embedded; that is fine.
    let _ = logging::init_with_filter(config.log_filter());
    info!("cmdchain v{}", env!("CARGO_PKG_VERSION"));

    match run(&args, &config).await {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(RunError::Config(e)) => {
            eprintln!("error: {e}");
            ExitCode::from(EXIT_USAGE)
        }
        Err(RunError::Exec(e)) => {
            eprintln!("error: {e}");
            if matches!(e, CmdChainError::Timeout(_)) {
                ExitCode::from(EXIT_TIMEOUT)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

enum RunError {
    Config(cmdchain::config::ConfigError),
    Exec(CmdChainError),
}

/// Run the command line and print the final result. Returns its exit code.
async fn run(args: &Args, config: &Config) -> Result<i32, RunError> {
    let mut ctx = config.to_context().map_err(RunError::Config)?;

    let live = config.execution.live_output;
    let printer = if live {
        let (tx, rx) = mpsc::channel(64);
        ctx = ctx.with_live_output(tx);
        Some(tokio::spawn(print_chunks(rx)))
    } else {
        None
    };

    let cache = Arc::new(ResultCache::with_config(config.cache_config()));
    let runner = Runner::new().with_cache(Arc::clone(&cache));
    let refresher = runner.refresher(&ctx).map_err(RunError::Exec)?;
    cache
        .start_auto_refresh(Arc::new(refresher))
        .map_err(RunError::Exec)?;

    let chain = args.to_chain();
    debug!(chain = %chain.describe(), remote = ctx.is_remote(), "running command line");

    let outcome = chain.execute(&runner, &ctx).await;
    cache.stop_refresh().await.map_err(RunError::Exec)?;

    // Closing the last sender lets the printer drain and exit.
    drop(ctx);
    if let Some(printer) = printer {
        let _ = printer.await;
    }

    let Some(result) = outcome.map_err(RunError::Exec)? else {
        return Ok(0);
    };
    debug!(cached = cache.len(), "command line finished");

    if !live {
        print!("{}", result.raw_text());
        let _ = std::io::stdout().flush();
    }
    if let Some(message) = diagnostic(&result, live) {
        eprint!("{message}");
        if !message.ends_with('\n') {
            eprintln!();
        }
    }
    Ok(result.exit_code())
}

/// Message to print on stderr after the run. Live mode already streamed
/// stderr, so only commands that never ran are reported there.
fn diagnostic(result: &CommandResult, live: bool) -> Option<&str> {
    if live && result.exit_code() != NOT_EXECUTED_EXIT_CODE {
        return None;
    }
    result.error_message()
}

async fn print_chunks(mut rx: mpsc::Receiver<OutputChunk>) {
    while let Some(chunk) = rx.recv().await {
        match chunk.source {
            OutputSource::Stdout => {
                let mut out = std::io::stdout();
                let _ = out.write_all(&chunk.raw);
                let _ = out.flush();
            }
            OutputSource::Stderr => {
                let _ = std::io::stderr().write_all(&chunk.raw);
            }
        }
    }
}
