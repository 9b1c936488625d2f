//! # cmdchain
//!
//! Build shell commands as immutable values, run them locally or over SSH,
//! compose them into pipelines and keep their results in a bounded cache.
//!
//! ## Features
//!
//! - **Immutable builders**: every [`Command`] mutator returns a new value
//! - **Local and SSH backends**: child processes with hard-kill timeouts,
//!   or persistent named SSH sessions
//! - **Chains**: sequential (`;`) and piped (`|`) steps with projection
//!   transforms (filter, sort, select, head, map)
//! - **Result cache**: FIFO-bounded, thread-safe, with history and an
//!   optional background refresh task
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cmdchain::{Chain, Command, ExecutionContext, ResultCache, Runner};
//!
//! #[tokio::main]
//! async fn main() -> cmdchain::Result<()> {
//!     cmdchain::logging::try_init().ok();
//!
//!     let cache = Arc::new(ResultCache::new(100));
//!     let runner = Runner::new().with_cache(Arc::clone(&cache));
//!     let ctx = ExecutionContext::new();
//!
//!     let chain = Chain::new(Command::new("echo").add_arg("foo"))
//!         .pipe(Command::new("cat"));
//!     if let Some(result) = chain.execute(&runner, &ctx).await? {
//!         println!("{}", result.raw_text());
//!     }
//!
//!     println!("{} results cached", cache.len());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod chain;
pub mod cli;
pub mod command;
pub mod config;
pub mod error;
pub mod execution;
pub mod logging;

// Re-export commonly used types
pub use backend::{AuthMethod, Backend, LocalBackend, RemoteBackend, RemoteTarget};
pub use cache::{CacheEntry, HistoryRecord, ResultCache};
pub use chain::{Chain, FailurePolicy, Link};
pub use command::{Command, CommandRegistry, ParamValue, Violation};
pub use error::{CmdChainError, Result};
pub use execution::{
    parse_output, parse_output_as, CommandResult, ExecutionContext, ExecutionId, ResultFormat,
    Runner, Step,
};
