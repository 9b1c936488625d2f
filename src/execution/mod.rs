//! Command execution engine.
//!
//! This module provides:
//! - [`ExecutionContext`]: working directory, environment, remote target
//!   and shared execution history
//! - [`Runner`]: resolves a backend from the context and records results
//! - [`CommandResult`] and output projection ([`parse_output`])
//! - [`Step`]: the unit both commands and chains implement
//!
//! # Example
//!
//! ```no_run
//! use cmdchain::{Command, ExecutionContext, Runner};
//!
//! # async fn demo() -> cmdchain::Result<()> {
//! let runner = Runner::new();
//! let ctx = ExecutionContext::new().with_cwd("/tmp");
//! let result = Command::new("ls").with_option("-l").execute(&runner, &ctx, None).await?;
//! for row in result.projection() {
//!     println!("{row}");
//! }
//! # Ok(())
//! # }
//! ```

mod context;
mod id;
mod result;
mod runner;
mod step;

pub use context::{ContextRecord, ExecutionContext, DEFAULT_TIMEOUT};
pub use id::ExecutionId;
pub use result::{
    parse_output, parse_output_as, CommandResult, OutputChunk, OutputSource, ResultFormat,
    NOT_EXECUTED_EXIT_CODE,
};
pub use runner::{BackendRefresher, Runner};
pub use step::Step;
