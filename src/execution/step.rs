//! The executable-unit abstraction shared by commands and chains.

use async_trait::async_trait;

use super::{CommandResult, ExecutionContext, Runner};
use crate::Result;

/// Something that can be run to produce a [`CommandResult`].
///
/// Implemented by [`Command`](crate::Command) and
/// [`Chain`](crate::Chain), so a chain can contain other chains.
#[async_trait]
pub trait Step: Send + Sync {
    /// Run the step. `input` is the previous step's result when the step
    /// is piped; its raw text is fed on stdin.
    async fn execute(
        &self,
        runner: &Runner,
        ctx: &ExecutionContext,
        input: Option<&CommandResult>,
    ) -> Result<CommandResult>;

    /// Human-readable one-line description.
    fn describe(&self) -> String;
}
