//! Sequential and piped composition of steps.
//!
//! A [`Chain`] runs its steps in order. A step linked with
//! [`pipe`](Chain::pipe) receives the previous result (its raw text on
//! stdin); one linked with [`then`](Chain::then) starts fresh. Transforms
//! registered on the chain are applied, in order, to the final result's
//! projection once every step has run.
//!
//! ```no_run
//! use cmdchain::{Chain, Command, ExecutionContext, Runner, ResultFormat};
//!
//! # async fn demo() -> cmdchain::Result<()> {
//! let chain = Chain::new(Command::new("ps").add_arg("aux").with_format(ResultFormat::Table))
//!     .sort_desc("%CPU")
//!     .select_columns(["PID", "%CPU", "COMMAND"])
//!     .head(5);
//! let top = chain.execute(&Runner::new(), &ExecutionContext::new()).await?;
//! # Ok(())
//! # }
//! ```

mod transform;

pub use transform::{RowMapper, RowPredicate, Transform};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::execution::{parse_output, CommandResult, ExecutionContext, Runner, Step};
use crate::Result;

/// How a step is connected to the one before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    /// Runs independently of the previous result.
    Then,
    /// Receives the previous result as input.
    Pipe,
}

/// What happens after a step fails (exits non-zero or fails validation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep going; the last step's result is the chain's result.
    #[default]
    Continue,
    /// Stop at the first failed step and return its result.
    StopOnFailure,
}

#[derive(Clone)]
struct ChainNode {
    step: Arc<dyn Step>,
    /// `None` for the first node.
    link: Option<Link>,
}

/// Ordered composition of steps plus projection transforms.
#[derive(Clone, Default)]
pub struct Chain {
    nodes: Vec<ChainNode>,
    policy: FailurePolicy,
    transforms: Vec<Transform>,
}

impl Chain {
    /// Chain starting with `first`.
    pub fn new(first: impl Step + 'static) -> Self {
        Self::empty().push(Arc::new(first), Link::Then)
    }

    /// Chain with no steps; executing it yields `None`.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Append a step that runs independently.
    pub fn then(self, next: impl Step + 'static) -> Self {
        self.push(Arc::new(next), Link::Then)
    }

    /// Append a step that receives the previous result as input.
    pub fn pipe(self, next: impl Step + 'static) -> Self {
        self.push(Arc::new(next), Link::Pipe)
    }

    /// Append an already shared step.
    pub fn push(mut self, step: Arc<dyn Step>, link: Link) -> Self {
        let link = (!self.nodes.is_empty()).then_some(link);
        self.nodes.push(ChainNode { step, link });
        self
    }

    pub fn stop_on_failure(self) -> Self {
        self.with_policy(FailurePolicy::StopOnFailure)
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn head(self, n: usize) -> Self {
        self.transform(Transform::Head(n))
    }

    pub fn filter<F>(self, pred: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.transform(Transform::Filter(Arc::new(pred)))
    }

    pub fn select_columns<I, S>(self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transform(Transform::SelectColumns(
            columns.into_iter().map(Into::into).collect(),
        ))
    }

    pub fn sort(self, key: impl Into<String>) -> Self {
        self.transform(Transform::Sort {
            key: key.into(),
            descending: false,
        })
    }

    pub fn sort_desc(self, key: impl Into<String>) -> Self {
        self.transform(Transform::Sort {
            key: key.into(),
            descending: true,
        })
    }

    pub fn map<F>(self, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform(Transform::Map(Arc::new(f)))
    }

    pub fn transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    /// Shell-like rendering, e.g. `echo foo | cat ; ls`. Sequential links
    /// render as `&&` under [`FailurePolicy::StopOnFailure`].
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            match node.link {
                None => {}
                Some(Link::Pipe) => out.push_str(" | "),
                Some(Link::Then) if self.policy == FailurePolicy::StopOnFailure => {
                    out.push_str(" && ")
                }
                Some(Link::Then) => out.push_str(" ; "),
            }
            out.push_str(&node.step.describe());
        }
        out
    }

    /// Run every step and return the final, transformed result.
    ///
    /// Returns `Ok(None)` for an empty chain. A transport error aborts the
    /// chain and is returned as `Err`.
    pub async fn execute(
        &self,
        runner: &Runner,
        ctx: &ExecutionContext,
    ) -> Result<Option<CommandResult>> {
        self.run(runner, ctx, None).await
    }

    async fn run(
        &self,
        runner: &Runner,
        ctx: &ExecutionContext,
        input: Option<&CommandResult>,
    ) -> Result<Option<CommandResult>> {
        let mut last: Option<CommandResult> = None;
        let mut steps = Vec::with_capacity(self.nodes.len());
        let mut skipped = 0;

        for (index, node) in self.nodes.iter().enumerate() {
            let step_input = match node.link {
                None => input,
                Some(Link::Pipe) => last.as_ref(),
                Some(Link::Then) => None,
            };
            let description = node.step.describe();
            debug!(index, step = %description, link = ?node.link, "running chain step");

            let result = node.step.execute(runner, ctx, step_input).await?;
            steps.push(json!({
                "index": index,
                "command": description,
                "link": node.link,
                "success": result.success(),
                "exit_code": result.exit_code(),
            }));

            let stop = result.failed() && self.policy == FailurePolicy::StopOnFailure;
            last = Some(result);
            if stop {
                skipped = self.nodes.len() - index - 1;
                debug!(index, skipped, "chain stopped on failure");
                break;
            }
        }

        let Some(result) = last else {
            return Ok(None);
        };

        let projection = self
            .transforms
            .iter()
            .fold(result.projection().to_vec(), |rows, t| t.apply(rows));
        let summary = json!({
            "total_commands": self.nodes.len(),
            "executed": steps.len(),
            "policy": self.policy,
            "transforms": self.transforms.iter().map(Transform::describe).collect::<Vec<_>>(),
            "steps": steps,
            "skipped": skipped,
        });

        Ok(Some(result.with_projection(projection).with_metadata("chain", summary)))
    }
}

/// A nested chain passes its input to its first step. An empty nested
/// chain passes its input through unchanged.
#[async_trait]
impl Step for Chain {
    async fn execute(
        &self,
        runner: &Runner,
        ctx: &ExecutionContext,
        input: Option<&CommandResult>,
    ) -> Result<CommandResult> {
        match self.run(runner, ctx, input).await? {
            Some(result) => Ok(result),
            None => Ok(input
                .cloned()
                .unwrap_or_else(|| parse_output("chain", "", 0, None))),
        }
    }

    fn describe(&self) -> String {
        format!("({})", Chain::describe(self))
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("steps", &Chain::describe(self))
            .field("policy", &self.policy)
            .field("transforms", &self.transforms)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ExecRequest, RawOutput};
    use crate::Command;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers by program name: `fail` exits 1, `cat` echoes stdin,
    /// anything else prints its arguments.
    #[derive(Default)]
    struct Echo {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Backend for Echo {
        async fn execute(&self, request: ExecRequest) -> Result<RawOutput> {
            self.calls.lock().unwrap().push(request.tokens.clone());
            let (exit_code, stdout) = match request.program() {
                "fail" => (1, String::new()),
                "cat" => (
                    0,
                    String::from_utf8_lossy(request.stdin.as_deref().unwrap_or_default())
                        .into_owned(),
                ),
                _ => (0, format!("{}\n", request.tokens[1..].join("\n"))),
            };
            Ok(RawOutput {
                exit_code,
                stdout,
                stderr: String::new(),
                duration: Duration::ZERO,
            })
        }

        fn name(&self) -> String {
            "echo".into()
        }
    }

    fn setup() -> (Arc<Echo>, Runner) {
        let backend = Arc::new(Echo::default());
        let runner = Runner::with_local_backend(backend.clone());
        (backend, runner)
    }

    fn programs(backend: &Echo) -> Vec<String> {
        backend.calls.lock().unwrap().iter().map(|t| t[0].clone()).collect()
    }

    #[tokio::test]
    async fn test_empty_chain_is_none() {
        let (_, runner) = setup();
        let chain = Chain::empty();
        assert!(chain.is_empty());
        assert!(chain.execute(&runner, &ExecutionContext::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pipe_feeds_previous_output() {
        let (_, runner) = setup();
        let chain = Chain::new(Command::new("echo").add_arg("foo")).pipe(Command::new("cat"));

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert!(result.raw_text().contains("foo"));
    }

    #[tokio::test]
    async fn test_then_does_not_feed_output() {
        let (_, runner) = setup();
        let chain = Chain::new(Command::new("echo").add_arg("foo")).then(Command::new("cat"));

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert_eq!(result.raw_text(), "");
    }

    #[tokio::test]
    async fn test_continue_runs_past_failure() {
        let (backend, runner) = setup();
        let chain = Chain::new(Command::new("fail"))
            .then(Command::new("echo").add_arg("after"));

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert!(result.success());
        assert_eq!(programs(&backend), vec!["fail", "echo"]);
        assert_eq!(result.metadata_value("chain").unwrap()["skipped"], 0);
    }

    #[tokio::test]
    async fn test_stop_on_failure() {
        let (backend, runner) = setup();
        let chain = Chain::new(Command::new("echo").add_arg("a"))
            .then(Command::new("fail"))
            .then(Command::new("echo").add_arg("never"))
            .stop_on_failure();

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert!(result.failed());
        assert_eq!(programs(&backend), vec!["echo", "fail"]);

        let meta = result.metadata_value("chain").unwrap();
        assert_eq!(meta["total_commands"], 3);
        assert_eq!(meta["executed"], 2);
        assert_eq!(meta["skipped"], 1);
        assert_eq!(meta["policy"], "stop_on_failure");
        assert_eq!(meta["steps"][1]["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_step_fails_without_backend_call() {
        let (backend, runner) = setup();
        let chain = Chain::new(Command::new("bad program"))
            .then(Command::new("echo").add_arg("x"))
            .stop_on_failure();

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert_eq!(result.exit_code(), -1);
        assert!(programs(&backend).is_empty());
    }

    #[tokio::test]
    async fn test_transforms_apply_in_order() {
        let (_, runner) = setup();
        let chain = Chain::new(Command::new("echo").add_args(["c", "a", "b", "d"]))
            .sort("")
            .head(2)
            .map(|row| Value::String(row.as_str().unwrap_or_default().to_uppercase()));

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert_eq!(result.projection(), &[json!("A"), json!("B")]);
        assert_eq!(result.raw_text(), "c\na\nb\nd\n");
        assert_eq!(
            result.metadata_value("chain").unwrap()["transforms"],
            json!(["sort()", "head(2)", "map"])
        );
    }

    #[tokio::test]
    async fn test_nested_chain_receives_input() {
        let (_, runner) = setup();
        let inner = Chain::new(Command::new("cat")).pipe(Command::new("cat"));
        let chain = Chain::new(Command::new("echo").add_arg("nested")).pipe(inner);

        let result = chain.execute(&runner, &ExecutionContext::new()).await.unwrap().unwrap();
        assert_eq!(result.raw_text(), "nested\n");
        assert_eq!(chain.describe(), "echo nested | (cat | cat)");
    }

    #[test]
    fn test_describe() {
        let chain = Chain::new(Command::new("a"))
            .pipe(Command::new("b"))
            .then(Command::new("c"));
        assert_eq!(chain.describe(), "a | b ; c");
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.clone().stop_on_failure().describe(), "a | b && c");
    }
}
