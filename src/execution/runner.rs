//! Orchestrator: backend selection, execution and recording.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::{parse_output, parse_output_as, CommandResult, ExecutionContext, ExecutionId};
use crate::backend::{Backend, ExecRequest, LocalBackend, RawOutput, RemoteBackend, RemoteTarget};
use crate::cache::{CacheRefresher, ResultCache};
use crate::command::Command;
use crate::error::CmdChainError;
use crate::Result;

/// Resolves a backend from the context, runs commands and records them.
///
/// Every execution gets a fresh [`ExecutionId`]. Results are stored in
/// the attached [`ResultCache`] (if any) under that id and appended to the
/// context's history.
pub struct Runner {
    local: Arc<dyn Backend>,
    cache: Option<Arc<ResultCache>>,
    /// Backends registered explicitly, keyed by [`RemoteTarget::key`].
    registered: Mutex<HashMap<String, Arc<dyn Backend>>>,
    /// SSH backends created on demand.
    ssh: Mutex<HashMap<String, Arc<RemoteBackend>>>,
}

impl Runner {
    /// Runner executing locally through a [`LocalBackend`].
    pub fn new() -> Self {
        Self::with_local_backend(Arc::new(LocalBackend::new()))
    }

    /// Runner with a custom backend for local execution.
    pub fn with_local_backend(local: Arc<dyn Backend>) -> Self {
        Self {
            local,
            cache: None,
            registered: Mutex::new(HashMap::new()),
            ssh: Mutex::new(HashMap::new()),
        }
    }

    /// Record every result into `cache`.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&Arc<ResultCache>> {
        self.cache.as_ref()
    }

    /// Use `backend` for every context targeting `target`.
    pub fn register_remote(
        &self,
        target: &RemoteTarget,
        backend: Arc<dyn Backend>,
    ) -> Result<()> {
        self.registered
            .lock()
            .map_err(|_| CmdChainError::LockPoisoned)?
            .insert(target.key(), backend);
        Ok(())
    }

    /// SSH backend for `target`, created on first use. Gives access to
    /// session management.
    pub fn remote(&self, target: &RemoteTarget) -> Result<Arc<RemoteBackend>> {
        let mut ssh = self.ssh.lock().map_err(|_| CmdChainError::LockPoisoned)?;
        let backend = ssh
            .entry(target.key())
            .or_insert_with(|| Arc::new(RemoteBackend::new(target.clone())));
        Ok(Arc::clone(backend))
    }

    /// Backend the context resolves to.
    pub fn backend_for(&self, ctx: &ExecutionContext) -> Result<Arc<dyn Backend>> {
        let Some(target) = ctx.remote() else {
            return Ok(Arc::clone(&self.local));
        };
        let registered = self
            .registered
            .lock()
            .map_err(|_| CmdChainError::LockPoisoned)?
            .get(&target.key())
            .cloned();
        match registered {
            Some(backend) => Ok(backend),
            None => Ok(self.remote(target)?),
        }
    }

    /// Execute one command.
    ///
    /// Invalid commands yield a failed result without reaching a backend
    /// and are not recorded. Non-zero exits are returned as failed results;
    /// only transport failures are `Err`.
    pub async fn run(
        &self,
        cmd: &Command,
        ctx: &ExecutionContext,
        input: Option<&CommandResult>,
    ) -> Result<CommandResult> {
        let violations = cmd.validate();
        if !violations.is_empty() {
            warn!(
                program = cmd.program(),
                violations = violations.len(),
                "rejected invalid command"
            );
            return Ok(CommandResult::invalid(cmd.program(), &violations));
        }

        let elevate = ctx.remote().is_some_and(|t| t.use_elevated) && !cmd.requires_privilege();
        let cmd = if elevate { cmd.with_sudo() } else { cmd.clone() };

        let id = ExecutionId::generate();
        let line = cmd.command_line();
        let backend = self.backend_for(ctx)?;

        let mut request = ExecRequest::from_context(cmd.build(), ctx);
        if let Some(input) = input {
            request = request.with_stdin(input.raw_text());
        }
        debug!(
            id = %id,
            backend = %backend.name(),
            command = %line,
            piped = input.is_some(),
            "executing"
        );

        let raw = backend.execute(request).await.map_err(|e| {
            warn!(
                id = %id,
                backend = %backend.name(),
                command = %line,
                error = %e,
                "execution failed"
            );
            e
        })?;

        let result = to_result(&cmd, raw)
            .with_metadata("backend", Value::String(backend.name()))
            .with_metadata("execution_id", Value::String(id.to_string()));
        debug!(
            id = %id,
            exit_code = result.exit_code(),
            duration = ?result.duration(),
            "executed"
        );

        self.record(id, &line, ctx, &result);
        Ok(result)
    }

    /// Refresher re-running cached command lines through the backend
    /// `ctx` resolves to.
    pub fn refresher(&self, ctx: &ExecutionContext) -> Result<BackendRefresher> {
        Ok(BackendRefresher {
            backend: self.backend_for(ctx)?,
            ctx: ctx.fork(),
        })
    }

    fn record(
        &self,
        id: ExecutionId,
        line: &str,
        ctx: &ExecutionContext,
        result: &CommandResult,
    ) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.store(id.to_string(), line, result.clone(), None) {
                warn!(id = %id, error = %e, "failed to cache result");
            }
        }
        ctx.record(id, line, result);
    }
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("local", &self.local.name())
            .field("cache", &self.cache)
            .finish()
    }
}

/// Stderr is only a failure signal on a non-zero exit; on success it is
/// kept in metadata.
fn to_result(cmd: &Command, raw: RawOutput) -> CommandResult {
    let failed = raw.exit_code != 0;
    let raw_error = failed.then_some(raw.stderr.as_str());
    let result = parse_output_as(
        cmd.format(),
        cmd.program(),
        raw.stdout.as_str(),
        raw.exit_code,
        raw_error,
    )
    .with_duration(raw.duration);

    if !failed && !raw.stderr.is_empty() {
        result.with_metadata("stderr", Value::String(raw.stderr))
    } else {
        result
    }
}

/// Re-runs cached command lines with `sh -c`.
pub struct BackendRefresher {
    backend: Arc<dyn Backend>,
    ctx: ExecutionContext,
}

#[async_trait]
impl CacheRefresher for BackendRefresher {
    async fn refresh(&self, id: &str, command: &str) -> Option<CommandResult> {
        let tokens = vec!["sh".to_string(), "-c".to_string(), command.to_string()];
        match self.backend.execute(ExecRequest::from_context(tokens, &self.ctx)).await {
            Ok(raw) => {
                let raw_error = (raw.exit_code != 0).then_some(raw.stderr.as_str());
                Some(
                    parse_output("sh", raw.stdout.as_str(), raw.exit_code, raw_error)
                        .with_duration(raw.duration)
                        .with_metadata("refreshed", Value::Bool(true)),
                )
            }
            Err(e) => {
                warn!(id, command, error = %e, "refresh failed, keeping cached result");
                None
            }
        }
    }
}
