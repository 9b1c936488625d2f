//! Local child-process backend.

use std::process::{ExitStatus, Stdio};
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Backend, ExecRequest, RawOutput};
use crate::error::CmdChainError;
use crate::execution::{OutputChunk, OutputSource};
use crate::Result;

/// Default buffer size for reading process output.
const READ_BUFFER_SIZE: usize = 4096;

/// Runs commands as local child processes.
///
/// Each child gets its own process group so a timeout can take down
/// everything it spawned, not just the direct child.
#[derive(Debug, Default, Clone)]
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Backend for LocalBackend {
    async fn execute(&self, request: ExecRequest) -> Result<RawOutput> {
        let request = request.into_elevated();
        let start = Instant::now();

        let (program, args) = request
            .tokens
            .split_first()
            .ok_or_else(|| CmdChainError::Spawn {
                program: String::new(),
                reason: "empty command".into(),
            })?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .envs(&request.env)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| CmdChainError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        debug!(program = %program, pid = ?child.id(), "spawned local process");

        // Feed stdin from its own task so a large payload cannot deadlock
        // against a child that is blocked writing stdout.
        if let (Some(mut pipe), Some(data)) = (child.stdin.take(), request.stdin.clone()) {
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&data).await {
                    debug!(error = %e, "stdin closed early");
                }
            });
        }

        let sink = request.output_sink.clone();
        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(drain(out, OutputSource::Stdout, sink.clone())));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(drain(err, OutputSource::Stderr, sink)));

        // Readers are joined before the result is assembled, so streamed
        // chunks are always a prefix of the final output.
        let collected = timeout(request.timeout, async {
            let status = child.wait().await?;
            let stdout = join_reader(stdout_task).await?;
            let stderr = join_reader(stderr_task).await?;
            Ok::<_, CmdChainError>((status, stdout, stderr))
        })
        .await;

        match collected {
            Ok(outcome) => {
                let (status, stdout, stderr) = outcome?;
                let exit_code = exit_code(status);
                debug!(
                    program = %program,
                    exit_code,
                    elapsed = ?start.elapsed(),
                    "local process finished"
                );
                Ok(RawOutput {
                    exit_code,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    duration: start.elapsed(),
                })
            }
            Err(_) => {
                warn!(
                    program = %program,
                    timeout = ?request.timeout,
                    "local process timed out, killing process group"
                );
                kill_process_group(&mut child).await;
                Err(CmdChainError::Timeout(request.timeout))
            }
        }
    }

    fn name(&self) -> String {
        "local".to_string()
    }
}

/// Read a pipe to EOF, forwarding chunks to the live-output sink.
async fn drain<R>(
    mut reader: R,
    source: OutputSource,
    sink: Option<mpsc::Sender<OutputChunk>>,
) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(sink) = &sink {
            // A dropped receiver just stops the stream; capture continues.
            let _ = sink.send(OutputChunk::new(buf[..n].to_vec(), source)).await;
        }
    }

    Ok(collected)
}

async fn join_reader(task: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match task {
        Some(handle) => handle
            .await
            .map_err(|e| CmdChainError::Internal(format!("output reader failed: {e}")))?
            .map_err(CmdChainError::Io),
        None => Ok(Vec::new()),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

async fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pgid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()) {
        // SAFETY: killpg only sends a signal. The child was spawned with
        // process_group(0), so its pid is the group id.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request(parts: &[&str]) -> ExecRequest {
        ExecRequest::new(parts.iter().map(|s| s.to_string()).collect())
    }

    #[tokio::test]
    async fn test_echo_ok() {
        let output = LocalBackend::new().execute(request(&["echo", "ok"])).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("ok"));
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_not_an_error() {
        let output = LocalBackend::new()
            .execute(request(&["sh", "-c", "echo bad >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stderr, "bad\n");
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let output = LocalBackend::new()
            .execute(request(&["cat"]).with_stdin("foo"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "foo");
    }

    #[tokio::test]
    async fn test_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(&["sh", "-c", "echo $GREETING; pwd"]);
        req.env.insert("GREETING".into(), "hi".into());
        req.working_dir = Some(dir.path().to_path_buf());

        let output = LocalBackend::new().execute(req).await.unwrap();
        let lines: Vec<_> = output.stdout.lines().collect();
        assert_eq!(lines[0], "hi");
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(std::path::Path::new(lines[1]).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let err = LocalBackend::new()
            .execute(request(&["/definitely/not/a/program"]))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdChainError::Spawn { .. }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_empty_tokens_rejected() {
        let err = LocalBackend::new().execute(request(&[])).await.unwrap_err();
        assert!(matches!(err, CmdChainError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let start = Instant::now();
        let err = LocalBackend::new()
            .execute(request(&["sleep", "10"]).with_timeout(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, CmdChainError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_live_output_matches_final_output() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut req = request(&["sh", "-c", "echo one; echo two; echo three >&2"]);
        req.output_sink = Some(tx);

        let output = LocalBackend::new().execute(req).await.unwrap();

        let mut streamed_stdout = String::new();
        let mut streamed_stderr = String::new();
        while let Ok(chunk) = rx.try_recv() {
            match chunk.source {
                OutputSource::Stdout => streamed_stdout.push_str(&chunk.text),
                OutputSource::Stderr => streamed_stderr.push_str(&chunk.text),
            }
        }
        assert_eq!(streamed_stdout, output.stdout);
        assert_eq!(streamed_stderr, output.stderr);
        assert_eq!(output.stdout, "one\ntwo\n");
    }

    #[test]
    fn test_exit_code_from_signal() {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
        assert_eq!(exit_code(ExitStatus::from_raw(2 << 8)), 2);
    }
}
