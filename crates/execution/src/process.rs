//! Runs one shell command inside a tenant container and supervises it:
//! streaming output, timeout enforcement, and the two-stage TERM/KILL
//! escalation used for both timeouts and user cancellation.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use serde::Serialize;
use tokio::time::Instant;
use utils::{log_msg::StreamKind, msg_store::MsgStore};
use uuid::Uuid;

use crate::{
    command::CommandKind,
    runtime::{ContainerRuntime, RuntimeError},
};

/// Per-kind execution timeouts plus the grace window between SIGTERM and
/// SIGKILL.
#[derive(Debug, Clone, Copy)]
pub struct CommandTimeouts {
    pub foreground: Duration,
    pub install: Duration,
    pub kill_grace: Duration,
}

impl Default for CommandTimeouts {
    fn default() -> Self {
        Self {
            foreground: Duration::from_secs(60),
            install: Duration::from_secs(180),
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl CommandTimeouts {
    /// Dev servers are unbounded; they end via cancellation or container
    /// removal, never by execution timeout.
    pub fn for_kind(&self, kind: CommandKind) -> Option<Duration> {
        match kind {
            CommandKind::Foreground => Some(self.foreground),
            CommandKind::Install => Some(self.install),
            CommandKind::DevServer => None,
        }
    }
}

/// Final outcome of one execution. A non-zero exit code is a normal result,
/// not an error; only transport failures surface as `RuntimeError`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub timed_out: bool,
}

pub fn pid_file_path(execution_id: Uuid) -> String {
    format!("/tmp/.sbx-exec-{execution_id}.pid")
}

/// Wrap a user command so the shell records its PID before exec-ing the
/// command, giving cancellation something to signal.
fn wrap_with_pid_file(command: &str, pid_file: &str) -> Result<String, RuntimeError> {
    let quoted = shlex::try_quote(command).map_err(|_| RuntimeError::InvalidCommand)?;
    Ok(format!("echo $$ > {pid_file}; exec sh -c {quoted}"))
}

/// SIGTERM the recorded PID, wait out the grace window, then SIGKILL if the
/// process is still alive. Best-effort on both legs; the container may
/// already be gone.
pub async fn kill_two_stage(
    runtime: Arc<dyn ContainerRuntime>,
    container: &str,
    pid_file: &str,
    grace: Duration,
) {
    let term = format!("[ -f {pid_file} ] && kill -TERM $(cat {pid_file}) 2>/dev/null");
    if let Err(e) = runtime.exec_detached(container, &term).await {
        tracing::debug!("graceful termination in {container} failed: {e}");
    }
    tokio::time::sleep(grace).await;
    let kill = format!(
        "[ -f {pid_file} ] && kill -KILL $(cat {pid_file}) 2>/dev/null; rm -f {pid_file}"
    );
    if let Err(e) = runtime.exec_detached(container, &kill).await {
        tracing::debug!("forceful kill in {container} failed: {e}");
    }
}

pub struct ProcessRunner {
    runtime: Arc<dyn ContainerRuntime>,
    timeouts: CommandTimeouts,
    workdir: String,
}

impl ProcessRunner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        timeouts: CommandTimeouts,
        workdir: String,
    ) -> Self {
        Self {
            runtime,
            timeouts,
            workdir,
        }
    }

    pub fn timeouts(&self) -> CommandTimeouts {
        self.timeouts
    }

    /// Execute `command` inside `container`, relaying every chunk into
    /// `msg_store` as it arrives. Returns when the command exits, times out,
    /// or (for dev servers) when the persistent exec ends.
    pub async fn run(
        &self,
        container: &str,
        command: &str,
        kind: CommandKind,
        execution_id: Uuid,
        msg_store: &Arc<MsgStore>,
        timeout_override: Option<Duration>,
    ) -> Result<CommandResult, RuntimeError> {
        let pid_file = pid_file_path(execution_id);
        let wrapped = wrap_with_pid_file(command, &pid_file)?;
        let started = Instant::now();

        let handle = self
            .runtime
            .exec_stream(container, &wrapped, &self.workdir)
            .await?;
        let exec_id = handle.exec_id;
        let mut output = handle.output;

        if kind == CommandKind::DevServer {
            msg_store.push_system(format!("Dev server starting: {command}"));
        }

        let deadline = timeout_override.or(self.timeouts.for_kind(kind));
        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut timed_out = false;

        loop {
            let next = match deadline {
                Some(limit) => {
                    let remaining = limit.checked_sub(started.elapsed()).unwrap_or_default();
                    match tokio::time::timeout(remaining, output.next()).await {
                        Ok(item) => item,
                        Err(_) => {
                            timed_out = true;
                            break;
                        }
                    }
                }
                None => output.next().await,
            };

            match next {
                Some(Ok((stream_kind, content))) => {
                    match stream_kind {
                        StreamKind::Stdout => stdout.push_str(&content),
                        StreamKind::Stderr => stderr.push_str(&content),
                        StreamKind::System => {}
                    }
                    msg_store.push(utils::log_msg::LogMsg::Chunk(
                        utils::log_msg::OutputChunk::now(stream_kind, content),
                    ));
                }
                Some(Err(e)) => {
                    tracing::warn!("exec output stream for {execution_id} errored: {e}");
                    break;
                }
                None => break,
            }
        }

        if timed_out {
            let limit = deadline.unwrap_or_default();
            msg_store.push_system(format!(
                "Command timed out after {}s and was terminated",
                limit.as_secs()
            ));
            // Escalate in the background; the result does not wait for the
            // grace window.
            let runtime = self.runtime.clone();
            let container = container.to_string();
            let grace = self.timeouts.kill_grace;
            tokio::spawn(async move {
                kill_two_stage(runtime, &container, &pid_file, grace).await;
            });

            return Ok(CommandResult {
                success: false,
                stdout,
                stderr,
                exit_code: None,
                duration_ms: started.elapsed().as_millis() as u64,
                timed_out: true,
            });
        }

        let exit_code = self.await_exit_code(&exec_id).await?;
        let cleanup = format!("rm -f {pid_file}");
        if let Err(e) = self.runtime.exec_detached(container, &cleanup).await {
            tracing::debug!("pid file cleanup in {container} failed: {e}");
        }

        Ok(CommandResult {
            success: exit_code == Some(0),
            stdout,
            stderr,
            exit_code,
            duration_ms: started.elapsed().as_millis() as u64,
            timed_out: false,
        })
    }

    /// The exec may report `running` for a brief moment after its stream
    /// closes; retry a few times before giving up on the exit code.
    async fn await_exit_code(&self, exec_id: &str) -> Result<Option<i64>, RuntimeError> {
        for _ in 0..5 {
            if let Some(code) = self.runtime.exec_exit_code(exec_id).await? {
                return Ok(Some(code));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(None)
    }
}
