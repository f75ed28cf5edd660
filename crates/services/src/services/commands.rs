//! Command orchestration: resolves the tenant's container, hands the command
//! to the execution registry, and mirrors execution lifecycle and output into
//! the event broadcaster.

use std::sync::Arc;

use execution::{
    command::{CommandKind, CommonCommand, common_commands},
    process::CommandResult,
    registry::{ExecutionRegistry, ExecutionSnapshot},
};
use serde_json::json;
use utils::log_msg::LogMsg;
use uuid::Uuid;

use super::{
    container::ContainerPool,
    events::{EventKind, EventService},
};

/// Outcome of an execute request. Expected failure modes are data here, not
/// errors; only transport-level trouble surfaces inside `CommandResult`.
pub enum ExecuteOutcome {
    /// The tenant has no running container; the client must create one.
    NeedsContainer,
    /// A dev server was started and keeps running; output arrives via the
    /// event stream.
    Started { execution_id: Uuid },
    /// A foreground command ran to completion (including timeouts and
    /// non-zero exits).
    Finished {
        execution_id: Uuid,
        result: CommandResult,
    },
}

pub struct CommandService {
    pool: Arc<ContainerPool>,
    registry: Arc<ExecutionRegistry>,
    events: EventService,
}

impl CommandService {
    pub fn new(
        pool: Arc<ContainerPool>,
        registry: Arc<ExecutionRegistry>,
        events: EventService,
    ) -> Self {
        Self {
            pool,
            registry,
            events,
        }
    }

    pub async fn execute(
        &self,
        tenant: &str,
        command: &str,
        execution_id: Option<Uuid>,
    ) -> ExecuteOutcome {
        // Gate on actual container liveness, not record existence: a
        // container that died out-of-band should ask for recreation rather
        // than fail the exec.
        let Some(record) = self.pool.live_record(tenant).await else {
            return ExecuteOutcome::NeedsContainer;
        };
        self.pool.touch(tenant);

        let handle = self
            .registry
            .submit(&record.name, command, execution_id, None)
            .await;
        let execution_id = handle.execution_id;

        self.events.publish(
            EventKind::CommandStarted,
            json!({
                "executionId": execution_id,
                "tenant": tenant,
                "command": command,
            }),
        );

        let events = self.events.clone();
        handle.msg_store.clone().spawn_forwarder(move |msg| {
            if let LogMsg::Chunk(chunk) = msg {
                events.publish(
                    EventKind::CommandOutput,
                    json!({
                        "executionId": execution_id,
                        "stream": chunk.kind,
                        "content": chunk.content,
                    }),
                );
            }
        });

        if handle.kind == CommandKind::DevServer {
            // The completion future only resolves when the server dies;
            // report that whenever it happens.
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Ok(result) = handle.completion.await {
                    events.publish(
                        EventKind::CommandFinished,
                        json!({
                            "executionId": execution_id,
                            "success": result.success,
                            "exitCode": result.exit_code,
                        }),
                    );
                }
            });
            return ExecuteOutcome::Started { execution_id };
        }

        let result = match handle.completion.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("execution task for {execution_id} panicked: {e}");
                CommandResult {
                    success: false,
                    stdout: String::new(),
                    stderr: "execution task failed unexpectedly".to_string(),
                    exit_code: None,
                    duration_ms: 0,
                    timed_out: false,
                }
            }
        };

        // Transport failures (no exit code, no timeout) are the only thing
        // reported as command-error; everything else is a finished command.
        let kind = if !result.success && result.exit_code.is_none() && !result.timed_out {
            EventKind::CommandError
        } else {
            EventKind::CommandFinished
        };
        self.events.publish(
            kind,
            json!({
                "executionId": execution_id,
                "success": result.success,
                "exitCode": result.exit_code,
                "timedOut": result.timed_out,
                "durationMs": result.duration_ms,
            }),
        );

        ExecuteOutcome::Finished {
            execution_id,
            result,
        }
    }

    pub async fn cancel(&self, execution_id: Uuid) -> bool {
        let cancelled = self.registry.cancel(execution_id).await;
        if cancelled {
            self.events.publish(
                EventKind::CommandCancelled,
                json!({ "executionId": execution_id }),
            );
        }
        cancelled
    }

    pub async fn list_running(&self) -> Vec<ExecutionSnapshot> {
        self.registry.list_running().await
    }

    pub async fn history(&self) -> Vec<String> {
        self.registry.history().await
    }

    pub fn common(&self) -> Vec<CommonCommand> {
        common_commands()
    }

    /// Cancel every running execution targeting the given container. Used
    /// when a tenant's sandbox is torn down.
    pub async fn cancel_running_in(&self, container: &str) -> usize {
        let mut cancelled = 0;
        for snapshot in self.registry.list_running().await {
            if snapshot.container == container && self.cancel(snapshot.id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Shutdown hygiene: flip every running execution to cancelled and send
    /// the kill escalation before the process exits.
    pub async fn cancel_all(&self) {
        self.registry.cancel_all().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use execution::{
        process::{CommandTimeouts, ProcessRunner},
        registry::ExecutionStatus,
        test_support::{FakeRuntime, ScriptedChunk},
    };

    use super::*;
    use crate::services::config::SandboxConfig;

    fn stack(
        runtime: Arc<FakeRuntime>,
        dir: &tempfile::TempDir,
    ) -> (CommandService, Arc<ContainerPool>, EventService) {
        let config = SandboxConfig {
            sandbox_root: dir.path().join("projects"),
            proxy_conf: dir.path().join("sbx-routes.conf"),
            ..SandboxConfig::default()
        };
        runtime.add_image(&config.image);
        let events = EventService::new();
        let pool = Arc::new(ContainerPool::new(
            config.clone(),
            runtime.clone(),
            events.clone(),
        ));
        let runner = Arc::new(ProcessRunner::new(
            runtime.clone(),
            CommandTimeouts {
                kill_grace: Duration::from_millis(30),
                ..Default::default()
            },
            config.mount_target.clone(),
        ));
        let registry = Arc::new(ExecutionRegistry::new(runtime, runner));
        (
            CommandService::new(pool.clone(), registry, events.clone()),
            pool,
            events,
        )
    }

    #[tokio::test]
    async fn execute_without_a_container_asks_for_one() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (service, _pool, _events) = stack(runtime, &dir);

        assert!(matches!(
            service.execute("u1", "echo hi", None).await,
            ExecuteOutcome::NeedsContainer
        ));
    }

    #[tokio::test]
    async fn fresh_tenant_runs_after_container_creation() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (service, pool, events) = stack(runtime.clone(), &dir);
        let mut sub = events.subscribe();

        assert!(matches!(
            service.execute("u1", "echo hi", None).await,
            ExecuteOutcome::NeedsContainer
        ));

        pool.ensure("u1").await.unwrap();
        runtime.script_exec(vec![ScriptedChunk::stdout("hi\n")], Some(0));

        match service.execute("u1", "echo hi", None).await {
            ExecuteOutcome::Finished { result, .. } => {
                assert!(result.success);
                assert_eq!(result.stdout, "hi\n");
            }
            _ => panic!("expected a finished foreground command"),
        }

        // The output forwarder runs on its own task; give it a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut kinds = Vec::new();
        while let Ok(event) = sub.receiver.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::CommandStarted));
        assert!(kinds.contains(&EventKind::CommandOutput));
        assert!(kinds.contains(&EventKind::CommandFinished));
    }

    #[tokio::test]
    async fn dead_container_asks_for_recreation_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (service, pool, _events) = stack(runtime.clone(), &dir);

        pool.ensure("u1").await.unwrap();
        runtime.mark_stopped("sbx_u1");

        assert!(matches!(
            service.execute("u1", "echo hi", None).await,
            ExecuteOutcome::NeedsContainer
        ));
        // The dead record was torn down, so the next create starts clean.
        assert!(pool.status_for("u1").is_none());
    }

    #[tokio::test]
    async fn dev_server_reports_started_and_stays_running() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (service, pool, _events) = stack(runtime.clone(), &dir);

        pool.ensure("u1").await.unwrap();
        runtime.script_exec(
            vec![
                ScriptedChunk::stdout("listening on :3000\n"),
                ScriptedChunk::delay(5_000),
            ],
            None,
        );

        let execution_id = match service.execute("u1", "npm run dev", None).await {
            ExecuteOutcome::Started { execution_id } => execution_id,
            _ => panic!("expected a started dev server"),
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let running = service.list_running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, execution_id);
        assert_eq!(running[0].status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn cancel_publishes_only_for_known_running_executions() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let (service, _pool, _events) = stack(runtime, &dir);

        assert!(!service.cancel(Uuid::new_v4()).await);
    }
}
