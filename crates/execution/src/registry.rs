//! Indexes every in-flight and recently finished execution so callers can
//! poll status or cancel without holding the original handle.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinHandle};
use utils::msg_store::MsgStore;
use uuid::Uuid;

use crate::{
    command::{CommandKind, classify},
    process::{CommandResult, ProcessRunner, kill_two_stage, pid_file_path},
    runtime::ContainerRuntime,
};

pub const DEFAULT_HISTORY_CAP: usize = 50;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30);

/// One-way status: `Running` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    pub id: Uuid,
    pub command: String,
    pub container: String,
    pub start_time: DateTime<Utc>,
    pub status: ExecutionStatus,
    pub kind: CommandKind,
}

struct ExecutionEntry {
    snapshot: ExecutionSnapshot,
    msg_store: Arc<MsgStore>,
}

/// Returned by [`ExecutionRegistry::submit`]. Foreground callers await
/// `completion`; dev-server callers drop it and let the exec stream on.
pub struct SubmitHandle {
    pub execution_id: Uuid,
    pub kind: CommandKind,
    pub msg_store: Arc<MsgStore>,
    pub completion: JoinHandle<CommandResult>,
}

pub struct ExecutionRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    runner: Arc<ProcessRunner>,
    entries: Arc<RwLock<HashMap<Uuid, Arc<RwLock<ExecutionEntry>>>>>,
    history: Arc<RwLock<VecDeque<String>>>,
    retention: Duration,
    history_cap: usize,
}

impl ExecutionRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, runner: Arc<ProcessRunner>) -> Self {
        Self::with_limits(runtime, runner, DEFAULT_RETENTION, DEFAULT_HISTORY_CAP)
    }

    pub fn with_limits(
        runtime: Arc<dyn ContainerRuntime>,
        runner: Arc<ProcessRunner>,
        retention: Duration,
        history_cap: usize,
    ) -> Self {
        Self {
            runtime,
            runner,
            entries: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(VecDeque::new())),
            retention,
            history_cap,
        }
    }

    /// Start `command` in `container` and register it. The returned handle's
    /// `completion` resolves with the final result; the registry entry is
    /// updated to its terminal status independently of whether the caller
    /// awaits.
    pub async fn submit(
        &self,
        container: &str,
        command: &str,
        execution_id: Option<Uuid>,
        timeout_override: Option<Duration>,
    ) -> SubmitHandle {
        let id = execution_id.unwrap_or_else(Uuid::new_v4);
        let kind = classify(command);
        let msg_store = Arc::new(MsgStore::new());

        let entry = Arc::new(RwLock::new(ExecutionEntry {
            snapshot: ExecutionSnapshot {
                id,
                command: command.to_string(),
                container: container.to_string(),
                start_time: Utc::now(),
                status: ExecutionStatus::Running,
                kind,
            },
            msg_store: msg_store.clone(),
        }));
        self.entries.write().await.insert(id, entry);

        {
            let mut history = self.history.write().await;
            history.push_front(command.to_string());
            history.truncate(self.history_cap);
        }

        let runner = self.runner.clone();
        let entries = self.entries.clone();
        let container = container.to_string();
        let command = command.to_string();
        let store = msg_store.clone();
        let retention = self.retention;

        let completion = tokio::spawn(async move {
            let result = runner
                .run(&container, &command, kind, id, &store, timeout_override)
                .await;

            let result = match result {
                Ok(result) => {
                    let terminal = if result.success {
                        ExecutionStatus::Completed
                    } else {
                        ExecutionStatus::Failed
                    };
                    Self::transition(&entries, id, terminal).await;
                    result
                }
                Err(e) => {
                    store.push_system(format!("Execution failed: {e}"));
                    Self::transition(&entries, id, ExecutionStatus::Failed).await;
                    CommandResult {
                        success: false,
                        stdout: String::new(),
                        stderr: e.to_string(),
                        exit_code: None,
                        duration_ms: 0,
                        timed_out: false,
                    }
                }
            };
            store.push_finished();

            // Keep the terminal record around briefly for late status polls.
            let purge_entries = entries.clone();
            tokio::spawn(async move {
                tokio::time::sleep(retention).await;
                purge_entries.write().await.remove(&id);
            });

            result
        });

        SubmitHandle {
            execution_id: id,
            kind,
            msg_store,
            completion,
        }
    }

    /// Transition to a terminal status, unless a cancel got there first.
    async fn transition(
        entries: &Arc<RwLock<HashMap<Uuid, Arc<RwLock<ExecutionEntry>>>>>,
        id: Uuid,
        to: ExecutionStatus,
    ) -> bool {
        let entry = { entries.read().await.get(&id).cloned() };
        let Some(entry) = entry else {
            return false;
        };
        let mut entry = entry.write().await;
        if entry.snapshot.status != ExecutionStatus::Running {
            return false;
        }
        entry.snapshot.status = to;
        true
    }

    /// Cancel a running execution. The status flips to `Cancelled` before
    /// this returns; the in-container process may take up to the grace
    /// window to actually die. Safe no-op for unknown or terminal ids.
    pub async fn cancel(&self, id: Uuid) -> bool {
        let entry = { self.entries.read().await.get(&id).cloned() };
        let Some(entry) = entry else {
            return false;
        };

        let container = {
            let mut entry = entry.write().await;
            if entry.snapshot.status != ExecutionStatus::Running {
                return false;
            }
            entry.snapshot.status = ExecutionStatus::Cancelled;
            entry
                .msg_store
                .push_system("Execution cancelled by user".to_string());
            // Seal the log. Whatever the dying process still writes before
            // the kill lands is dropped, keeping the terminal log immutable.
            entry.msg_store.push_finished();
            entry.snapshot.container.clone()
        };

        let runtime = self.runtime.clone();
        let pid_file = pid_file_path(id);
        let grace = self.runner.timeouts().kill_grace;
        tokio::spawn(async move {
            kill_two_stage(runtime, &container, &pid_file, grace).await;
        });

        // Schedule the purge for the cancelled record too.
        let entries = self.entries.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            entries.write().await.remove(&id);
        });

        true
    }

    pub async fn cancel_all(&self) {
        let ids: Vec<Uuid> = self.entries.read().await.keys().copied().collect();
        for id in ids {
            self.cancel(id).await;
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<ExecutionSnapshot> {
        let entry = { self.entries.read().await.get(&id).cloned() }?;
        let snapshot = entry.read().await.snapshot.clone();
        Some(snapshot)
    }

    pub async fn msg_store(&self, id: Uuid) -> Option<Arc<MsgStore>> {
        let entry = { self.entries.read().await.get(&id).cloned() }?;
        let store = entry.read().await.msg_store.clone();
        Some(store)
    }

    pub async fn list_running(&self) -> Vec<ExecutionSnapshot> {
        let entries: Vec<_> = { self.entries.read().await.values().cloned().collect() };
        let mut running = Vec::new();
        for entry in entries {
            let snapshot = entry.read().await.snapshot.clone();
            if snapshot.status == ExecutionStatus::Running {
                running.push(snapshot);
            }
        }
        running
    }

    /// Recent command strings, most recent first, capped.
    pub async fn history(&self) -> Vec<String> {
        self.history.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use utils::log_msg::StreamKind;

    use super::*;
    use crate::{
        process::CommandTimeouts,
        test_support::{FakeRuntime, ScriptedChunk},
    };

    fn registry_with(runtime: Arc<FakeRuntime>, retention: Duration) -> ExecutionRegistry {
        let runner = Arc::new(ProcessRunner::new(
            runtime.clone(),
            CommandTimeouts {
                kill_grace: Duration::from_millis(30),
                ..Default::default()
            },
            "/workspace".to_string(),
        ));
        ExecutionRegistry::with_limits(runtime, runner, retention, 3)
    }

    #[tokio::test]
    async fn completed_execution_reaches_terminal_status_then_purges() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script_exec(vec![ScriptedChunk::stdout("hi\n")], Some(0));
        let registry = registry_with(runtime, Duration::from_millis(100));

        let handle = registry.submit("sbx_u1", "echo hi", None, None).await;
        let result = handle.completion.await.unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hi\n");

        let snapshot = registry.get(handle.execution_id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Completed);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(registry.get(handle.execution_id).await.is_none());
    }

    #[tokio::test]
    async fn cancel_flips_status_synchronously_and_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script_exec(vec![ScriptedChunk::delay(5_000)], None);
        let registry = registry_with(runtime.clone(), Duration::from_secs(30));

        let handle = registry.submit("sbx_u1", "sleep 999", None, None).await;
        // Let the exec get going.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(registry.cancel(handle.execution_id).await);
        let snapshot = registry.get(handle.execution_id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Cancelled);

        // Second cancel is a reported no-op.
        assert!(!registry.cancel(handle.execution_id).await);

        let store = registry.msg_store(handle.execution_id).await.unwrap();
        assert!(store.aggregate(StreamKind::System).contains("cancelled"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let kills = runtime.detached_commands();
        assert!(kills.iter().any(|c| c.contains("kill -TERM")));
    }

    #[tokio::test]
    async fn output_arriving_after_cancel_is_dropped() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script_exec(
            vec![
                ScriptedChunk::delay(100),
                ScriptedChunk::stdout("late output\n"),
            ],
            None,
        );
        let registry = registry_with(runtime, Duration::from_secs(30));

        let handle = registry.submit("sbx_u1", "sleep 999", None, None).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(registry.cancel(handle.execution_id).await);

        let store = registry.msg_store(handle.execution_id).await.unwrap();
        assert!(store.is_finished());

        // The runner is still draining the exec stream; the chunk it relays
        // after the cancel must not land in the log.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!store.aggregate(StreamKind::Stdout).contains("late output"));
        assert!(store.aggregate(StreamKind::System).contains("cancelled"));
    }

    #[tokio::test]
    async fn cancel_of_unknown_execution_is_a_no_op() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_with(runtime, Duration::from_secs(30));
        assert!(!registry.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn history_is_most_recent_first_and_capped() {
        let runtime = Arc::new(FakeRuntime::new());
        let registry = registry_with(runtime, Duration::from_secs(30));

        for cmd in ["one", "two", "three", "four"] {
            let handle = registry.submit("sbx_u1", cmd, None, None).await;
            let _ = handle.completion.await;
        }

        let history = registry.history().await;
        assert_eq!(history, vec!["four", "three", "two"]);
    }

    #[tokio::test]
    async fn dev_server_stays_running_while_streaming() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.script_exec(
            vec![
                ScriptedChunk::stdout("ready on :3000\n"),
                ScriptedChunk::delay(5_000),
            ],
            None,
        );
        let registry = registry_with(runtime, Duration::from_secs(30));

        let handle = registry.submit("sbx_u1", "npm run dev", None, None).await;
        assert_eq!(handle.kind, CommandKind::DevServer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = registry.get(handle.execution_id).await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Running);
        assert!(
            handle
                .msg_store
                .aggregate(StreamKind::Stdout)
                .contains("ready on :3000")
        );
        assert_eq!(registry.list_running().await.len(), 1);
    }
}
