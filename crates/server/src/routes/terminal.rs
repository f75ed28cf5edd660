//! The terminal API: container status, command execution, and the event
//! stream, all hanging off one endpoint dispatched by an `action` field the
//! way the web client expects.

use axum::{
    Json, Router,
    extract::{Query, State},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use chrono::{DateTime, Utc};
use execution::{command::CommonCommand, registry::ExecutionStatus};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use services::services::{
    commands::ExecuteOutcome,
    container::{ContainerRecord, HealthReport},
    events::{EventKind, EventService, SandboxEvent},
};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/terminal",
        get(terminal_get)
            .post(terminal_post)
            .delete(terminal_delete),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalQuery {
    action: Option<String>,
    user_id: Option<String>,
    project_id: Option<String>,
    session: Option<Uuid>,
}

/// Tenants are keyed by user, or user:project when a project is given.
fn tenant_key(user_id: Option<&str>, project_id: Option<&str>) -> String {
    match (user_id, project_id) {
        (Some(user), Some(project)) => format!("{user}:{project}"),
        (Some(user), None) => user.to_string(),
        (None, Some(project)) => project.to_string(),
        (None, None) => "anonymous".to_string(),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunningCommand {
    id: Uuid,
    command: String,
    start_time: DateTime<Utc>,
    status: ExecutionStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<ContainerRecord>,
    health: HealthReport,
    running_commands: Vec<RunningCommand>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandsResponse {
    success: bool,
    common_commands: Vec<CommonCommand>,
    command_history: Vec<String>,
}

async fn terminal_get(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    let tenant = tenant_key(query.user_id.as_deref(), query.project_id.as_deref());

    match query.action.as_deref() {
        Some("status") | None => {
            let running_commands = state
                .commands()
                .list_running()
                .await
                .into_iter()
                .map(|s| RunningCommand {
                    id: s.id,
                    command: s.command,
                    start_time: s.start_time,
                    status: s.status,
                })
                .collect();
            let response = StatusResponse {
                success: true,
                status: state.pool().status_for(&tenant),
                health: state.pool().health_check(&tenant).await,
                running_commands,
            };
            Ok(Json(response).into_response())
        }
        Some("commands") => {
            let response = CommandsResponse {
                success: true,
                common_commands: state.commands().common(),
                command_history: state.commands().history().await,
            };
            Ok(Json(response).into_response())
        }
        Some("stream") => Ok(stream_events(state.events().clone()).into_response()),
        Some(other) => Err(ApiError::BadRequest(format!("unknown action '{other}'"))),
    }
}

/// Unregisters the SSE session when the client goes away.
struct SessionGuard {
    events: EventService,
    session_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.events.unsubscribe(self.session_id);
    }
}

fn stream_events(
    events: EventService,
) -> Sse<impl futures::Stream<Item = Result<Event, axum::Error>>> {
    let subscription = events.subscribe();
    let session_id = subscription.session_id;
    let guard = SessionGuard {
        events,
        session_id,
    };

    let connected = SandboxEvent {
        kind: EventKind::Connected,
        data: json!({ "sessionId": session_id }),
        timestamp: Utc::now(),
    };

    // Lagged subscribers drop their own missed messages and keep going.
    let live = BroadcastStream::new(subscription.receiver)
        .filter_map(|item| async move { item.ok() });
    let framed = futures::stream::once(async move { connected })
        .chain(live)
        .map(move |event| {
            let _ = &guard;
            Event::default().json_data(&event)
        });

    Sse::new(framed).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminalRequest {
    action: String,
    command: Option<String>,
    execution_id: Option<Uuid>,
    project_path: Option<String>,
    user_id: Option<String>,
    project_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    needs_container: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateContainerResponse {
    success: bool,
    container_id: String,
    project_path: String,
}

async fn terminal_post(
    State(state): State<AppState>,
    Json(request): Json<TerminalRequest>,
) -> Result<Response, ApiError> {
    let tenant = tenant_key(request.user_id.as_deref(), request.project_id.as_deref());

    match request.action.as_str() {
        "execute" => {
            let command = request.command.unwrap_or_default();
            if command.trim().is_empty() {
                return Err(ApiError::BadRequest("command cannot be empty".to_string()));
            }
            let outcome = state
                .commands()
                .execute(&tenant, &command, request.execution_id)
                .await;
            let response = match outcome {
                ExecuteOutcome::NeedsContainer => ExecuteResponse {
                    success: false,
                    output: None,
                    error: Some(
                        "No container is running for this tenant; create one first".to_string(),
                    ),
                    execution_id: None,
                    needs_container: Some(true),
                },
                ExecuteOutcome::Started { execution_id } => ExecuteResponse {
                    success: true,
                    output: None,
                    error: None,
                    execution_id: Some(execution_id),
                    needs_container: None,
                },
                ExecuteOutcome::Finished {
                    execution_id,
                    result,
                } => ExecuteResponse {
                    success: result.success,
                    output: Some(result.stdout),
                    error: (!result.stderr.is_empty()).then_some(result.stderr),
                    execution_id: Some(execution_id),
                    needs_container: None,
                },
            };
            Ok(Json(response).into_response())
        }
        "cancel" => {
            let execution_id = request
                .execution_id
                .ok_or_else(|| ApiError::BadRequest("executionId is required".to_string()))?;
            let cancelled = state.commands().cancel(execution_id).await;
            let message = if cancelled {
                "Execution cancelled"
            } else {
                "Execution not found or already finished"
            };
            Ok(Json(json!({ "success": cancelled, "message": message })).into_response())
        }
        "create-container" => {
            let project_dir = request.project_path.map(std::path::PathBuf::from);
            let record = state.pool().ensure_with_dir(&tenant, project_dir).await?;
            Ok(Json(CreateContainerResponse {
                success: true,
                container_id: record.container_id,
                project_path: record.project_dir.display().to_string(),
            })
            .into_response())
        }
        "cleanup" => {
            if let Some(record) = state.pool().status_for(&tenant) {
                let cancelled = state.commands().cancel_running_in(&record.name).await;
                if cancelled > 0 {
                    tracing::info!(tenant, cancelled, "cancelled executions during cleanup");
                }
            }
            let removed = state.pool().remove(&tenant).await;
            Ok(Json(json!({ "success": true, "removed": removed })).into_response())
        }
        "health-check" => {
            let health = state.pool().health_check(&tenant).await;
            Ok(Json(json!({ "success": true, "health": health })).into_response())
        }
        other => Err(ApiError::BadRequest(format!("unknown action '{other}'"))),
    }
}

async fn terminal_delete(
    State(state): State<AppState>,
    Query(query): Query<TerminalQuery>,
) -> Result<Response, ApiError> {
    let session = query
        .session
        .ok_or_else(|| ApiError::BadRequest("session is required".to_string()))?;
    let removed = state.events().unsubscribe(session);
    Ok(Json(json!({ "success": removed })).into_response())
}
