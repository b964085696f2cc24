use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use muster_bus::BusClient;
use muster_core::config::{ExecutionConfig, StreamingConfig};
use muster_core::identity::IdentityProvider;
use muster_core::store::{ApprovalStore, SquadStore, TaskStore};
use muster_core::types::{
    ApprovalDecision, ApprovalRecord, ApprovalStatus, Squad, SquadMember, Task, TaskKind,
    TaskPriority, TaskStatus,
};
use muster_engine::{
    AgentBehavior, Chunk, ExecutionAttempt, ScriptedAgent, SquadRuntime,
};

use crate::api_error::ApiError;
use crate::protocol::StreamFrame;

/// Builds the behavior an agent runs with, from its squad membership.
/// The daemon installs its default here; tests install scripted ones.
pub type BehaviorFactory = Arc<dyn Fn(&SquadMember) -> Arc<dyn AgentBehavior> + Send + Sync>;

/// Factory producing agents that stream one line and complete.
pub fn scripted_factory() -> BehaviorFactory {
    Arc::new(|member| Arc::new(ScriptedAgent::completing(member.role)))
}

// ---------------------------------------------------------------------------
// ApiState
// ---------------------------------------------------------------------------

/// Shared application state for all HTTP/WS handlers.
pub struct ApiState {
    pub tasks: Arc<dyn TaskStore>,
    pub approvals: Arc<dyn ApprovalStore>,
    pub squads: Arc<dyn SquadStore>,
    pub identity: Arc<dyn IdentityProvider>,
    pub bus: BusClient,
    pub execution: ExecutionConfig,
    pub streaming: StreamingConfig,
    behavior_factory: BehaviorFactory,
    /// One engine runtime per squad, created with the squad.
    runtimes: DashMap<Uuid, Arc<SquadRuntime>>,
    pub start_time: std::time::Instant,
}

impl ApiState {
    pub fn new(
        tasks: Arc<dyn TaskStore>,
        approvals: Arc<dyn ApprovalStore>,
        squads: Arc<dyn SquadStore>,
        identity: Arc<dyn IdentityProvider>,
        bus: BusClient,
        execution: ExecutionConfig,
        streaming: StreamingConfig,
        behavior_factory: BehaviorFactory,
    ) -> Self {
        Self {
            tasks,
            approvals,
            squads,
            identity,
            bus,
            execution,
            streaming,
            behavior_factory,
            runtimes: DashMap::new(),
            start_time: std::time::Instant::now(),
        }
    }

    /// Wire an engine runtime for a squad and remember it. Called for
    /// every created squad, and by the daemon for squads loaded at
    /// startup.
    pub fn register_squad(&self, squad: Squad) -> Arc<SquadRuntime> {
        let behaviors: HashMap<Uuid, Arc<dyn AgentBehavior>> = squad
            .members()
            .iter()
            .map(|m| (m.agent_id, (self.behavior_factory)(m)))
            .collect();
        let runtime = Arc::new(SquadRuntime::new(
            squad.clone(),
            self.tasks.clone(),
            self.approvals.clone(),
            self.bus.clone(),
            self.execution.clone(),
            self.streaming.clone(),
            behaviors,
        ));
        self.runtimes.insert(squad.id, runtime.clone());
        runtime
    }

    /// All registered runtimes, for the approval sweeper.
    pub fn runtimes(&self) -> Vec<Arc<SquadRuntime>> {
        self.runtimes.iter().map(|r| r.clone()).collect()
    }

    fn runtime_for(&self, squad_id: Uuid) -> Result<Arc<SquadRuntime>, ApiError> {
        self.runtimes
            .get(&squad_id)
            .map(|r| r.clone())
            .ok_or_else(|| ApiError::NotFound(format!("squad {squad_id} not found")))
    }

    fn runtime_for_task(&self, task: &Task) -> Result<Arc<SquadRuntime>, ApiError> {
        let squad_id = task
            .squad_id
            .ok_or_else(|| ApiError::BadRequest(format!("task {} has no squad", task.id)))?;
        self.runtime_for(squad_id)
    }
}

/// Build the full API router with all REST and WebSocket routes.
pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/squads", get(list_squads))
        .route("/api/squads", post(create_squad))
        .route("/api/squads/{id}", get(get_squad))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks", post(create_task))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/tasks/{id}/attempts", get(get_task_attempts))
        .route("/api/tasks/{id}/stream", get(task_stream_ws))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/{id}", get(get_approval))
        .route("/api/approvals/{id}/resolve", post(resolve_approval))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct StatusResponse {
    version: String,
    uptime_seconds: u64,
    squad_count: usize,
    pending_approvals: usize,
}

#[derive(Debug, Deserialize)]
pub struct CreateSquadRequest {
    pub name: String,
    pub org_id: Uuid,
    pub members: Vec<CreateMemberRequest>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMemberRequest {
    pub name: String,
    pub role: muster_core::types::AgentRole,
    pub specialization: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub org_id: Uuid,
    /// When present the task is assigned and driven immediately; when
    /// absent it stays `created` until a later assignment.
    pub squad_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct CancelTaskRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveApprovalRequest {
    pub decision: ApprovalDecision,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalQuery {
    pub status: Option<ApprovalStatus>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Last acknowledged cursor; chunks after it are replayed first.
    pub cursor: Option<u64>,
}

// ---------------------------------------------------------------------------
// Handlers — status
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<Json<StatusResponse>, ApiError> {
    let pending = state
        .approvals
        .approvals_by_status(Some(ApprovalStatus::Pending))
        .await?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        squad_count: state.runtimes.len(),
        pending_approvals: pending.len(),
    }))
}

// ---------------------------------------------------------------------------
// Handlers — squads
// ---------------------------------------------------------------------------

async fn create_squad(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateSquadRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let members: Vec<SquadMember> = req
        .members
        .into_iter()
        .map(|m| {
            let member = SquadMember::new(m.name, m.role);
            match m.specialization {
                Some(spec) => member.with_specialization(spec),
                None => member,
            }
        })
        .collect();
    let squad = Squad::new(req.name, req.org_id, members)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let squad = state.squads.create_squad(squad).await?;
    state.register_squad(squad.clone());
    tracing::info!(squad_id = %squad.id, name = %squad.name, "squad created");
    Ok((StatusCode::CREATED, Json(squad)))
}

async fn list_squads(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<Squad>>, ApiError> {
    Ok(Json(state.squads.list_squads().await?))
}

async fn get_squad(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Squad>, ApiError> {
    Ok(Json(state.squads.get_squad(id).await?))
}

// ---------------------------------------------------------------------------
// Handlers — tasks
// ---------------------------------------------------------------------------

async fn create_task(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut task = Task::new(req.title, req.kind, req.priority, req.org_id);
    if let Some(description) = req.description {
        task = task.with_description(description);
    }

    // A task without a squad is accepted as-is and stays `created`.
    let Some(squad_id) = req.squad_id else {
        let task = state.tasks.create_task(task).await?;
        return Ok((StatusCode::CREATED, Json(task)));
    };

    // The squad must exist before the task is accepted.
    state.squads.get_squad(squad_id).await?;
    let runtime = state.runtime_for(squad_id)?;
    let task = state.tasks.create_task(task.with_squad(squad_id)).await?;

    // Assignment is synchronous so capability mismatches surface in the
    // response; the run itself continues in the background.
    let handle = runtime.coordinator().assign_task(task.id).await?;
    let task = state.tasks.get_task(task.id).await?;
    let task_id = task.id;
    tokio::spawn(async move {
        match runtime.run_assigned(task_id, &handle).await {
            Ok(outcome) => tracing::info!(task_id = %task_id, ?outcome, "run settled"),
            Err(err) => tracing::error!(task_id = %task_id, error = %err, "run failed"),
        }
    });

    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TaskQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.tasks.tasks_by_status(query.status).await?))
}

async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.tasks.get_task(id).await?))
}

async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelTaskRequest>,
) -> Result<Json<Task>, ApiError> {
    let task = state.tasks.get_task(id).await?;
    let runtime = state.runtime_for_task(&task)?;
    let reason = req.reason.unwrap_or_else(|| "cancelled by operator".to_string());
    let task = runtime.cancel(id, reason).await?;
    Ok(Json(task))
}

async fn retry_task(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.tasks.get_task(id).await?;
    let runtime = state.runtime_for_task(&task)?;
    // Budget and state checks run inline; the re-run continues in the
    // background.
    let task = runtime
        .coordinator()
        .retry_task(id, state.execution.max_attempts)
        .await?;
    let assignees: Vec<Uuid> = runtime
        .squad()
        .capable_members(task.kind)
        .iter()
        .map(|m| m.agent_id)
        .collect();
    let handle = muster_engine::TaskHandle {
        task_id: id,
        squad_id: runtime.squad().id,
        assignees,
    };
    tokio::spawn(async move {
        match runtime.drive_retry(id, &handle).await {
            Ok(outcome) => tracing::info!(task_id = %id, ?outcome, "retry settled"),
            Err(err) => tracing::error!(task_id = %id, error = %err, "retry failed"),
        }
    });
    Ok((StatusCode::ACCEPTED, Json(task)))
}

async fn get_task_attempts(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ExecutionAttempt>>, ApiError> {
    let task = state.tasks.get_task(id).await?;
    let runtime = state.runtime_for_task(&task)?;
    Ok(Json(runtime.supervisor().attempts(id)))
}

// ---------------------------------------------------------------------------
// Handlers — approvals
// ---------------------------------------------------------------------------

async fn list_approvals(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<ApprovalQuery>,
) -> Result<Json<Vec<ApprovalRecord>>, ApiError> {
    Ok(Json(state.approvals.approvals_by_status(query.status).await?))
}

async fn get_approval(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApprovalRecord>, ApiError> {
    Ok(Json(state.approvals.get_approval(id).await?))
}

async fn resolve_approval(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResolveApprovalRequest>,
) -> Result<Json<ApprovalRecord>, ApiError> {
    let human = state.identity.resolve(&req.token).await?;
    let record = state.approvals.get_approval(id).await?;
    let runtime = state.runtime_for(record.squad_id)?;

    let (record, newly_resolved) = runtime.gate().resolve(id, req.decision, &human).await?;
    if newly_resolved && req.decision == ApprovalDecision::Approve {
        let runtime = runtime.clone();
        let record = record.clone();
        tokio::spawn(async move {
            if let Err(err) = runtime.resume_approved(&record).await {
                tracing::error!(request_id = %record.id, error = %err, "resume after approval failed");
            }
        });
    }
    Ok(Json(record))
}

// ---------------------------------------------------------------------------
// WebSocket — /api/tasks/{id}/stream with cursor resume
// ---------------------------------------------------------------------------

async fn task_stream_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let task = state.tasks.get_task(id).await?;
    let runtime = state.runtime_for_task(&task)?;
    let stream = runtime.streams().get_or_create(id);
    // An evicted cursor is rejected before the upgrade; the client
    // restarts from scratch instead of silently reading a gapped log.
    let rx = stream.subscribe_from(query.cursor.unwrap_or(0))?;
    Ok(ws.on_upgrade(move |socket| forward_stream(socket, rx)))
}

async fn forward_stream(socket: WebSocket, rx: flume::Receiver<Chunk>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut heartbeat = tokio::time::interval(std::time::Duration::from_secs(30));
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            result = rx.recv_async() => {
                match result {
                    Ok(chunk) => {
                        let json = serde_json::to_string(&StreamFrame::chunk(&chunk))
                            .unwrap_or_default();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            _ = heartbeat.tick() => {
                let json = serde_json::to_string(&StreamFrame::ping()).unwrap_or_default();
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
