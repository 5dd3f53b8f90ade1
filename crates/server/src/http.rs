//! HTTP surface.
//!
//! Thin handlers delegating to the core components. Every failure
//! surfaces a structured `{error, reason, ...}` object with a stable
//! string code.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use flypad_protocol::{
    AttentionOption, AttentionSeverity, DispatchMode, QuestionMode, SteeringMode, SyncMode, Tool,
};

use crate::attention::{CreateAttention, RouterError};
use crate::commands::GateError;
use crate::orchestration::{
    CreateOrchestration, DispatchRequest, EngineError, OrchestratorSpec, WorkerSpec,
};
use crate::pairing::PairError;
use crate::state::AppState;
use crate::store::{AttentionFilter, StoreError};
use crate::supervisor::{CreateSession, SupervisorError};
use crate::websocket::ws_handler;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        // Pairing
        .route("/pair/code", post(pair_code))
        .route("/pair/claim", post(pair_claim))
        // Sessions
        .route("/sessions", get(list_sessions).post(create_session))
        .route(
            "/sessions/{id}",
            get(get_session).delete(delete_session).patch(patch_session),
        )
        .route("/sessions/{id}/input", post(session_input))
        .route("/sessions/{id}/interrupt", post(session_interrupt))
        .route("/sessions/{id}/stop", post(session_stop))
        .route("/sessions/{id}/kill", post(session_kill))
        .route("/sessions/{id}/resize", post(session_resize))
        .route("/sessions/{id}/events", get(session_events))
        .route("/sessions/{id}/output", get(session_output))
        // Codex app-server bridge
        .route("/sessions/{id}/app-server/start", post(app_server_start))
        .route("/sessions/{id}/app-server/call", post(app_server_call))
        .route("/sessions/{id}/app-server/respond", post(app_server_respond))
        .route("/sessions/{id}/app-server/stop", post(app_server_stop))
        .route("/projects/recent", get(recent_projects))
        // Presets
        .route("/presets", get(list_presets).put(put_preset))
        // Inbox
        .route("/inbox", get(list_inbox).post(create_inbox))
        .route("/inbox/counts", get(inbox_counts))
        .route("/inbox/{id}/respond", post(inbox_respond))
        .route("/inbox/{id}/dismiss", post(inbox_dismiss))
        // Orchestrations
        .route("/orchestrations", get(list_orchestrations).post(create_orchestration))
        .route("/orchestrations/{id}", get(get_orchestration))
        .route("/orchestrations/{id}/progress", get(orchestration_progress))
        .route("/orchestrations/{id}/dispatch", post(orchestration_dispatch))
        .route("/orchestrations/{id}/send-task", post(orchestration_send_task))
        .route("/orchestrations/{id}/sync", post(orchestration_sync))
        .route("/orchestrations/{id}/sync-policy", patch(patch_sync_policy))
        .route("/orchestrations/{id}/automation", patch(patch_automation))
        .route("/orchestrations/{id}/cleanup", post(orchestration_cleanup))
        .route(
            "/orchestrations/{id}/commands/execute",
            post(execute_command),
        )
        .with_state(state)
}

// ── Error plumbing ────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn new(status: StatusCode, reason: &str) -> Self {
        Self {
            status,
            body: json!({ "error": true, "reason": reason }),
        }
    }

    fn with(status: StatusCode, reason: &str, extra: Value) -> Self {
        let mut body = json!({ "error": true, "reason": reason });
        if let (Some(map), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        Self { status, body }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<SupervisorError> for ApiError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::SessionExists => {
                ApiError::new(StatusCode::CONFLICT, "session_already_exists")
            }
            SupervisorError::UnknownSession => {
                ApiError::new(StatusCode::NOT_FOUND, "unknown_session")
            }
            SupervisorError::SpawnFailed(msg) => ApiError::with(
                StatusCode::BAD_GATEWAY,
                "spawn_failed",
                json!({ "detail": msg }),
            ),
            SupervisorError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SessionExists => {
                ApiError::new(StatusCode::CONFLICT, "session_already_exists")
            }
            StoreError::UnknownSession => ApiError::new(StatusCode::NOT_FOUND, "unknown_session"),
            StoreError::Sqlite(e) => ApiError::with(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                json!({ "detail": e.to_string() }),
            ),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Locked => ApiError::new(StatusCode::CONFLICT, "orchestration_locked"),
            EngineError::MissingProjectPath => {
                ApiError::new(StatusCode::BAD_REQUEST, "missing_projectPath")
            }
            EngineError::NoTargets { available } => ApiError::with(
                StatusCode::BAD_REQUEST,
                "no_targets",
                json!({ "availableTargets": available }),
            ),
            EngineError::Worktree(e) => {
                ApiError::new(StatusCode::BAD_GATEWAY, &e.to_string())
            }
            EngineError::Supervisor(e) => e.into(),
            EngineError::Store(e) => e.into(),
        }
    }
}

impl From<RouterError> for ApiError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Unknown => ApiError::new(StatusCode::NOT_FOUND, "unknown_attention"),
            RouterError::BadInput => ApiError::new(StatusCode::BAD_REQUEST, "bad_input"),
            RouterError::Store(e) => e.into(),
        }
    }
}

impl From<GateError> for ApiError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::UnknownCommand => ApiError::new(StatusCode::BAD_REQUEST, "unknown_command"),
            GateError::InvalidPayload(errors) => ApiError::with(
                StatusCode::BAD_REQUEST,
                "invalid_command_payload",
                json!({ "errors": errors }),
            ),
            GateError::PolicyBlocked(block) => ApiError::with(
                StatusCode::FORBIDDEN,
                "command_policy_blocked",
                json!({ "tier": block.tier, "unmet": block.unmet }),
            ),
            GateError::Engine(e) => e.into(),
            GateError::Store(e) => e.into(),
        }
    }
}

// ── Health & pairing ──────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": crate::VERSION }))
}

async fn pair_code(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "code": state.auth.create_pairing_code() }))
}

#[derive(Deserialize)]
struct PairClaimBody {
    code: String,
}

async fn pair_claim(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PairClaimBody>,
) -> Result<Json<Value>, ApiError> {
    match state.auth.claim(&body.code) {
        Ok(token) => Ok(Json(json!({ "token": token }))),
        Err(PairError::Locked) => Err(ApiError::new(StatusCode::LOCKED, "locked")),
        Err(PairError::Expired) => Err(ApiError::new(StatusCode::UNAUTHORIZED, "expired")),
        Err(PairError::InvalidCode) => {
            Err(ApiError::new(StatusCode::UNAUTHORIZED, "invalid_code"))
        }
    }
}

// ── Sessions ──────────────────────────────────────────────────────────

async fn list_sessions(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let sessions = state.store.list_sessions()?;
    let rows: Vec<Value> = sessions
        .into_iter()
        .map(|rec| {
            let running = state.supervisor.is_running(&rec.id);
            json!({ "session": rec, "running": running })
        })
        .collect();
    Ok(Json(json!({ "sessions": rows })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CreateSessionBody {
    id: Option<String>,
    tool: Option<Tool>,
    profile_id: Option<String>,
    cwd: Option<String>,
    extra_args: Vec<String>,
    env: std::collections::BTreeMap<String, String>,
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<Value>, ApiError> {
    // Workspace presets fill in the profile and env when the caller didn't.
    let mut profile_id = body.profile_id.clone();
    let mut env: Vec<(String, String)> = body.env.into_iter().collect();
    let mut extra_args = body.extra_args;
    if let (Some(cwd), Some(tool)) = (&body.cwd, body.tool) {
        if let Some(preset) = state.store.get_preset(cwd, tool)? {
            if profile_id.is_none() {
                profile_id = Some(preset.profile_id);
            }
            if let Some(preset_env) = preset.overrides.get("env").and_then(|e| e.as_object()) {
                for (key, value) in preset_env {
                    if let Some(value) = value.as_str() {
                        if !env.iter().any(|(k, _)| k == key) {
                            env.push((key.clone(), value.to_string()));
                        }
                    }
                }
            }
            if extra_args.is_empty() {
                if let Some(args) = preset.overrides.get("extraArgs").and_then(|a| a.as_array()) {
                    extra_args = args
                        .iter()
                        .filter_map(|a| a.as_str().map(str::to_string))
                        .collect();
                }
            }
        }
    }

    let id = state.supervisor.create(CreateSession {
        id: body.id,
        tool: body.tool,
        profile_id,
        cwd: body.cwd,
        extra_args,
        env,
        workspace_key: None,
        workspace_root: None,
        tree_path: None,
    })?;
    Ok(Json(json!({ "id": id })))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .store
        .get_session(&id)?
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_session"))?;
    let status = state.supervisor.status(&id).ok();
    Ok(Json(json!({ "session": record, "status": status })))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ForceQuery {
    force: bool,
}

async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ForceQuery>,
) -> Result<Json<Value>, ApiError> {
    if state.supervisor.is_running(&id) && !query.force {
        return Err(ApiError::new(StatusCode::CONFLICT, "session_running"));
    }
    state.supervisor.forget(&id);
    state.store.delete_session(&id)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct PatchSessionBody {
    label: Option<Option<String>>,
    pinned_slot: Option<Option<i64>>,
}

async fn patch_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<PatchSessionBody>,
) -> Result<Json<Value>, ApiError> {
    if let Some(label) = body.label {
        state.store.set_session_label(&id, label.as_deref())?;
    }
    if let Some(slot) = body.pinned_slot {
        if let Some(slot) = slot {
            if !(1..=6).contains(&slot) {
                return Err(ApiError::new(StatusCode::BAD_REQUEST, "bad_input"));
            }
        }
        state.store.set_pinned_slot(&id, slot)?;
    }
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct InputBody {
    data: String,
}

async fn session_input(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<InputBody>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.write(&id, &body.data).await?;
    let _ = state
        .store
        .append_event(&id, "input", &json!({ "bytes": body.data.len() }));
    Ok(Json(json!({ "ok": true })))
}

async fn session_interrupt(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.interrupt(&id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn session_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.stop(&id)?;
    Ok(Json(json!({ "ok": true })))
}

async fn session_kill(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.kill(&id)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct ResizeBody {
    cols: u16,
    rows: u16,
}

async fn session_resize(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ResizeBody>,
) -> Result<Json<Value>, ApiError> {
    state.supervisor.resize(&id, body.cols, body.rows)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct EventsQuery {
    after_id: Option<i64>,
    limit: Option<u32>,
}

async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Value>, ApiError> {
    let events = state
        .store
        .list_events(&id, query.after_id, query.limit.unwrap_or(200).min(1_000))?;
    Ok(Json(json!({ "events": events })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct OutputQuery {
    before_id: Option<i64>,
    limit: Option<u32>,
}

async fn session_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> Result<Json<Value>, ApiError> {
    let output = state
        .store
        .list_output(&id, query.before_id, query.limit.unwrap_or(100).min(500))?;
    Ok(Json(json!({ "output": output })))
}

// ── Codex app-server bridge ───────────────────────────────────────────

fn app_server_error(e: flypad_connectors::app_server::AppServerError) -> ApiError {
    ApiError::new(StatusCode::BAD_GATEWAY, &e.to_string())
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct AppServerStartBody {
    cwd: Option<String>,
    use_websocket: bool,
}

async fn app_server_start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AppServerStartBody>,
) -> Result<Json<Value>, ApiError> {
    let cwd = match body.cwd {
        Some(cwd) => Some(cwd),
        None => state.store.get_session(&id)?.map(|rec| rec.cwd),
    };
    state
        .codex
        .ensure_started(&id, cwd, body.use_websocket)
        .await
        .map_err(app_server_error)?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct AppServerCallBody {
    method: String,
    #[serde(default)]
    params: Value,
}

async fn app_server_call(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AppServerCallBody>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .codex
        .call(&id, &body.method, body.params)
        .await
        .map_err(app_server_error)?;
    Ok(Json(json!({ "ok": true, "result": result })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppServerRespondBody {
    rpc_id: Value,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

async fn app_server_respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AppServerRespondBody>,
) -> Result<Json<Value>, ApiError> {
    match body.error {
        Some(message) => state
            .codex
            .respond_error(&id, body.rpc_id, -32000, &message)
            .await
            .map_err(app_server_error)?,
        None => state
            .codex
            .respond(&id, body.rpc_id, body.result.unwrap_or(Value::Null))
            .await
            .map_err(app_server_error)?,
    }
    Ok(Json(json!({ "ok": true })))
}

async fn app_server_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.codex.stop(&id).await;
    Ok(Json(json!({ "ok": true })))
}

async fn recent_projects(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let projects: Vec<Value> = state
        .store
        .recent_projects()?
        .into_iter()
        .map(|(path, last_active)| json!({ "path": path, "lastActive": last_active }))
        .collect();
    Ok(Json(json!({ "projects": projects })))
}

// ── Presets ───────────────────────────────────────────────────────────

async fn list_presets(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({ "presets": state.store.list_presets()? })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PutPresetBody {
    path: String,
    tool: Tool,
    profile_id: String,
    #[serde(default)]
    overrides: Value,
}

async fn put_preset(
    State(state): State<Arc<AppState>>,
    Json(body): Json<PutPresetBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .store
        .set_preset(&body.path, body.tool, &body.profile_id, &body.overrides)?;
    Ok(Json(json!({ "ok": true })))
}

// ── Inbox ─────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct InboxQuery {
    session_id: Option<String>,
    workspace_key: Option<String>,
    cwd: Option<String>,
    limit: Option<u32>,
}

async fn list_inbox(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = if let Some(sid) = query.session_id {
        AttentionFilter::Session(sid)
    } else if let Some(key) = query.workspace_key {
        AttentionFilter::WorkspaceKey(key)
    } else if let Some(cwd) = query.cwd {
        AttentionFilter::Cwd(cwd)
    } else {
        AttentionFilter::Global
    };
    let items = state
        .attention
        .list(&filter, query.limit.unwrap_or(100).min(500))?;
    Ok(Json(json!({ "items": items })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateInboxBody {
    session_id: String,
    kind: String,
    #[serde(default = "default_severity")]
    severity: AttentionSeverity,
    title: String,
    #[serde(default)]
    body: String,
    signature: String,
    #[serde(default)]
    options: Vec<AttentionOption>,
}

fn default_severity() -> AttentionSeverity {
    AttentionSeverity::Info
}

async fn create_inbox(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateInboxBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .attention
        .create(CreateAttention {
            session_id: body.session_id,
            kind: body.kind,
            severity: body.severity,
            title: body.title,
            body: body.body,
            signature: body.signature,
            options: body.options,
        })
        .await?;
    Ok(Json(outcome))
}

async fn inbox_counts(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let counts: Vec<Value> = state
        .attention
        .counts()?
        .into_iter()
        .map(|(session_id, open)| json!({ "sessionId": session_id, "open": open }))
        .collect();
    Ok(Json(json!({ "counts": counts })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondBody {
    option_id: String,
    #[serde(default)]
    meta: Value,
    source: Option<String>,
}

async fn inbox_respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<RespondBody>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .attention
        .respond(id, &body.option_id, body.meta, body.source.as_deref())
        .await?;
    Ok(Json(outcome))
}

async fn inbox_dismiss(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.attention.dismiss(id).await?))
}

// ── Orchestrations ────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrchestratorBody {
    tool: Tool,
    profile_id: Option<String>,
    #[serde(default)]
    prompt: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerBody {
    name: String,
    tool: Option<Tool>,
    profile_id: Option<String>,
    #[serde(default)]
    task_prompt: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrchestrationBody {
    name: String,
    project_path: String,
    orchestrator: OrchestratorBody,
    workers: Vec<WorkerBody>,
    #[serde(default = "default_true")]
    auto_worktrees: bool,
    #[serde(default)]
    dispatch_mode: DispatchMode,
    #[serde(default = "default_true")]
    auto_dispatch_initial_prompts: bool,
}

fn default_true() -> bool {
    true
}

async fn create_orchestration(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateOrchestrationBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .create(CreateOrchestration {
            name: body.name,
            project_path: body.project_path,
            orchestrator: OrchestratorSpec {
                tool: body.orchestrator.tool,
                profile_id: body.orchestrator.profile_id,
                prompt: body.orchestrator.prompt,
            },
            workers: body
                .workers
                .into_iter()
                .map(|w| WorkerSpec {
                    name: w.name,
                    tool: w.tool,
                    profile_id: w.profile_id,
                    task_prompt: w.task_prompt,
                })
                .collect(),
            auto_worktrees: body.auto_worktrees,
            dispatch_mode: body.dispatch_mode,
            auto_dispatch_initial_prompts: body.auto_dispatch_initial_prompts,
        })
        .await?;
    Ok(Json(serde_json::to_value(orch.view().await).unwrap_or(Value::Null)))
}

async fn list_orchestrations(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let mut views = Vec::new();
    for orch in state.orchestrations.list() {
        views.push(orch.view().await);
    }
    Ok(Json(json!({ "orchestrations": views })))
}

async fn get_orchestration(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    Ok(Json(serde_json::to_value(orch.view().await).unwrap_or(Value::Null)))
}

async fn orchestration_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    let view = orch.view().await;
    Ok(Json(json!({
        "startup": view.startup,
        "sync": view.sync,
        "automation": view.automation,
        "status": view.status,
    })))
}

fn dispatch_response(outcome: &flypad_protocol::DispatchOutcome) -> Value {
    json!({
        "ok": true,
        "sent": outcome.sent,
        "failed": outcome.failed,
        "count": { "sent": outcome.sent.len(), "failed": outcome.failed.len() },
        "injectedBootstrap": outcome.injected_bootstrap,
        "interruptRequested": outcome.interrupt_requested,
    })
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct DispatchBody {
    target: String,
    #[serde(alias = "task")]
    text: String,
    interrupt: bool,
    force_interrupt: bool,
    #[serde(alias = "initialize")]
    include_bootstrap_if_present: bool,
}

async fn orchestration_dispatch(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DispatchBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    let outcome = state
        .orchestrations
        .dispatch(
            &orch,
            DispatchRequest {
                target: body.target,
                text: body.text,
                interrupt: body.interrupt,
                force_interrupt: body.force_interrupt,
                include_bootstrap_if_present: body.include_bootstrap_if_present,
                source: "api".into(),
            },
        )
        .await?;
    Ok(Json(dispatch_response(&outcome)))
}

async fn orchestration_send_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut body): Json<DispatchBody>,
) -> Result<Json<Value>, ApiError> {
    // send-task always offers the bootstrap to fresh workers
    body.include_bootstrap_if_present = true;
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    let outcome = state
        .orchestrations
        .dispatch(
            &orch,
            DispatchRequest {
                target: body.target,
                text: body.text,
                interrupt: body.interrupt,
                force_interrupt: body.force_interrupt,
                include_bootstrap_if_present: true,
                source: "api.send-task".into(),
            },
        )
        .await?;
    Ok(Json(dispatch_response(&outcome)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SyncBody {
    force: bool,
    deliver_to_orchestrator: Option<bool>,
}

async fn orchestration_sync(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SyncBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    let outcome = state
        .sync
        .sync(&orch, body.force, body.deliver_to_orchestrator, "manual")
        .await;
    Ok(Json(serde_json::to_value(outcome).unwrap_or(Value::Null)))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct SyncPolicyBody {
    mode: Option<SyncMode>,
    interval_ms: Option<u64>,
    deliver_to_orchestrator: Option<bool>,
    min_delivery_gap_ms: Option<u64>,
}

async fn patch_sync_policy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<SyncPolicyBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;

    let mut policy = { orch.state.lock().await.sync.policy.clone() };
    if let Some(mode) = body.mode {
        policy.mode = mode;
    }
    if let Some(interval) = body.interval_ms {
        policy.interval_ms = interval;
    }
    if let Some(deliver) = body.deliver_to_orchestrator {
        policy.deliver_to_orchestrator = deliver;
    }
    if let Some(gap) = body.min_delivery_gap_ms {
        policy.min_delivery_gap_ms = gap;
    }
    state.sync.update_policy(&orch, policy.clone()).await;
    Ok(Json(json!({ "ok": true, "policy": policy })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct AutomationBody {
    question_mode: Option<QuestionMode>,
    steering_mode: Option<SteeringMode>,
    yolo_mode: Option<bool>,
    question_timeout_ms: Option<u64>,
    review_interval_ms: Option<u64>,
}

async fn patch_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<AutomationBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;

    let mut policy = { orch.state.lock().await.automation.policy.clone() };
    if let Some(mode) = body.question_mode {
        policy.question_mode = mode;
    }
    if let Some(mode) = body.steering_mode {
        policy.steering_mode = mode;
    }
    if let Some(yolo) = body.yolo_mode {
        policy.yolo_mode = yolo;
    }
    if let Some(timeout) = body.question_timeout_ms {
        policy.question_timeout_ms = timeout;
    }
    if let Some(interval) = body.review_interval_ms {
        policy.review_interval_ms = interval;
    }
    state
        .orchestrations
        .apply_automation_policy(&orch, policy.clone())
        .await;
    Ok(Json(json!({ "ok": true, "policy": policy })))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct CleanupBody {
    stop_sessions: bool,
    delete_sessions: bool,
    remove_worktrees: bool,
}

async fn orchestration_cleanup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CleanupBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    let summary = state
        .orchestrations
        .cleanup(
            &orch,
            body.stop_sessions,
            body.delete_sessions,
            body.remove_worktrees,
        )
        .await?;
    Ok(Json(json!({
        "ok": true,
        "sessions": { "closed": summary.sessions_closed, "deleted": summary.sessions_deleted },
        "worktrees": { "removed": summary.worktrees_removed },
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteCommandBody {
    command_id: String,
    #[serde(default)]
    payload: Value,
}

async fn execute_command(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ExecuteCommandBody>,
) -> Result<Json<Value>, ApiError> {
    let orch = state
        .orchestrations
        .get(&id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "unknown_orchestration"))?;
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let payload = if body.payload.is_null() {
        json!({})
    } else {
        body.payload
    };
    let result = state
        .gate
        .execute(&orch, &body.command_id, &payload, idempotency_key.as_deref())
        .await?;
    Ok(Json(result.response))
}
