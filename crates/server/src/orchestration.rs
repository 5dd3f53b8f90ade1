//! Orchestration engine.
//!
//! Creates one orchestrator session plus N worker sessions (each in its
//! own locked git worktree), seeds them with bootstrap packets, and
//! routes directives parsed from the orchestrator's output into worker
//! dispatches. Cleanup runs under a per-orchestration lock; contending
//! cleanups fail fast with `orchestration_locked`.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flypad_protocol::{
    AutomationState, DispatchFailure, DispatchMode, DispatchOutcome, OrchestrationStatus,
    OrchestrationView, StartupInfo, StartupState, SyncState, Tool, WorkerInfo,
};

use crate::directive_parser::{DirectiveParser, QuestionAnswerDirective, DEFAULT_DEDUPE_WINDOW_MS};
use crate::store::{now_ms, Store};
use crate::supervisor::{CreateSession, SessionSupervisor, SupervisorError};
use crate::worktree::{self, WorkspaceInfo, WorktreeError};

/// Grace between interrupt and the follow-up write during dispatch.
const DISPATCH_INTERRUPT_GRACE: Duration = Duration::from_millis(80);
/// Grace between interrupt and kill during cleanup.
const CLEANUP_STOP_GRACE: Duration = Duration::from_millis(400);
/// Objective extracted from the orchestrator prompt is capped here.
const OBJECTIVE_MAX_CHARS: usize = 2_000;
/// Containment check window when deciding whether a worker prompt
/// already carries the objective.
const OBJECTIVE_CONTAINS_CHARS: usize = 160;
/// Hard bound on an assembled bootstrap packet.
const BOOTSTRAP_MAX_CHARS: usize = 48_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("orchestration_locked")]
    Locked,

    #[error("missing_projectPath")]
    MissingProjectPath,

    #[error("no_targets")]
    NoTargets { available: Vec<String> },

    #[error(transparent)]
    Worktree(#[from] WorktreeError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorSpec {
    pub tool: Tool,
    pub profile_id: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub tool: Option<Tool>,
    pub profile_id: Option<String>,
    pub task_prompt: String,
}

#[derive(Debug, Clone)]
pub struct CreateOrchestration {
    pub name: String,
    pub project_path: String,
    pub orchestrator: OrchestratorSpec,
    pub workers: Vec<WorkerSpec>,
    pub auto_worktrees: bool,
    pub dispatch_mode: DispatchMode,
    pub auto_dispatch_initial_prompts: bool,
}

/// One worker plus its undelivered initial bootstrap packet.
pub(crate) struct WorkerState {
    pub(crate) info: WorkerInfo,
    pub(crate) pending_bootstrap: Option<String>,
}

pub(crate) struct OrchState {
    pub(crate) status: OrchestrationStatus,
    pub(crate) dispatch_mode: DispatchMode,
    pub(crate) workers: Vec<WorkerState>,
    pub(crate) startup: StartupInfo,
    pub(crate) sync: SyncState,
    pub(crate) automation: AutomationState,
    /// Worker attention items queued for the orchestrator to answer.
    pub(crate) pending_questions: Vec<PendingQuestion>,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingQuestion {
    pub(crate) attention_id: i64,
    pub(crate) session_id: String,
    pub(crate) queued_at: i64,
}

pub struct Orchestration {
    pub id: String,
    pub name: String,
    pub project_path: String,
    pub created_at: i64,
    pub orchestrator_session_id: String,
    pub workspace: Option<WorkspaceInfo>,
    pub(crate) state: Mutex<OrchState>,
    /// Held for the whole duration of a cleanup; contenders fail fast.
    pub(crate) cleanup_lock: Mutex<()>,
    pub(crate) sync_task: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) parser_task: StdMutex<Option<JoinHandle<()>>>,
    pub(crate) review_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Orchestration {
    pub async fn view(&self) -> OrchestrationView {
        let state = self.state.lock().await;
        OrchestrationView {
            id: self.id.clone(),
            name: self.name.clone(),
            project_path: self.project_path.clone(),
            created_at: self.created_at,
            status: state.status,
            dispatch_mode: state.dispatch_mode,
            orchestrator_session_id: self.orchestrator_session_id.clone(),
            workers: state.workers.iter().map(|w| w.info.clone()).collect(),
            startup: state.startup.clone(),
            sync: state.sync.clone(),
            automation: state.automation.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub target: String,
    pub text: String,
    pub interrupt: bool,
    pub force_interrupt: bool,
    pub include_bootstrap_if_present: bool,
    pub source: String,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub sessions_closed: u32,
    pub sessions_deleted: u32,
    pub worktrees_removed: u32,
}

pub struct OrchestrationRegistry {
    orchestrations: DashMap<String, Arc<Orchestration>>,
    store: Arc<Store>,
    supervisor: Arc<SessionSupervisor>,
    /// Orchestrator-authored answers flow out to the attention router.
    answer_tx: OnceLock<mpsc::Sender<(String, QuestionAnswerDirective)>>,
}

impl OrchestrationRegistry {
    pub fn new(store: Arc<Store>, supervisor: Arc<SessionSupervisor>) -> Self {
        Self {
            orchestrations: DashMap::new(),
            store,
            supervisor,
            answer_tx: OnceLock::new(),
        }
    }

    /// Wire the channel that carries orchestrator question answers to
    /// the attention router. Called once during startup.
    pub fn set_answer_tx(&self, tx: mpsc::Sender<(String, QuestionAnswerDirective)>) {
        let _ = self.answer_tx.set(tx);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Orchestration>> {
        self.orchestrations.get(id).map(|o| o.clone())
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(&self, orch: Arc<Orchestration>) {
        self.orchestrations.insert(orch.id.clone(), orch);
    }

    pub fn list(&self) -> Vec<Arc<Orchestration>> {
        self.orchestrations.iter().map(|o| o.clone()).collect()
    }

    /// Find the active orchestration owning a worker session.
    pub async fn find_by_worker(&self, session_id: &str) -> Option<Arc<Orchestration>> {
        for entry in self.orchestrations.iter() {
            let orch = entry.value().clone();
            let state = orch.state.lock().await;
            if state.status == OrchestrationStatus::Active
                && state.workers.iter().any(|w| w.info.session_id == session_id)
            {
                drop(state);
                return Some(orch);
            }
        }
        None
    }

    pub async fn create(
        self: &Arc<Self>,
        req: CreateOrchestration,
    ) -> Result<Arc<Orchestration>, EngineError> {
        if req.project_path.trim().is_empty() {
            return Err(EngineError::MissingProjectPath);
        }

        let id = flypad_protocol::new_id();
        let short_id: String = id.chars().take(8).collect();
        let created_at = now_ms();

        let workspace = match worktree::resolve_workspace(&req.project_path).await {
            Ok(info) => Some(info),
            Err(e) if req.auto_worktrees => return Err(EngineError::Worktree(e)),
            Err(_) => None,
        };

        // Provision worktrees before spawning anything — failures here
        // abort the create and roll back what was already made.
        let mut provisioned: Vec<(String, Option<worktree::CreatedWorktree>)> = Vec::new();
        if req.auto_worktrees {
            let root = workspace
                .as_ref()
                .map(|w| w.workspace_root.clone())
                .unwrap_or_else(|| req.project_path.clone());
            for worker in &req.workers {
                match worktree::create_worktree(&root, &short_id, &worker.name).await {
                    Ok(created) => provisioned.push((worker.name.clone(), Some(created))),
                    Err(e) => {
                        for created in provisioned.iter().filter_map(|(_, c)| c.as_ref()) {
                            let _ = worktree::remove_worktree(&root, &created.path).await;
                        }
                        return Err(EngineError::Worktree(e));
                    }
                }
            }
        } else {
            for worker in &req.workers {
                provisioned.push((worker.name.clone(), None));
            }
        }

        let objective = normalize_objective(&req.orchestrator.prompt);

        // Orchestrator session lives in the project root.
        let orchestrator_session_id = self.supervisor.create(CreateSession {
            tool: Some(req.orchestrator.tool),
            profile_id: req.orchestrator.profile_id.clone(),
            cwd: Some(req.project_path.clone()),
            workspace_key: workspace.as_ref().map(|w| w.workspace_key.clone()),
            workspace_root: workspace.as_ref().map(|w| w.workspace_root.clone()),
            ..Default::default()
        })?;

        // Worker sessions live in their worktrees. A failed spawn rolls
        // back everything spawned or provisioned so far.
        let mut workers: Vec<WorkerState> = Vec::new();
        for (spec, (_, created)) in req.workers.iter().zip(provisioned.iter()) {
            let tool = spec.tool.unwrap_or(req.orchestrator.tool);
            let cwd = created
                .as_ref()
                .map(|c| c.path.clone())
                .unwrap_or_else(|| req.project_path.clone());
            let session_id = match self.supervisor.create(CreateSession {
                tool: Some(tool),
                profile_id: spec.profile_id.clone(),
                cwd: Some(cwd.clone()),
                workspace_key: workspace.as_ref().map(|w| w.workspace_key.clone()),
                workspace_root: workspace.as_ref().map(|w| w.workspace_root.clone()),
                tree_path: created.as_ref().map(|c| c.path.clone()),
                ..Default::default()
            }) {
                Ok(session_id) => session_id,
                Err(e) => {
                    let _ = self.store.append_event(
                        &orchestrator_session_id,
                        "profile.startup_failed",
                        &json!({ "worker": spec.name, "reason": e.to_string() }),
                    );
                    self.supervisor.forget(&orchestrator_session_id);
                    for worker in &workers {
                        self.supervisor.forget(&worker.info.session_id);
                    }
                    if req.auto_worktrees {
                        let root = workspace
                            .as_ref()
                            .map(|w| w.workspace_root.clone())
                            .unwrap_or_else(|| req.project_path.clone());
                        for tree in provisioned.iter().filter_map(|(_, c)| c.as_ref()) {
                            let _ = worktree::remove_worktree(&root, &tree.path).await;
                        }
                    }
                    return Err(EngineError::Supervisor(e));
                }
            };

            let task_prompt = augment_task_prompt(&spec.task_prompt, objective.as_deref());
            workers.push(WorkerState {
                info: WorkerInfo {
                    name: spec.name.clone(),
                    session_id,
                    tool,
                    profile_id: spec
                        .profile_id
                        .clone()
                        .unwrap_or_else(|| crate::profiles::default_profile_id(tool)),
                    branch: created.as_ref().map(|c| c.branch.clone()),
                    worktree_path: created.as_ref().map(|c| c.path.clone()),
                    task_prompt: task_prompt.clone(),
                    initial_dispatched: false,
                },
                pending_bootstrap: Some(build_worker_bootstrap(
                    &req.name,
                    &spec.name,
                    objective.as_deref(),
                )),
            });
        }

        let auto_dispatch =
            req.dispatch_mode == DispatchMode::Auto && req.auto_dispatch_initial_prompts;
        let startup = StartupInfo {
            state: if auto_dispatch {
                StartupState::Running
            } else {
                StartupState::WaitingFirstDispatch
            },
            pending_session_ids: if auto_dispatch {
                Vec::new()
            } else {
                workers.iter().map(|w| w.info.session_id.clone()).collect()
            },
            dispatched_session_ids: Vec::new(),
        };

        let orch = Arc::new(Orchestration {
            id: id.clone(),
            name: req.name.clone(),
            project_path: req.project_path.clone(),
            created_at,
            orchestrator_session_id: orchestrator_session_id.clone(),
            workspace,
            state: Mutex::new(OrchState {
                status: OrchestrationStatus::Active,
                dispatch_mode: req.dispatch_mode,
                workers,
                startup,
                sync: SyncState::default(),
                automation: AutomationState::default(),
                pending_questions: Vec::new(),
            }),
            cleanup_lock: Mutex::new(()),
            sync_task: StdMutex::new(None),
            parser_task: StdMutex::new(None),
            review_task: StdMutex::new(None),
        });
        self.orchestrations.insert(id.clone(), orch.clone());

        // Seed the orchestrator: system packet enumerating workers and
        // the directive contract, then the operator's own prompt.
        {
            let state = orch.state.lock().await;
            let bootstrap = build_orchestrator_bootstrap(&orch, &state);
            drop(state);
            let _ = self
                .supervisor
                .write(&orchestrator_session_id, &format!("{bootstrap}\r"))
                .await;
            let _ = self.store.append_event(
                &orchestrator_session_id,
                "profile.startup",
                &json!({ "role": "orchestrator", "orchestrationId": id }),
            );
            if !req.orchestrator.prompt.trim().is_empty() {
                let _ = self
                    .supervisor
                    .write(&orchestrator_session_id, &format!("{}\r", req.orchestrator.prompt))
                    .await;
            }
        }

        if auto_dispatch {
            // Release every worker's bootstrap + task immediately.
            let mut state = orch.state.lock().await;
            for idx in 0..state.workers.len() {
                self.release_worker(&orch, &mut state, idx, true, "startup.auto")
                    .await;
            }
        } else {
            // Workers idle in WAIT MODE until the orchestrator dispatches.
            let state = orch.state.lock().await;
            for worker in &state.workers {
                let wait = build_wait_mode_packet(&req.name, &worker.info.name);
                let _ = self
                    .supervisor
                    .write(&worker.info.session_id, &format!("{wait}\r"))
                    .await;
            }
            drop(state);
            let quickstart = build_orchestrator_quickstart(&orch).await;
            let _ = self
                .supervisor
                .write(&orchestrator_session_id, &format!("{quickstart}\r"))
                .await;
        }

        self.spawn_directive_pump(orch.clone());
        self.persist(&orch).await;

        info!(
            component = "orchestration",
            event = "orchestration.created",
            orchestration_id = %id,
            name = %req.name,
            workers = req.workers.len(),
            dispatch_mode = ?req.dispatch_mode,
            "Orchestration created"
        );
        Ok(orch)
    }

    /// Subscribe the orchestrator session's output to the directive
    /// parser and execute what comes out, in buffer order.
    fn spawn_directive_pump(self: &Arc<Self>, orch: Arc<Orchestration>) {
        let Ok(mut output_rx) = self.supervisor.subscribe_output(&orch.orchestrator_session_id)
        else {
            return;
        };
        let registry = self.clone();
        let orch_for_task = orch.clone();
        let handle = tokio::spawn(async move {
            let orch = orch_for_task;
            let mut parser = DirectiveParser::new(DEFAULT_DEDUPE_WINDOW_MS);
            loop {
                let chunk = match output_rx.recv().await {
                    Ok(chunk) => chunk,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(
                            component = "orchestration",
                            event = "orchestration.parser_lagged",
                            orchestration_id = %orch.id,
                            skipped = skipped,
                            "Directive pump lagged behind output"
                        );
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };

                let text = String::from_utf8_lossy(&chunk);
                let parsed = parser.parse_chunk(&text, now_ms());

                for directive in parsed.dispatches {
                    let req = DispatchRequest {
                        target: directive.target,
                        text: directive.text,
                        interrupt: directive.interrupt,
                        force_interrupt: directive.force_interrupt,
                        include_bootstrap_if_present: directive.include_bootstrap_if_present,
                        source: directive.source,
                    };
                    if let Err(e) = registry.dispatch(&orch, req).await {
                        debug!(
                            component = "orchestration",
                            event = "orchestration.directive_dispatch_failed",
                            orchestration_id = %orch.id,
                            error = %e,
                            "Parsed dispatch failed"
                        );
                    }
                }
                for answer in parsed.question_answers {
                    if let Some(tx) = registry.answer_tx.get() {
                        let _ = tx.send((orch.id.clone(), answer)).await;
                    }
                }
            }
        });
        *orch.parser_task.lock().expect("parser_task poisoned") = Some(handle);
    }

    /// Deliver one prompt to the resolved target workers.
    pub async fn dispatch(
        &self,
        orch: &Arc<Orchestration>,
        req: DispatchRequest,
    ) -> Result<DispatchOutcome, EngineError> {
        let mut state = orch.state.lock().await;
        let targets = resolve_targets(&state.workers, &req.target)?;

        let mut outcome = DispatchOutcome::default();
        for idx in targets {
            let session_id = state.workers[idx].info.session_id.clone();
            let running = self.supervisor.is_running(&session_id);

            if req.interrupt || (req.force_interrupt && running) {
                outcome.interrupt_requested = true;
                if self.supervisor.interrupt(&session_id).is_ok() {
                    tokio::time::sleep(DISPATCH_INTERRUPT_GRACE).await;
                }
            }

            if req.include_bootstrap_if_present && state.workers[idx].pending_bootstrap.is_some() {
                outcome.injected_bootstrap = true;
                self.release_worker(orch, &mut state, idx, false, &req.source)
                    .await;
            }

            let write = if req.text.is_empty() {
                self.supervisor.write(&session_id, "\r").await
            } else {
                self.supervisor
                    .write(&session_id, &format!("{}\r", req.text))
                    .await
            };
            match write {
                Ok(()) => {
                    outcome.sent.push(session_id.clone());
                    self.mark_dispatched(&mut state, &session_id);
                }
                Err(e) => outcome.failed.push(DispatchFailure {
                    session_id,
                    reason: e.to_string(),
                }),
            }
        }
        drop(state);

        // The writes above complete before this event is appended.
        let _ = self.store.append_event(
            &orch.orchestrator_session_id,
            "orchestration.dispatch",
            &json!({
                "orchestrationId": orch.id,
                "target": req.target,
                "source": req.source,
                "sent": outcome.sent,
                "failed": outcome.failed,
            }),
        );
        self.persist(orch).await;
        Ok(outcome)
    }

    /// Write a worker's pending bootstrap (and in auto mode its task
    /// prompt), consuming it and updating the startup machine.
    async fn release_worker(
        &self,
        orch: &Arc<Orchestration>,
        state: &mut OrchState,
        idx: usize,
        with_task: bool,
        source: &str,
    ) {
        let session_id = state.workers[idx].info.session_id.clone();
        if let Some(bootstrap) = state.workers[idx].pending_bootstrap.take() {
            let _ = self
                .supervisor
                .write(&session_id, &format!("{bootstrap}\r"))
                .await;
        }
        if with_task {
            let task = state.workers[idx].info.task_prompt.clone();
            if !task.is_empty() {
                let _ = self
                    .supervisor
                    .write(&session_id, &format!("{task}\r"))
                    .await;
            }
        }
        state.workers[idx].info.initial_dispatched = true;
        self.mark_dispatched(state, &session_id);
        debug!(
            component = "orchestration",
            event = "orchestration.worker_released",
            orchestration_id = %orch.id,
            session_id = %session_id,
            source = %source,
            "Worker bootstrap released"
        );
    }

    fn mark_dispatched(&self, state: &mut OrchState, session_id: &str) {
        state
            .startup
            .pending_session_ids
            .retain(|sid| sid != session_id);
        if !state
            .startup
            .dispatched_session_ids
            .iter()
            .any(|sid| sid == session_id)
        {
            state
                .startup
                .dispatched_session_ids
                .push(session_id.to_string());
        }
        // The first released worker moves startup to running.
        if state.startup.state == StartupState::WaitingFirstDispatch {
            state.startup.state = StartupState::Running;
        }
    }

    /// Tear an orchestration down. Contending cleanups get `Locked`.
    pub async fn cleanup(
        &self,
        orch: &Arc<Orchestration>,
        stop_sessions: bool,
        delete_sessions: bool,
        remove_worktrees: bool,
    ) -> Result<CleanupSummary, EngineError> {
        let _guard = orch.cleanup_lock.try_lock().map_err(|_| EngineError::Locked)?;

        let (session_ids, worktrees) = {
            let state = orch.state.lock().await;
            let mut ids = vec![orch.orchestrator_session_id.clone()];
            ids.extend(state.workers.iter().map(|w| w.info.session_id.clone()));
            let trees: Vec<String> = state
                .workers
                .iter()
                .filter_map(|w| w.info.worktree_path.clone())
                .collect();
            (ids, trees)
        };

        let mut summary = CleanupSummary::default();

        if stop_sessions {
            for sid in &session_ids {
                if self.supervisor.is_running(sid) {
                    let _ = self.supervisor.interrupt(sid);
                }
            }
            tokio::time::sleep(CLEANUP_STOP_GRACE).await;
            for sid in &session_ids {
                if self.supervisor.is_running(sid) {
                    let _ = self.supervisor.kill(sid);
                }
                summary.sessions_closed += 1;
            }
        }

        if delete_sessions {
            for sid in &session_ids {
                self.supervisor.forget(sid);
                if self.store.delete_session(sid).is_ok() {
                    summary.sessions_deleted += 1;
                }
            }
        }

        if remove_worktrees {
            let root = orch
                .workspace
                .as_ref()
                .map(|w| w.workspace_root.clone())
                .unwrap_or_else(|| orch.project_path.clone());
            for tree in &worktrees {
                if worktree::remove_worktree(&root, tree).await {
                    summary.worktrees_removed += 1;
                }
            }
        }

        {
            let mut state = orch.state.lock().await;
            state.status = OrchestrationStatus::Cleaned;
        }
        if let Some(handle) = orch.sync_task.lock().expect("sync_task poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = orch.parser_task.lock().expect("parser_task poisoned").take() {
            handle.abort();
        }
        if let Some(handle) = orch.review_task.lock().expect("review_task poisoned").take() {
            handle.abort();
        }
        self.persist(orch).await;

        info!(
            component = "orchestration",
            event = "orchestration.cleaned",
            orchestration_id = %orch.id,
            closed = summary.sessions_closed,
            deleted = summary.sessions_deleted,
            worktrees = summary.worktrees_removed,
            "Orchestration cleaned"
        );
        Ok(summary)
    }

    pub async fn persist(&self, orch: &Arc<Orchestration>) {
        let view = orch.view().await;
        let status = match view.status {
            OrchestrationStatus::Active => "active",
            OrchestrationStatus::Cleaned => "cleaned",
        };
        if let Ok(data) = serde_json::to_value(&view) {
            if let Err(e) = self.store.save_orchestration(&orch.id, status, &data) {
                warn!(
                    component = "orchestration",
                    event = "orchestration.persist_failed",
                    orchestration_id = %orch.id,
                    error = %e,
                    "Failed to persist orchestration"
                );
            }
        }
    }

    /// Re-register orchestrations persisted by an earlier process. Their
    /// sessions did not survive the restart; state is kept for
    /// inspection and cleanup.
    pub fn restore_from_store(self: &Arc<Self>) {
        let rows = match self.store.load_orchestrations() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(
                    component = "orchestration",
                    event = "orchestration.restore_failed",
                    error = %e,
                    "Failed to load orchestrations"
                );
                return;
            }
        };
        for (id, _, data) in rows {
            let Ok(view) = serde_json::from_value::<OrchestrationView>(data) else {
                continue;
            };
            if view.status == OrchestrationStatus::Active {
                info!(
                    component = "orchestration",
                    event = "orchestration.restored_degraded",
                    orchestration_id = %id,
                    "Restored active orchestration whose sessions are gone"
                );
            }
            let orch = Arc::new(Orchestration {
                id: view.id.clone(),
                name: view.name.clone(),
                project_path: view.project_path.clone(),
                created_at: view.created_at,
                orchestrator_session_id: view.orchestrator_session_id.clone(),
                workspace: None,
                state: Mutex::new(OrchState {
                    status: view.status,
                    dispatch_mode: view.dispatch_mode,
                    workers: view
                        .workers
                        .into_iter()
                        .map(|info| WorkerState {
                            info,
                            pending_bootstrap: None,
                        })
                        .collect(),
                    startup: view.startup,
                    sync: view.sync,
                    automation: view.automation,
                    pending_questions: Vec::new(),
                }),
                cleanup_lock: Mutex::new(()),
                sync_task: StdMutex::new(None),
                parser_task: StdMutex::new(None),
            review_task: StdMutex::new(None),
            });
            self.orchestrations.insert(id, orch);
        }
    }

    /// Update the automation policy and (re)start the passive-review
    /// loop when steering asks for it.
    pub async fn apply_automation_policy(
        self: &Arc<Self>,
        orch: &Arc<Orchestration>,
        policy: flypad_protocol::AutomationPolicy,
    ) {
        {
            let mut state = orch.state.lock().await;
            state.automation.policy = policy.clone();
        }

        let handle = if policy.steering_mode == flypad_protocol::SteeringMode::PassiveReview {
            let registry = self.clone();
            let orch_for_task = orch.clone();
            let interval_ms = policy.review_interval_ms.max(10_000);
            Some(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(interval_ms));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    {
                        let state = orch_for_task.state.lock().await;
                        if state.status != OrchestrationStatus::Active {
                            break;
                        }
                    }
                    let packet = "PERIODIC REVIEW\n\
                         Walk every worker's recent output. Flag drift from the objective, stalled workers, and unresolved questions. Dispatch corrections where needed.";
                    let _ = registry
                        .supervisor
                        .write(&orch_for_task.orchestrator_session_id, &format!("{packet}\r"))
                        .await;
                }
            }))
        } else {
            None
        };
        let previous = {
            let mut guard = orch.review_task.lock().expect("review_task poisoned");
            std::mem::replace(&mut *guard, handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }

        self.persist(orch).await;
    }

    /// Abort background tasks for shutdown.
    pub fn shutdown(&self) {
        for entry in self.orchestrations.iter() {
            let orch = entry.value();
            if let Some(handle) = orch.sync_task.lock().expect("sync_task poisoned").take() {
                handle.abort();
            }
            if let Some(handle) = orch.parser_task.lock().expect("parser_task poisoned").take() {
                handle.abort();
            }
            if let Some(handle) = orch.review_task.lock().expect("review_task poisoned").take() {
                handle.abort();
            }
        }
    }
}

/// Resolve a dispatch target expression into worker indices.
pub(crate) fn resolve_targets(
    workers: &[WorkerState],
    target: &str,
) -> Result<Vec<usize>, EngineError> {
    let trimmed = target.trim();
    let available = || {
        workers
            .iter()
            .map(|w| format!("worker:{}", w.info.name))
            .collect::<Vec<_>>()
    };

    if trimmed.is_empty() {
        return Err(EngineError::NoTargets {
            available: available(),
        });
    }
    if trimmed.eq_ignore_ascii_case("all") {
        if workers.is_empty() {
            return Err(EngineError::NoTargets { available: vec![] });
        }
        return Ok((0..workers.len()).collect());
    }
    if let Some(sid) = trimmed.strip_prefix("session:") {
        if let Some(idx) = workers.iter().position(|w| w.info.session_id == sid) {
            return Ok(vec![idx]);
        }
        return Err(EngineError::NoTargets {
            available: available(),
        });
    }
    if let Ok(index) = trimmed.parse::<usize>() {
        if index >= 1 && index <= workers.len() {
            return Ok(vec![index - 1]);
        }
        return Err(EngineError::NoTargets {
            available: available(),
        });
    }

    let name = trimmed.strip_prefix("worker:").unwrap_or(trimmed);
    let name_slug = worktree::slug(name);
    if let Some(idx) = workers.iter().position(|w| {
        w.info.name.eq_ignore_ascii_case(name) || worktree::slug(&w.info.name) == name_slug
    }) {
        return Ok(vec![idx]);
    }
    Err(EngineError::NoTargets {
        available: available(),
    })
}

/// Extract a concise objective from the orchestrator prompt.
pub fn normalize_objective(prompt: &str) -> Option<String> {
    static OBJECTIVE_RE: OnceLock<Regex> = OnceLock::new();
    let re = OBJECTIVE_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:you are coordinating(?: a team)?\.\s*)?(?:goal|objective)\s*:\s*(.+)$",
        )
        .expect("objective regex")
    });

    for line in prompt.lines() {
        if let Some(caps) = re.captures(line.trim()) {
            let candidate = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
            if candidate.is_empty() || candidate.contains("<prompt>") {
                continue;
            }
            return Some(cap_chars(candidate, OBJECTIVE_MAX_CHARS));
        }
    }

    // Fall back to the first sentence.
    let first = prompt
        .split(['.', '\n'])
        .map(str::trim)
        .find(|s| !s.is_empty())?;
    if first.contains("<prompt>") {
        return None;
    }
    Some(cap_chars(first, OBJECTIVE_MAX_CHARS))
}

/// Append the objective context to a worker task prompt unless the
/// prompt already carries it.
pub fn augment_task_prompt(task_prompt: &str, objective: Option<&str>) -> String {
    let Some(objective) = objective else {
        return task_prompt.to_string();
    };
    let probe = cap_chars(objective, OBJECTIVE_CONTAINS_CHARS);
    if !probe.is_empty() && task_prompt.contains(&probe) {
        return task_prompt.to_string();
    }
    format!("{task_prompt}\n\nOBJECTIVE CONTEXT (must be satisfied):\n{objective}")
}

fn build_orchestrator_bootstrap(orch: &Orchestration, state: &OrchState) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "You are the orchestrator for \"{}\" (orchestration {}). You direct the worker sessions listed below; you never edit files yourself.\n\n",
        orch.name, orch.id
    ));
    out.push_str("Workers:\n");
    for (idx, worker) in state.workers.iter().enumerate() {
        out.push_str(&format!(
            "- #{} {} → session:{}{}\n",
            idx + 1,
            worker.info.name,
            worker.info.session_id,
            worker
                .info
                .branch
                .as_deref()
                .map(|b| format!(" (branch {b})"))
                .unwrap_or_default()
        ));
    }
    // The template tasks below stay inside the parser's placeholder
    // filter so echoes of this packet are never dispatched.
    out.push_str(
        "\nTo command a worker, emit exactly one directive per line in your output:\n\
         FYP_SEND_TASK_JSON: {\"target\": \"worker:<name>\", \"task\": \"<task prompt>\", \"initialize\": true}\n\
         FYP_DISPATCH_JSON: {\"target\": \"worker:<name>|all|<index>\", \"task\": \"<task prompt>\", \"interrupt\": false}\n\
         FYP_ANSWER_QUESTION_JSON: {\"attentionId\": <id>, \"optionId\": \"<option>\"}\n\
         Targets also accept session:<sessionId>. Set \"interruptMode\": \"force\" only to abort a busy worker.\n",
    );
    cap_chars(&out, BOOTSTRAP_MAX_CHARS)
}

async fn build_orchestrator_quickstart(orch: &Orchestration) -> String {
    let state = orch.state.lock().await;
    let roster: Vec<String> = state
        .workers
        .iter()
        .map(|w| format!("worker:{}", w.info.name))
        .collect();
    drop(state);
    let text = format!(
        "ORCHESTRATOR QUICKSTART\n\
         All workers are idle in WAIT MODE holding their task briefs. Nothing runs until you dispatch.\n\
         Release a worker's initial task with:\n\
         FYP_SEND_TASK_JSON: {{\"target\": \"{}\", \"task\": \"<first instruction>\", \"initialize\": true}}\n\
         Available targets: {}.\n",
        roster.first().map(String::as_str).unwrap_or("all"),
        roster.join(", ")
    );
    cap_chars(&text, BOOTSTRAP_MAX_CHARS)
}

fn build_wait_mode_packet(orchestration_name: &str, worker_name: &str) -> String {
    format!(
        "WAIT MODE\n\
         You are worker \"{worker_name}\" in orchestration \"{orchestration_name}\".\n\
         Do not start any work yet. Your task will arrive from the orchestrator as a message beginning with TASK. Until then, reply only with: ready.\n"
    )
}

fn build_worker_bootstrap(
    orchestration_name: &str,
    worker_name: &str,
    objective: Option<&str>,
) -> String {
    let mut out = format!(
        "You are worker \"{worker_name}\" in orchestration \"{orchestration_name}\".\n\
         Work only inside your own checkout. Commit as you go. Surface blocking questions instead of guessing.\n"
    );
    if let Some(objective) = objective {
        out.push_str(&format!("\nTeam objective:\n{objective}\n"));
    }
    cap_chars(&out, BOOTSTRAP_MAX_CHARS)
}

fn cap_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str, sid: &str) -> WorkerState {
        WorkerState {
            info: WorkerInfo {
                name: name.into(),
                session_id: sid.into(),
                tool: Tool::Codex,
                profile_id: "codex-default".into(),
                branch: None,
                worktree_path: None,
                task_prompt: String::new(),
                initial_dispatched: false,
            },
            pending_bootstrap: None,
        }
    }

    #[test]
    fn resolve_targets_all_forms() {
        let workers = vec![worker("Worker A", "sid-a"), worker("Worker B", "sid-b")];

        assert_eq!(resolve_targets(&workers, "all").unwrap(), vec![0, 1]);
        assert_eq!(resolve_targets(&workers, "2").unwrap(), vec![1]);
        assert_eq!(resolve_targets(&workers, "session:sid-a").unwrap(), vec![0]);
        assert_eq!(resolve_targets(&workers, "worker:Worker B").unwrap(), vec![1]);
        assert_eq!(resolve_targets(&workers, "worker:worker-b").unwrap(), vec![1]);
        assert_eq!(resolve_targets(&workers, "Worker A").unwrap(), vec![0]);
    }

    #[test]
    fn resolve_targets_unknown_lists_available() {
        let workers = vec![worker("Worker A", "sid-a")];
        match resolve_targets(&workers, "worker:nope").unwrap_err() {
            EngineError::NoTargets { available } => {
                assert_eq!(available, vec!["worker:Worker A".to_string()]);
            }
            other => panic!("expected NoTargets, got {other}"),
        }
        assert!(matches!(
            resolve_targets(&workers, "0").unwrap_err(),
            EngineError::NoTargets { .. }
        ));
        assert!(matches!(
            resolve_targets(&workers, "session:unknown").unwrap_err(),
            EngineError::NoTargets { .. }
        ));
    }

    #[test]
    fn normalize_objective_prefers_goal_line() {
        let prompt = "You are coordinating a team.\nGoal: ship the payments refactor by Friday\nDetails follow.";
        assert_eq!(
            normalize_objective(prompt).as_deref(),
            Some("ship the payments refactor by Friday")
        );

        let prompt = "objective:   keep the build green  ";
        assert_eq!(
            normalize_objective(prompt).as_deref(),
            Some("keep the build green")
        );
    }

    #[test]
    fn normalize_objective_rejects_placeholder_and_falls_back() {
        let prompt = "Goal: <prompt>\nRefactor the ingest pipeline. Then test it.";
        assert_eq!(
            normalize_objective(prompt).as_deref(),
            Some("Refactor the ingest pipeline")
        );
        assert_eq!(normalize_objective(""), None);
    }

    #[test]
    fn normalize_objective_caps_length() {
        let long = format!("Goal: {}", "x".repeat(5_000));
        assert_eq!(
            normalize_objective(&long).unwrap().chars().count(),
            OBJECTIVE_MAX_CHARS
        );
    }

    #[test]
    fn augment_task_prompt_appends_once() {
        let objective = "ship the payments refactor";
        let augmented = augment_task_prompt("Fix the tests", Some(objective));
        assert!(augmented.contains("OBJECTIVE CONTEXT (must be satisfied):"));
        assert!(augmented.contains(objective));

        // Already contains the objective prefix: left untouched
        let already = format!("Do this. Context: {objective}");
        assert_eq!(augment_task_prompt(&already, Some(objective)), already);

        assert_eq!(augment_task_prompt("plain", None), "plain");
    }

    #[test]
    fn wait_mode_and_quickstart_packets_carry_markers() {
        let wait = build_wait_mode_packet("release", "Worker A");
        assert!(wait.starts_with("WAIT MODE"));
        assert!(wait.contains("Worker A"));

        let bootstrap = build_worker_bootstrap("release", "Worker A", Some("goal text"));
        assert!(bootstrap.contains("goal text"));
    }
}
