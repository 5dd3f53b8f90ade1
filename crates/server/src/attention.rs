//! Attention / inbox router.
//!
//! Attention items are deduplicated, actionable requests (permission
//! prompts, blocking questions) surfaced by worker sessions. At most one
//! open item exists per signature; repeated creates touch the existing
//! row. Under the `orchestrator` question mode, new worker items are
//! batched into the orchestrator session and answered back through
//! `FYP_ANSWER_QUESTION_JSON` directives; unanswered items time out.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use flypad_protocol::{AttentionItem, AttentionOption, AttentionSeverity, AttentionStatus, QuestionMode};

use crate::directive_parser::QuestionAnswerDirective;
use crate::orchestration::{Orchestration, OrchestrationRegistry, PendingQuestion};
use crate::store::{now_ms, AttentionFilter, CreateAttentionOutcome, Store, StoreError};
use crate::supervisor::SessionSupervisor;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("unknown_attention")]
    Unknown,

    #[error("bad_input")]
    BadInput,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CreateAttention {
    pub session_id: String,
    pub kind: String,
    pub severity: AttentionSeverity,
    pub title: String,
    pub body: String,
    pub signature: String,
    pub options: Vec<AttentionOption>,
}

pub struct AttentionRouter {
    store: Arc<Store>,
    supervisor: Arc<SessionSupervisor>,
    registry: Arc<OrchestrationRegistry>,
}

impl AttentionRouter {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<SessionSupervisor>,
        registry: Arc<OrchestrationRegistry>,
    ) -> Self {
        Self {
            store,
            supervisor,
            registry,
        }
    }

    /// Create (or touch) an inbox item. New items for worker sessions
    /// are routed to the orchestrator when the automation policy says so.
    pub async fn create(self: &Arc<Self>, req: CreateAttention) -> Result<Value, RouterError> {
        let outcome = self.store.create_or_touch_attention(
            &req.session_id,
            &req.kind,
            req.severity,
            &req.title,
            &req.body,
            &req.signature,
            &req.options,
        )?;

        match outcome {
            CreateAttentionOutcome::Duplicate { existing_id } => Ok(json!({
                "ok": false,
                "reason": "duplicate",
                "existingId": existing_id,
            })),
            CreateAttentionOutcome::Created(id) => {
                // Record the triggering event under its own kind (e.g.
                // claude.permission, codex.approval) for the audit trail
                // and the digest whitelist.
                let _ = self.store.append_event(
                    &req.session_id,
                    &req.kind,
                    &json!({ "attentionId": id, "title": req.title }),
                );
                if self.try_yolo_auto_respond(&req.session_id, id).await {
                    return Ok(json!({ "ok": true, "id": id, "autoResolved": true }));
                }
                self.route_to_orchestrator(&req.session_id, id).await;
                Ok(json!({ "ok": true, "id": id }))
            }
        }
    }

    /// Yolo mode answers affirmative options without asking anyone.
    async fn try_yolo_auto_respond(self: &Arc<Self>, session_id: &str, attention_id: i64) -> bool {
        const AFFIRMATIVE: &[&str] = &["y", "yes", "allow", "approve", "always"];

        let Some(orch) = self.registry.find_by_worker(session_id).await else {
            return false;
        };
        {
            let state = orch.state.lock().await;
            if !state.automation.policy.yolo_mode {
                return false;
            }
        }
        let Ok(Some(item)) = self.store.get_attention(attention_id) else {
            return false;
        };
        let Some(option) = item
            .options
            .iter()
            .find(|o| AFFIRMATIVE.contains(&o.id.to_ascii_lowercase().as_str()))
        else {
            return false;
        };

        let option_id = option.id.clone();
        if let Err(e) = self
            .respond(attention_id, &option_id, Value::Null, Some("yolo"))
            .await
        {
            warn!(
                component = "attention",
                event = "attention.yolo_failed",
                attention_id = attention_id,
                error = %e,
                "Yolo auto-response failed"
            );
            return false;
        }
        info!(
            component = "attention",
            event = "attention.yolo_resolved",
            attention_id = attention_id,
            session_id = %session_id,
            "Attention item auto-approved by yolo mode"
        );
        true
    }

    /// Queue the item for the orchestrator and write a question batch,
    /// when the owning orchestration runs in orchestrator question mode.
    async fn route_to_orchestrator(self: &Arc<Self>, session_id: &str, attention_id: i64) {
        let Some(orch) = self.registry.find_by_worker(session_id).await else {
            return;
        };

        let timeout_ms = {
            let mut state = orch.state.lock().await;
            if state.automation.policy.question_mode != QuestionMode::Orchestrator {
                return;
            }
            state.pending_questions.push(PendingQuestion {
                attention_id,
                session_id: session_id.to_string(),
                queued_at: now_ms(),
            });
            state.automation.pending_question_count = state.pending_questions.len() as u32;
            state.automation.policy.question_timeout_ms
        };

        let batch = self.build_question_batch(&orch).await;
        if let Some(batch) = batch {
            let _ = self
                .supervisor
                .write(&orch.orchestrator_session_id, &format!("{batch}\r"))
                .await;
        }
        let _ = self.store.set_attention_status(attention_id, AttentionStatus::Sent);
        let _ = self.store.append_event(
            session_id,
            "orchestration.question.routed",
            &json!({ "attentionId": attention_id, "orchestrationId": orch.id }),
        );
        self.registry.persist(&orch).await;

        if timeout_ms > 0 {
            self.schedule_timeout(orch.clone(), attention_id, timeout_ms);
        }

        info!(
            component = "attention",
            event = "attention.routed",
            attention_id = attention_id,
            session_id = %session_id,
            orchestration_id = %orch.id,
            "Question routed to orchestrator"
        );
    }

    async fn build_question_batch(&self, orch: &Arc<Orchestration>) -> Option<String> {
        let pending = {
            let state = orch.state.lock().await;
            state.pending_questions.clone()
        };
        if pending.is_empty() {
            return None;
        }

        let mut out = String::from(
            "AUTOMATION QUESTION BATCH\n\
             Workers are blocked on the questions below. Answer each one with a single line:\n\
             FYP_ANSWER_QUESTION_JSON: {\"attentionId\": <id>, \"optionId\": \"<option id>\"}\n\n",
        );
        for question in &pending {
            let Ok(Some(item)) = self.store.get_attention(question.attention_id) else {
                continue;
            };
            let options = item
                .options
                .iter()
                .map(|o| format!("{} ({})", o.id, o.label))
                .collect::<Vec<_>>()
                .join(" | ");
            out.push_str(&format!(
                "- attentionId:{} [{}] {}\n  options: {}\n",
                item.id,
                &item.session_id[..item.session_id.len().min(8)],
                item.title,
                if options.is_empty() { "free-form" } else { options.as_str() }
            ));
        }
        Some(out)
    }

    fn schedule_timeout(self: &Arc<Self>, orch: Arc<Orchestration>, attention_id: i64, timeout_ms: u64) {
        let router = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;

            let still_pending = {
                let state = orch.state.lock().await;
                state
                    .pending_questions
                    .iter()
                    .any(|q| q.attention_id == attention_id)
            };
            if !still_pending {
                return;
            }
            let Ok(Some(item)) = router.store.get_attention(attention_id) else {
                return;
            };
            if !matches!(item.status, AttentionStatus::Open | AttentionStatus::Sent) {
                return;
            }

            let _ = router
                .store
                .set_attention_status(attention_id, AttentionStatus::Dismissed);
            let _ = router.store.append_attention_action(
                attention_id,
                &item.session_id,
                "timeout",
                &json!({}),
            );
            let _ = router.store.append_event(
                &item.session_id,
                "inbox.timeout",
                &json!({ "attentionId": attention_id }),
            );
            router.remove_pending(&orch, attention_id).await;
            router.registry.persist(&orch).await;

            info!(
                component = "attention",
                event = "attention.timeout",
                attention_id = attention_id,
                session_id = %item.session_id,
                "Question timed out and was dismissed"
            );
        });
    }

    async fn remove_pending(&self, orch: &Arc<Orchestration>, attention_id: i64) {
        let mut state = orch.state.lock().await;
        state
            .pending_questions
            .retain(|q| q.attention_id != attention_id);
        state.automation.pending_question_count = state.pending_questions.len() as u32;
    }

    /// Resolve an item by sending one of its options into the session.
    pub async fn respond(
        self: &Arc<Self>,
        id: i64,
        option_id: &str,
        meta: Value,
        source: Option<&str>,
    ) -> Result<Value, RouterError> {
        let item = self.store.get_attention(id)?.ok_or(RouterError::Unknown)?;
        let option = item
            .options
            .iter()
            .find(|o| o.id == option_id)
            .ok_or(RouterError::BadInput)?
            .clone();

        if let Err(e) = self.supervisor.write(&item.session_id, &option.send).await {
            // The session may already be gone; the resolution still lands.
            debug!(
                component = "attention",
                event = "attention.respond_write_failed",
                attention_id = id,
                session_id = %item.session_id,
                error = %e,
                "Failed to write response into session"
            );
        }

        self.store.set_attention_status(id, AttentionStatus::Resolved)?;
        let action_data = json!({
            "optionId": option_id,
            "source": source,
            "meta": meta,
        });
        self.store
            .append_attention_action(id, &item.session_id, "respond", &action_data)?;
        self.store
            .append_event(&item.session_id, "inbox.respond", &action_data)?;

        // Orchestration bookkeeping, when this item was queued.
        if let Some(orch) = self.registry.find_by_worker(&item.session_id).await {
            let was_pending = {
                let state = orch.state.lock().await;
                state.pending_questions.iter().any(|q| q.attention_id == id)
            };
            if was_pending {
                self.remove_pending(&orch, id).await;
                if source == Some("orchestrator") {
                    let mut state = orch.state.lock().await;
                    state.automation.question_dispatch_count += 1;
                }
                let _ = self.store.append_event(
                    &item.session_id,
                    "orchestration.question.answered",
                    &json!({ "attentionId": id, "optionId": option_id }),
                );
                self.registry.persist(&orch).await;
            }
        }

        Ok(json!({ "ok": true, "id": id, "optionId": option_id }))
    }

    /// Route an orchestrator-authored `FYP_ANSWER_QUESTION_JSON` answer.
    /// Items that are no longer open are silently dropped.
    pub async fn respond_from_orchestrator(
        self: &Arc<Self>,
        orchestration_id: &str,
        answer: QuestionAnswerDirective,
    ) {
        let item = match self.store.get_attention(answer.attention_id) {
            Ok(Some(item)) => item,
            _ => {
                debug!(
                    component = "attention",
                    event = "attention.answer_unknown",
                    attention_id = answer.attention_id,
                    orchestration_id = %orchestration_id,
                    "Orchestrator answered an unknown attention id"
                );
                return;
            }
        };
        if !matches!(item.status, AttentionStatus::Open | AttentionStatus::Sent) {
            debug!(
                component = "attention",
                event = "attention.answer_stale",
                attention_id = answer.attention_id,
                status = item.status.as_str(),
                "Orchestrator answered an already-settled item; dropped"
            );
            return;
        }

        if let Err(e) = self
            .respond(answer.attention_id, &answer.option_id, answer.meta, Some("orchestrator"))
            .await
        {
            warn!(
                component = "attention",
                event = "attention.answer_failed",
                attention_id = answer.attention_id,
                error = %e,
                "Failed to apply orchestrator answer"
            );
        }
    }

    /// Dismiss an item without sending anything.
    pub async fn dismiss(self: &Arc<Self>, id: i64) -> Result<Value, RouterError> {
        let item = self.store.get_attention(id)?.ok_or(RouterError::Unknown)?;
        self.store.set_attention_status(id, AttentionStatus::Dismissed)?;
        self.store
            .append_attention_action(id, &item.session_id, "dismiss", &json!({}))?;
        self.store
            .append_event(&item.session_id, "inbox.dismiss", &json!({ "attentionId": id }))?;

        if let Some(orch) = self.registry.find_by_worker(&item.session_id).await {
            self.remove_pending(&orch, id).await;
            self.registry.persist(&orch).await;
        }
        Ok(json!({ "ok": true, "id": id }))
    }

    pub fn list(&self, filter: &AttentionFilter, limit: u32) -> Result<Vec<AttentionItem>, RouterError> {
        Ok(self.store.list_open_attention(filter, limit)?)
    }

    pub fn counts(&self) -> Result<Vec<(String, i64)>, RouterError> {
        Ok(self.store.attention_counts()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::{OrchState, WorkerState};
    use flypad_protocol::{
        AutomationState, DispatchMode, StartupInfo, StartupState, SyncState, Tool, WorkerInfo,
    };
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    fn router_rig(question_mode: QuestionMode, yolo: bool) -> (Arc<Store>, Arc<AttentionRouter>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = Arc::new(SessionSupervisor::new(store.clone()));
        let registry = Arc::new(OrchestrationRegistry::new(
            store.clone(),
            supervisor.clone(),
        ));
        let router = Arc::new(AttentionRouter::new(
            store.clone(),
            supervisor,
            registry.clone(),
        ));

        let mut automation = AutomationState::default();
        automation.policy.question_mode = question_mode;
        automation.policy.yolo_mode = yolo;
        automation.policy.question_timeout_ms = 0; // no timeout task in tests

        let orch = Arc::new(Orchestration {
            id: "orch-attn".into(),
            name: "attn".into(),
            project_path: "/tmp".into(),
            created_at: now_ms(),
            orchestrator_session_id: "sid-orch".into(),
            workspace: None,
            state: Mutex::new(OrchState {
                status: flypad_protocol::OrchestrationStatus::Active,
                dispatch_mode: DispatchMode::Auto,
                workers: vec![WorkerState {
                    info: WorkerInfo {
                        name: "Worker A".into(),
                        session_id: "sid-worker".into(),
                        tool: Tool::Codex,
                        profile_id: "codex-default".into(),
                        branch: None,
                        worktree_path: None,
                        task_prompt: String::new(),
                        initial_dispatched: true,
                    },
                    pending_bootstrap: None,
                }],
                startup: StartupInfo {
                    state: StartupState::Running,
                    pending_session_ids: vec![],
                    dispatched_session_ids: vec![],
                },
                sync: SyncState::default(),
                automation,
                pending_questions: vec![],
            }),
            cleanup_lock: Mutex::new(()),
            sync_task: StdMutex::new(None),
            parser_task: StdMutex::new(None),
            review_task: StdMutex::new(None),
        });
        registry.insert_for_tests(orch);
        (store, router)
    }

    fn question(signature: &str) -> CreateAttention {
        CreateAttention {
            session_id: "sid-worker".into(),
            kind: "claude.permission".into(),
            severity: AttentionSeverity::Warn,
            title: "Allow network access?".into(),
            body: String::new(),
            signature: signature.to_string(),
            options: vec![
                AttentionOption {
                    id: "y".into(),
                    label: "Allow".into(),
                    send: "y\r".into(),
                },
                AttentionOption {
                    id: "n".into(),
                    label: "Deny".into(),
                    send: "n\r".into(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn duplicate_signature_returns_existing_id() {
        let (_store, router) = router_rig(QuestionMode::Inline, false);

        let first = router.create(question("sig-1")).await.unwrap();
        assert_eq!(first["ok"], true);
        let id = first["id"].as_i64().unwrap();

        let second = router.create(question("sig-1")).await.unwrap();
        assert_eq!(second["ok"], false);
        assert_eq!(second["reason"], "duplicate");
        assert_eq!(second["existingId"].as_i64().unwrap(), id);
    }

    #[tokio::test]
    async fn orchestrator_mode_queues_and_marks_sent() {
        let (store, router) = router_rig(QuestionMode::Orchestrator, false);

        let created = router.create(question("sig-q")).await.unwrap();
        let id = created["id"].as_i64().unwrap();

        let item = store.get_attention(id).unwrap().unwrap();
        assert_eq!(item.status, AttentionStatus::Sent);

        // The routing event is recorded under the worker session
        let events = store.list_events("sid-worker", None, 50).unwrap();
        assert!(events
            .iter()
            .any(|e| e.kind == "orchestration.question.routed"));
    }

    #[tokio::test]
    async fn orchestrator_answer_resolves_and_counts() {
        let (store, router) = router_rig(QuestionMode::Orchestrator, false);
        let created = router.create(question("sig-a")).await.unwrap();
        let id = created["id"].as_i64().unwrap();

        router
            .respond_from_orchestrator(
                "orch-attn",
                QuestionAnswerDirective {
                    attention_id: id,
                    option_id: "y".into(),
                    source: "fyp_answer_question_json".into(),
                    meta: Value::Null,
                },
            )
            .await;

        let item = store.get_attention(id).unwrap().unwrap();
        assert_eq!(item.status, AttentionStatus::Resolved);

        // A second answer to the settled item is silently dropped
        router
            .respond_from_orchestrator(
                "orch-attn",
                QuestionAnswerDirective {
                    attention_id: id,
                    option_id: "n".into(),
                    source: "fyp_answer_question_json".into(),
                    meta: Value::Null,
                },
            )
            .await;
        let item = store.get_attention(id).unwrap().unwrap();
        assert_eq!(item.status, AttentionStatus::Resolved);
    }

    #[tokio::test]
    async fn respond_rejects_unknown_ids_and_options() {
        let (_store, router) = router_rig(QuestionMode::Inline, false);
        assert!(matches!(
            router.respond(999, "y", Value::Null, None).await.unwrap_err(),
            RouterError::Unknown
        ));

        let created = router.create(question("sig-b")).await.unwrap();
        let id = created["id"].as_i64().unwrap();
        assert!(matches!(
            router
                .respond(id, "not-an-option", Value::Null, None)
                .await
                .unwrap_err(),
            RouterError::BadInput
        ));
    }

    #[tokio::test]
    async fn yolo_mode_auto_resolves_affirmative_options() {
        let (store, router) = router_rig(QuestionMode::Orchestrator, true);

        let created = router.create(question("sig-y")).await.unwrap();
        assert_eq!(created["autoResolved"], true);

        let id = created["id"].as_i64().unwrap();
        let item = store.get_attention(id).unwrap().unwrap();
        assert_eq!(item.status, AttentionStatus::Resolved);
    }

    #[tokio::test]
    async fn dismiss_marks_and_audits() {
        let (store, router) = router_rig(QuestionMode::Inline, false);
        let created = router.create(question("sig-d")).await.unwrap();
        let id = created["id"].as_i64().unwrap();

        router.dismiss(id).await.unwrap();
        let item = store.get_attention(id).unwrap().unwrap();
        assert_eq!(item.status, AttentionStatus::Dismissed);

        let events = store.list_events("sid-worker", None, 50).unwrap();
        assert!(events.iter().any(|e| e.kind == "inbox.dismiss"));
    }
}
