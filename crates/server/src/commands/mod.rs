//! Command execution gate.
//!
//! Validates named-command payloads against their envelopes, applies the
//! risk-tier policy, materializes a `COMMAND:` packet, and routes it by
//! execution mode. Successful responses are stored per
//! `(orchestration, idempotency-key)` and replayed verbatim, surviving
//! process restarts.

pub mod policy;
pub mod registry;
pub mod schema;

use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::orchestration::{DispatchRequest, EngineError, Orchestration, OrchestrationRegistry};
use crate::store::{Store, StoreError};
use crate::supervisor::SessionSupervisor;
use crate::sync::SyncScheduler;

use policy::PolicyBlock;
use registry::{CommandSpec, ExecutionMode};

#[derive(Debug, Error)]
pub enum GateError {
    #[error("unknown_command")]
    UnknownCommand,

    #[error("invalid_command_payload")]
    InvalidPayload(Vec<String>),

    #[error("command_policy_blocked")]
    PolicyBlocked(PolicyBlock),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CommandGate {
    store: Arc<Store>,
    supervisor: Arc<SessionSupervisor>,
    registry: Arc<OrchestrationRegistry>,
    scheduler: Arc<SyncScheduler>,
}

/// The execution result plus whether it was replayed from the store.
#[derive(Debug)]
pub struct ExecuteResult {
    pub response: Value,
    pub replayed: bool,
}

impl CommandGate {
    pub fn new(
        store: Arc<Store>,
        supervisor: Arc<SessionSupervisor>,
        registry: Arc<OrchestrationRegistry>,
        scheduler: Arc<SyncScheduler>,
    ) -> Self {
        Self {
            store,
            supervisor,
            registry,
            scheduler,
        }
    }

    pub async fn execute(
        &self,
        orch: &Arc<Orchestration>,
        command_id: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<ExecuteResult, GateError> {
        // Replays short-circuit everything, including validation.
        if let Some(key) = idempotency_key {
            if let Some(mut stored) = self.store.get_idempotent(&orch.id, key)? {
                if let Some(map) = stored.as_object_mut() {
                    map.insert("replayed".into(), Value::Bool(true));
                }
                return Ok(ExecuteResult {
                    response: stored,
                    replayed: true,
                });
            }
        }

        let spec = registry::find(command_id).ok_or(GateError::UnknownCommand)?;

        let result = schema::validate_payload(
            &registry::schema_for(spec),
            payload,
            spec.required_non_empty,
            spec.required_any_of,
        );
        if !result.ok() {
            return Err(GateError::InvalidPayload(result.errors));
        }

        policy::evaluate_policy(spec, payload, policy::high_risk_override_allowed())
            .map_err(GateError::PolicyBlocked)?;

        let mut response = self.run(orch, spec, payload).await?;
        if let Some(map) = response.as_object_mut() {
            map.insert("replayed".into(), Value::Bool(false));
        }

        if let Some(key) = idempotency_key {
            self.store.put_idempotent(
                &orch.id,
                key,
                spec.id,
                &payload_hash(payload),
                &response,
            )?;
        }

        info!(
            component = "commands",
            event = "command.executed",
            orchestration_id = %orch.id,
            command_id = %spec.id,
            mode = spec.mode.as_str(),
            tier = spec.tier.as_str(),
            "Command executed"
        );
        Ok(ExecuteResult {
            response,
            replayed: false,
        })
    }

    async fn run(
        &self,
        orch: &Arc<Orchestration>,
        spec: &CommandSpec,
        payload: &Value,
    ) -> Result<Value, GateError> {
        let base = json!({
            "ok": true,
            "commandId": spec.id,
            "mode": spec.mode.as_str(),
            "policy": { "tier": spec.tier.as_str() },
        });
        let mut response = base;

        match spec.mode {
            ExecutionMode::WorkerDispatch | ExecutionMode::WorkerSendTask => {
                let flag = |key: &str| payload.get(key).and_then(|v| v.as_bool()) == Some(true);
                let request = DispatchRequest {
                    target: payload
                        .get("target")
                        .and_then(|t| t.as_str())
                        .unwrap_or("all")
                        .to_string(),
                    text: materialize_packet(spec.id, payload),
                    interrupt: flag("interrupt"),
                    force_interrupt: flag("forceInterrupt"),
                    include_bootstrap_if_present: spec.mode == ExecutionMode::WorkerSendTask
                        || flag("initialize"),
                    source: format!("command:{}", spec.id),
                };
                let outcome = self.registry.dispatch(orch, request).await?;
                let map = response.as_object_mut().expect("response object");
                map.insert(
                    "count".into(),
                    json!({ "sent": outcome.sent.len(), "failed": outcome.failed.len() }),
                );
                map.insert("sent".into(), json!(outcome.sent));
                map.insert("failed".into(), json!(outcome.failed));
                map.insert("injectedBootstrap".into(), json!(outcome.injected_bootstrap));
                map.insert(
                    "interruptRequested".into(),
                    json!(outcome.interrupt_requested),
                );
            }
            ExecutionMode::OrchestratorInput => {
                let packet = materialize_packet(spec.id, payload);
                let _ = self
                    .supervisor
                    .write(&orch.orchestrator_session_id, &format!("{packet}\r"))
                    .await;
            }
            ExecutionMode::SystemSync => {
                let deliver = payload
                    .get("deliverToOrchestrator")
                    .and_then(|v| v.as_bool());
                let outcome = self.scheduler.sync(orch, true, deliver, "command").await;
                let map = response.as_object_mut().expect("response object");
                map.insert("sent".into(), json!(outcome.sent));
                if let Some(reason) = &outcome.reason {
                    map.insert("reason".into(), json!(reason));
                }
                map.insert("digest".into(), json!(outcome.digest));
            }
            ExecutionMode::SystemReview => {
                let packet = build_review_packet(spec.id, payload);
                let _ = self
                    .supervisor
                    .write(&orch.orchestrator_session_id, &format!("{packet}\r"))
                    .await;
            }
        }

        Ok(response)
    }
}

/// Template the dispatch fields into a `COMMAND:` packet. Only fields
/// present in the payload appear.
pub fn materialize_packet(command_id: &str, payload: &Value) -> String {
    let text_of = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    let mut out = format!("COMMAND: {command_id}\n");
    let task = ["task", "text", "objective", "rawPrompt"]
        .iter()
        .find_map(|key| text_of(key));
    if let Some(task) = task {
        out.push_str(&format!("TASK: {task}\n"));
    }
    for (key, label) in [
        ("scope", "SCOPE"),
        ("verify", "VERIFY"),
        ("notYourJob", "NOT YOUR JOB"),
        ("doneWhen", "DONE WHEN"),
        ("priority", "PRIORITY"),
        ("extra", "EXTRA"),
        ("notes", "NOTES"),
    ] {
        if let Some(value) = text_of(key) {
            out.push_str(&format!("{label}: {value}\n"));
        }
    }
    out.trim_end().to_string()
}

fn build_review_packet(command_id: &str, payload: &Value) -> String {
    let mut out = format!(
        "PERIODIC REVIEW ({command_id})\n\
         Walk every worker's recent output and current diff. Flag drift from the objective, stalled workers, and unresolved questions. Dispatch corrections where needed.\n"
    );
    if let Some(scope) = payload.get("scope").and_then(|s| s.as_str()) {
        out.push_str(&format!("Focus: {scope}\n"));
    }
    if let Some(notes) = payload.get("notes").and_then(|s| s.as_str()) {
        out.push_str(&format!("Notes: {notes}\n"));
    }
    out
}

fn payload_hash(payload: &Value) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, payload.to_string().as_bytes());
    digest
        .as_ref()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
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

    fn gate_rig() -> (Arc<Store>, CommandGate, Arc<Orchestration>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = Arc::new(SessionSupervisor::new(store.clone()));
        let registry = Arc::new(OrchestrationRegistry::new(
            store.clone(),
            supervisor.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(
            store.clone(),
            supervisor.clone(),
            registry.clone(),
        ));
        let gate = CommandGate::new(store.clone(), supervisor, registry, scheduler);

        let orch = Arc::new(Orchestration {
            id: "orch-gate".into(),
            name: "gate".into(),
            project_path: "/tmp".into(),
            created_at: 0,
            orchestrator_session_id: "sid-orch".into(),
            workspace: None,
            state: Mutex::new(OrchState {
                status: flypad_protocol::OrchestrationStatus::Active,
                dispatch_mode: DispatchMode::Auto,
                workers: vec![WorkerState {
                    info: WorkerInfo {
                        name: "Worker A".into(),
                        session_id: "sid-a".into(),
                        tool: Tool::Codex,
                        profile_id: "codex-default".into(),
                        branch: None,
                        worktree_path: None,
                        task_prompt: String::new(),
                        initial_dispatched: false,
                    },
                    pending_bootstrap: Some("bootstrap".into()),
                }],
                startup: StartupInfo {
                    state: StartupState::Running,
                    pending_session_ids: vec![],
                    dispatched_session_ids: vec![],
                },
                sync: SyncState::default(),
                automation: AutomationState::default(),
                pending_questions: vec![],
            }),
            cleanup_lock: Mutex::new(()),
            sync_task: StdMutex::new(None),
            parser_task: StdMutex::new(None),
            review_task: StdMutex::new(None),
        });
        (store, gate, orch)
    }

    #[test]
    fn materialize_packet_templates_fields() {
        let packet = materialize_packet(
            "coord-task",
            &json!({
                "task": "fix the race",
                "scope": "src/sync.rs",
                "doneWhen": "tests green",
                "priority": "high",
            }),
        );
        assert!(packet.starts_with("COMMAND: coord-task\n"));
        assert!(packet.contains("TASK: fix the race"));
        assert!(packet.contains("SCOPE: src/sync.rs"));
        assert!(packet.contains("DONE WHEN: tests green"));
        assert!(packet.contains("PRIORITY: high"));
        assert!(!packet.contains("NOTES:"));
    }

    #[tokio::test]
    async fn unknown_command_and_invalid_payload_are_rejected() {
        let (_store, gate, orch) = gate_rig();

        let err = gate
            .execute(&orch, "no-such-command", &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownCommand));

        let err = gate
            .execute(&orch, "coord-task", &json!({"bogus": 1}), None)
            .await
            .unwrap_err();
        match err {
            GateError::InvalidPayload(errors) => {
                assert!(errors.iter().any(|e| e.contains("unknown property")));
            }
            other => panic!("expected invalid payload, got {other}"),
        }

        // scope-lock without scope
        let err = gate
            .execute(&orch, "scope-lock", &json!({"target": "all"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn high_tier_blocked_without_policy_fields() {
        let (_store, gate, orch) = gate_rig();
        let err = gate
            .execute(
                &orch,
                "security-vuln-repro",
                &json!({"task": "repro the auth bypass"}),
                None,
            )
            .await
            .unwrap_err();
        match err {
            GateError::PolicyBlocked(block) => {
                assert_eq!(block.tier, "high");
                assert!(!block.unmet.is_empty());
            }
            other => panic!("expected policy block, got {other}"),
        }
    }

    #[tokio::test]
    async fn high_tier_accepts_with_full_policy() {
        let (_store, gate, orch) = gate_rig();
        let result = gate
            .execute(
                &orch,
                "security-vuln-repro",
                &json!({
                    "task": "repro the auth bypass",
                    "policyAck": true,
                    "policyReason": "confirm CVE exposure",
                    "policyApprovedBy": "sec-lead",
                    "rollbackPlan": "tear down staging env",
                    "policyAuthorizedScope": "staging",
                }),
                None,
            )
            .await
            .unwrap();
        assert_eq!(result.response["policy"]["tier"], "high");
        assert_eq!(result.response["ok"], true);
    }

    #[tokio::test]
    async fn idempotency_replays_stored_response() {
        let (store, gate, orch) = gate_rig();
        let payload = json!({"task": "collect logs", "target": "all"});

        let first = gate
            .execute(&orch, "diag-evidence", &payload, Some("k1"))
            .await
            .unwrap();
        assert!(!first.replayed);
        assert_eq!(first.response["replayed"], false);

        let second = gate
            .execute(&orch, "diag-evidence", &payload, Some("k1"))
            .await
            .unwrap();
        assert!(second.replayed);
        assert_eq!(second.response["replayed"], true);

        // Everything but the replay marker matches byte for byte
        let mut a = first.response.clone();
        let mut b = second.response.clone();
        a.as_object_mut().unwrap().remove("replayed");
        b.as_object_mut().unwrap().remove("replayed");
        assert_eq!(a, b);

        // The stored row survives a fresh gate over the same store
        assert!(store.get_idempotent("orch-gate", "k1").unwrap().is_some());
    }

    #[tokio::test]
    async fn send_task_injects_bootstrap_once() {
        let (_store, gate, orch) = gate_rig();

        let first = gate
            .execute(
                &orch,
                "coord-task",
                &json!({"task": "start here", "target": "worker:Worker A", "initialize": true}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(first.response["injectedBootstrap"], true);

        let second = gate
            .execute(
                &orch,
                "coord-task",
                &json!({"task": "continue", "target": "worker:Worker A", "interrupt": true}),
                None,
            )
            .await
            .unwrap();
        assert_eq!(second.response["injectedBootstrap"], false);
        assert_eq!(second.response["interruptRequested"], true);
    }
}
