//! Digest sync scheduler.
//!
//! Per orchestration, assembles worker snapshots into a digest and
//! writes it to the orchestrator session — either on demand or on an
//! interval. Delivery is skipped when the digest hash hasn't moved, and
//! consecutive deliveries respect a minimum gap.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use flypad_protocol::{OrchestrationStatus, SyncMode, SyncPolicy};

use crate::digest::{
    self, WorkerObservation, DIGEST_EVENT_KINDS, DIGEST_EVENT_PREFIXES, PREVIEW_MAX_CHARS,
};
use crate::orchestration::{Orchestration, OrchestrationRegistry};
use crate::store::{now_ms, Store};
use crate::supervisor::SessionSupervisor;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub digest: DigestSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSummary {
    pub hash: String,
    pub generated_at: String,
    pub changes: usize,
    pub workers_running: usize,
    pub workers_total: usize,
}

pub struct SyncScheduler {
    store: Arc<Store>,
    supervisor: Arc<SessionSupervisor>,
    registry: Arc<OrchestrationRegistry>,
}

impl SyncScheduler {
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

    /// Run one sync pass. `force` delivers even when nothing changed;
    /// `deliver_override` overrides the policy's deliverToOrchestrator.
    pub async fn sync(
        self: &Arc<Self>,
        orch: &Arc<Orchestration>,
        force: bool,
        deliver_override: Option<bool>,
        trigger: &str,
    ) -> SyncOutcome {
        let now = now_ms();

        // Snapshot inputs under the state lock, observe outside it.
        let (workers, prev_snapshots, policy, last_hash, last_at) = {
            let state = orch.state.lock().await;
            let workers: Vec<(String, String, Option<String>, Option<String>)> = state
                .workers
                .iter()
                .map(|w| {
                    (
                        w.info.name.clone(),
                        w.info.session_id.clone(),
                        w.info.branch.clone(),
                        w.info.worktree_path.clone(),
                    )
                })
                .collect();
            (
                workers,
                state.sync.snapshots.clone(),
                state.sync.policy.clone(),
                state.sync.last_digest_hash.clone(),
                state.sync.last_digest_at,
            )
        };

        let mut snapshots = Vec::new();
        let mut changes = Vec::new();
        for (idx, (name, session_id, branch, tree_path)) in workers.iter().enumerate() {
            let observation = WorkerObservation {
                name: name.clone(),
                session_id: session_id.clone(),
                running: self.supervisor.is_running(session_id),
                attention: self.store.open_attention_count(session_id).unwrap_or(0),
                branch: branch.clone(),
                preview: None,
                preview_ts: None,
                last_event: self
                    .store
                    .last_event_matching(session_id, DIGEST_EVENT_KINDS, DIGEST_EVENT_PREFIXES)
                    .ok()
                    .flatten(),
                progress: tree_path
                    .as_deref()
                    .and_then(|p| digest::read_progress(Path::new(p))),
            };
            let observation = match self.store.output_preview(session_id, PREVIEW_MAX_CHARS) {
                Ok(Some((preview, ts))) => WorkerObservation {
                    preview: Some(preview),
                    preview_ts: Some(ts),
                    ..observation
                },
                _ => observation,
            };

            let prev = prev_snapshots.get(session_id);
            let snapshot = digest::snapshot_worker(&observation, prev, now);
            let bits = digest::change_bits(prev, &snapshot);
            if !bits.is_empty() {
                changes.push((idx, bits));
            }
            snapshots.push((name.clone(), session_id.clone(), snapshot));
        }

        let hash_entries: Vec<(String, String)> = snapshots
            .iter()
            .map(|(_, sid, snap)| (sid.clone(), snap.state_hash.clone()))
            .collect();
        let hash = digest::digest_hash(&hash_entries);
        let generated_at = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let summary = DigestSummary {
            hash: hash.clone(),
            generated_at: generated_at.clone(),
            changes: changes.iter().map(|(_, bits)| bits.len()).sum(),
            workers_running: snapshots.iter().filter(|(_, _, s)| s.running).count(),
            workers_total: snapshots.len(),
        };

        let deliver_allowed = deliver_override.unwrap_or(policy.deliver_to_orchestrator);
        let changed = last_hash.as_deref() != Some(hash.as_str());

        let mut sent = false;
        let mut reason = None;
        if !force && !changed {
            reason = Some("unchanged".to_string());
        } else if !deliver_allowed {
            reason = Some("collect_only".to_string());
        } else if !force
            && last_at.is_some_and(|at| now - at < policy.min_delivery_gap_ms as i64)
        {
            reason = Some("delivery_gap".to_string());
        } else {
            let worker_refs: Vec<(&str, &str, &flypad_protocol::WorkerSnapshot)> = snapshots
                .iter()
                .map(|(name, sid, snap)| (name.as_str(), sid.as_str(), snap))
                .collect();
            let text = digest::render_digest(&digest::DigestInput {
                orchestration_id: &orch.id,
                name: &orch.name,
                trigger,
                generated_at_iso: generated_at,
                workers: worker_refs,
                changes: changes.clone(),
                digest_hash: &hash,
            });
            if let Err(e) = self
                .supervisor
                .write(&orch.orchestrator_session_id, &format!("{text}\r"))
                .await
            {
                debug!(
                    component = "sync",
                    event = "sync.delivery_failed",
                    orchestration_id = %orch.id,
                    error = %e,
                    "Digest delivery failed"
                );
            }
            sent = true;
        }

        // Persist the new snapshot map; the digest hash pointer moves
        // on delivery and on collect-only passes, never on gap skips.
        {
            let mut state = orch.state.lock().await;
            state.sync.snapshots = snapshots
                .iter()
                .map(|(_, sid, snap)| (sid.clone(), snap.clone()))
                .collect();
            if sent {
                state.sync.last_digest_hash = Some(hash.clone());
                state.sync.last_digest_at = Some(now);
            } else if reason.as_deref() == Some("collect_only") {
                state.sync.last_digest_hash = Some(hash.clone());
            }
        }
        self.registry.persist(orch).await;

        let _ = self.store.append_event(
            &orch.orchestrator_session_id,
            "session.meta",
            &json!({
                "sync": { "trigger": trigger, "sent": sent, "reason": reason, "hash": hash }
            }),
        );

        SyncOutcome {
            sent,
            reason,
            digest: summary,
        }
    }

    /// (Re)start the interval task according to the current policy.
    pub fn apply_policy(self: &Arc<Self>, orch: &Arc<Orchestration>, policy: SyncPolicy) {
        let scheduler = self.clone();
        let orch_for_task = orch.clone();
        let interval_ms = policy.interval_ms.max(1_000);
        let mode = policy.mode;

        let previous = {
            let mut guard = orch.sync_task.lock().expect("sync_task poisoned");
            let handle = if mode == SyncMode::Interval {
                Some(tokio::spawn(async move {
                    let mut ticker =
                        tokio::time::interval(Duration::from_millis(interval_ms));
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    ticker.tick().await; // first tick is immediate
                    loop {
                        ticker.tick().await;
                        {
                            let state = orch_for_task.state.lock().await;
                            if state.status != OrchestrationStatus::Active {
                                break;
                            }
                        }
                        let _ = scheduler.sync(&orch_for_task, false, None, "interval").await;
                    }
                }))
            } else {
                None
            };
            std::mem::replace(&mut *guard, handle)
        };
        if let Some(previous) = previous {
            previous.abort();
        }

        info!(
            component = "sync",
            event = "sync.policy_applied",
            orchestration_id = %orch.id,
            mode = ?mode,
            interval_ms = interval_ms,
            "Sync policy applied"
        );
    }

    /// Update the stored policy and restart scheduling.
    pub async fn update_policy(self: &Arc<Self>, orch: &Arc<Orchestration>, policy: SyncPolicy) {
        {
            let mut state = orch.state.lock().await;
            state.sync.policy = policy.clone();
        }
        self.apply_policy(orch, policy.clone());
        self.registry.persist(orch).await;
        if let Err(e) = self.store.append_event(
            &orch.orchestrator_session_id,
            "session.meta",
            &json!({ "syncPolicy": policy }),
        ) {
            warn!(
                component = "sync",
                event = "sync.policy_event_failed",
                orchestration_id = %orch.id,
                error = %e,
                "Failed to record sync policy change"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flypad_protocol::{
        AutomationState, DispatchMode, StartupInfo, StartupState, SyncState, Tool, WorkerInfo,
    };
    use crate::orchestration::{OrchState, WorkerState};
    use crate::store::now_ms;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    fn test_rig() -> (Arc<Store>, Arc<SyncScheduler>, Arc<Orchestration>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let supervisor = Arc::new(SessionSupervisor::new(store.clone()));
        let registry = Arc::new(OrchestrationRegistry::new(
            store.clone(),
            supervisor.clone(),
        ));
        let scheduler = Arc::new(SyncScheduler::new(store.clone(), supervisor, registry));

        let worker = WorkerState {
            info: WorkerInfo {
                name: "Worker A".into(),
                session_id: "sid-worker".into(),
                tool: Tool::Codex,
                profile_id: "codex-default".into(),
                branch: Some("orch/o1/worker-a".into()),
                worktree_path: None,
                task_prompt: String::new(),
                initial_dispatched: true,
            },
            pending_bootstrap: None,
        };
        let orch = Arc::new(Orchestration {
            id: "orch-test".into(),
            name: "test".into(),
            project_path: "/tmp".into(),
            created_at: now_ms(),
            orchestrator_session_id: "sid-orch".into(),
            workspace: None,
            state: Mutex::new(OrchState {
                status: flypad_protocol::OrchestrationStatus::Active,
                dispatch_mode: DispatchMode::Auto,
                workers: vec![worker],
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

        // Session rows so events and attention counting work.
        for sid in ["sid-orch", "sid-worker"] {
            store
                .create_session(&flypad_protocol::SessionRecord {
                    id: sid.into(),
                    tool: Tool::Codex,
                    profile_id: "codex-default".into(),
                    tool_session_id: None,
                    cwd: "/tmp".into(),
                    workspace_key: None,
                    workspace_root: None,
                    tree_path: None,
                    label: None,
                    pinned_slot: None,
                    created_at: now_ms(),
                    updated_at: now_ms(),
                    exit: None,
                })
                .unwrap();
        }

        (store, scheduler, orch)
    }

    #[tokio::test]
    async fn forced_sync_sends_then_unchanged_skips() {
        let (_store, scheduler, orch) = test_rig();

        let first = scheduler.sync(&orch, true, None, "manual").await;
        assert!(first.sent);
        let hash = first.digest.hash.clone();

        let second = scheduler.sync(&orch, false, None, "manual").await;
        assert!(!second.sent);
        assert_eq!(second.reason.as_deref(), Some("unchanged"));
        assert_eq!(second.digest.hash, hash);
    }

    #[tokio::test]
    async fn whitelisted_event_changes_hash_generic_does_not() {
        let (store, scheduler, orch) = test_rig();

        let first = scheduler.sync(&orch, true, None, "manual").await;
        let hash = first.digest.hash.clone();

        // Generic runtime event: digest must not churn
        store
            .append_event("sid-worker", "input", &json!({"data": "ls"}))
            .unwrap();
        let second = scheduler.sync(&orch, false, None, "manual").await;
        assert!(!second.sent);
        assert_eq!(second.digest.hash, hash);

        // Whitelisted event: digest moves
        store
            .append_event("sid-worker", "inbox.respond", &json!({}))
            .unwrap();
        let third = scheduler.sync(&orch, true, None, "manual").await;
        assert_ne!(third.digest.hash, hash);
    }

    #[tokio::test]
    async fn collect_only_when_delivery_disabled() {
        let (_store, scheduler, orch) = test_rig();
        {
            let mut state = orch.state.lock().await;
            state.sync.policy.deliver_to_orchestrator = false;
        }

        let outcome = scheduler.sync(&orch, true, None, "manual").await;
        assert!(!outcome.sent);
        assert_eq!(outcome.reason.as_deref(), Some("collect_only"));

        // Override re-enables delivery
        let outcome = scheduler.sync(&orch, true, Some(true), "manual").await;
        assert!(outcome.sent);
    }

    #[tokio::test]
    async fn delivery_gap_holds_back_unforced_sends() {
        let (store, scheduler, orch) = test_rig();
        {
            let mut state = orch.state.lock().await;
            state.sync.policy.min_delivery_gap_ms = 60_000;
        }

        assert!(scheduler.sync(&orch, true, None, "manual").await.sent);

        // State changes, but the gap hasn't elapsed
        store
            .append_event("sid-worker", "session.exit", &json!({}))
            .unwrap();
        let outcome = scheduler.sync(&orch, false, None, "manual").await;
        assert!(!outcome.sent);
        assert_eq!(outcome.reason.as_deref(), Some("delivery_gap"));

        // Force bypasses the gap
        let outcome = scheduler.sync(&orch, true, None, "manual").await;
        assert!(outcome.sent);
    }
}
