//! Process-wide application state.
//!
//! One `AppState` owns every core component. Construction wires the
//! answer channel from the orchestration engine's directive pump into
//! the attention router; `shutdown` tears components down in reverse
//! dependency order.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::attention::AttentionRouter;
use crate::codex_appserver::CodexAppServerManager;
use crate::commands::CommandGate;
use crate::orchestration::OrchestrationRegistry;
use crate::pairing::AuthService;
use crate::store::Store;
use crate::supervisor::SessionSupervisor;
use crate::sync::SyncScheduler;

pub struct AppState {
    pub store: Arc<Store>,
    pub supervisor: Arc<SessionSupervisor>,
    pub orchestrations: Arc<OrchestrationRegistry>,
    pub attention: Arc<AttentionRouter>,
    pub sync: Arc<SyncScheduler>,
    pub gate: Arc<CommandGate>,
    pub codex: Arc<CodexAppServerManager>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub fn new(store: Arc<Store>, auth: Arc<AuthService>) -> Arc<Self> {
        let supervisor = Arc::new(SessionSupervisor::new(store.clone()));
        let orchestrations = Arc::new(OrchestrationRegistry::new(
            store.clone(),
            supervisor.clone(),
        ));
        let sync = Arc::new(SyncScheduler::new(
            store.clone(),
            supervisor.clone(),
            orchestrations.clone(),
        ));
        let attention = Arc::new(AttentionRouter::new(
            store.clone(),
            supervisor.clone(),
            orchestrations.clone(),
        ));
        let gate = Arc::new(CommandGate::new(
            store.clone(),
            supervisor.clone(),
            orchestrations.clone(),
            sync.clone(),
        ));

        // Orchestrator-authored question answers flow from the directive
        // pump into the attention router.
        let (answer_tx, mut answer_rx) = mpsc::channel(64);
        orchestrations.set_answer_tx(answer_tx);
        let router = attention.clone();
        tokio::spawn(async move {
            while let Some((orchestration_id, answer)) = answer_rx.recv().await {
                router
                    .respond_from_orchestrator(&orchestration_id, answer)
                    .await;
            }
        });

        orchestrations.restore_from_store();

        // Restored interval-mode orchestrations resume their schedulers.
        let sync_for_restore = sync.clone();
        let orchestrations_for_restore = orchestrations.clone();
        tokio::spawn(async move {
            for orch in orchestrations_for_restore.list() {
                let policy = {
                    let state = orch.state.lock().await;
                    if state.status != flypad_protocol::OrchestrationStatus::Active {
                        continue;
                    }
                    state.sync.policy.clone()
                };
                if policy.mode == flypad_protocol::SyncMode::Interval {
                    sync_for_restore.apply_policy(&orch, policy);
                }
            }
        });

        let codex = Arc::new(CodexAppServerManager::new(store.clone()));

        Arc::new(Self {
            store,
            supervisor,
            orchestrations,
            attention,
            sync,
            gate,
            codex,
            auth,
        })
    }

    /// Tear down in reverse dependency order: schedulers and pumps
    /// first, then the children, then the store goes with the process.
    pub async fn shutdown(&self) {
        info!(
            component = "server",
            event = "server.state_shutdown",
            "Shutting down core components"
        );
        self.orchestrations.shutdown();
        self.codex.stop_all().await;
        self.supervisor.dispose();
    }
}
