//! Codex app-server bridge.
//!
//! Hosts one `codex app-server` JSON-RPC subprocess per session that
//! opts in. Server→client requests (exec/patch approvals) and user
//! input notifications land in the event log under the session, where
//! the digest whitelist and attention surfaces pick them up; the
//! embedder answers through `respond`/`respond_error`.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info};

use flypad_connectors::app_server::{
    AppServerClient, AppServerConfig, AppServerError, AppServerEvent,
};

use crate::store::Store;

pub struct CodexAppServerManager {
    store: Arc<Store>,
    clients: DashMap<String, AppServerClient>,
}

impl CodexAppServerManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            clients: DashMap::new(),
        }
    }

    /// Start (or re-verify) the app-server subprocess for a session.
    pub async fn ensure_started(
        &self,
        session_id: &str,
        cwd: Option<String>,
        use_websocket: bool,
    ) -> Result<(), AppServerError> {
        if let Some(client) = self.clients.get(session_id) {
            let client = client.clone();
            return client.ensure_started().await;
        }

        let bin = std::env::var("FYP_CODEX_BIN").unwrap_or_else(|_| "codex".into());
        let env: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| {
                !matches!(key.as_str(), "CODEX_THREAD_ID" | "CODEX_SESSION_ID" | "CODEX_CI")
            })
            .collect();
        let (client, mut events) = AppServerClient::new(AppServerConfig {
            argv: vec![bin, "app-server".into()],
            cwd: cwd.map(PathBuf::from),
            env,
            use_websocket,
        });

        let store = self.store.clone();
        let event_session = session_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AppServerEvent::ServerRequest { id, method, params } => {
                        let _ = store.append_event(
                            &event_session,
                            &format!("codex.native.approval.{method}"),
                            &json!({ "rpcId": id, "params": params }),
                        );
                    }
                    AppServerEvent::Notification { method, params } => {
                        if method.eq_ignore_ascii_case("userInput")
                            || method.contains("user_input")
                        {
                            let _ = store.append_event(
                                &event_session,
                                "codex.native.user_input",
                                &json!({ "params": params }),
                            );
                        } else {
                            debug!(
                                component = "codex_appserver",
                                event = "codex_appserver.notification",
                                session_id = %event_session,
                                method = %method,
                                "App-server notification"
                            );
                        }
                    }
                    AppServerEvent::Disconnected { reason } => {
                        let _ = store.append_event(
                            &event_session,
                            "session.meta",
                            &json!({ "appServer": { "disconnected": reason } }),
                        );
                    }
                }
            }
        });

        client.ensure_started().await?;
        self.clients.insert(session_id.to_string(), client);
        info!(
            component = "codex_appserver",
            event = "codex_appserver.started",
            session_id = %session_id,
            websocket = use_websocket,
            "Codex app-server attached"
        );
        Ok(())
    }

    fn client(&self, session_id: &str) -> Result<AppServerClient, AppServerError> {
        self.clients
            .get(session_id)
            .map(|c| c.clone())
            .ok_or(AppServerError::NotReady)
    }

    pub async fn call(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, AppServerError> {
        self.client(session_id)?.call(method, params).await
    }

    pub async fn respond(
        &self,
        session_id: &str,
        rpc_id: Value,
        result: Value,
    ) -> Result<(), AppServerError> {
        let outcome = self.client(session_id)?.respond(rpc_id.clone(), result).await;
        if outcome.is_ok() {
            let _ = self.store.append_event(
                session_id,
                "codex.approval",
                &json!({ "rpcId": rpc_id }),
            );
        }
        outcome
    }

    pub async fn respond_error(
        &self,
        session_id: &str,
        rpc_id: Value,
        code: i64,
        message: &str,
    ) -> Result<(), AppServerError> {
        self.client(session_id)?
            .respond_error(rpc_id, code, message)
            .await
    }

    /// Terminal stop for one session's subprocess.
    pub async fn stop(&self, session_id: &str) {
        if let Some((_, client)) = self.clients.remove(session_id) {
            client.stop().await;
        }
    }

    /// Stop everything; used at shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.clients.iter().map(|c| c.key().clone()).collect();
        for id in ids {
            self.stop(&id).await;
        }
    }
}
