//! Session supervisor.
//!
//! Owns every live PTY child, keyed by session id. All writes to one
//! session funnel through a single drain task so producers (HTTP, WS,
//! dispatch, digest delivery, inbox responses) never interleave bytes.
//! Codex gets its CR/LF enter pacing here; other tools pass through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use flypad_connectors::pty::{PtySession, PtySpawnConfig};
use flypad_protocol::{new_id, SessionExit, SessionRecord, SessionStatus, Tool};

use crate::linker;
use crate::profiles::{self, ClaudeAuthMode};
use crate::store::{now_ms, Store, StoreError};

/// Delay between writing ETX and delivering SIGINT.
const INTERRUPT_SIGNAL_DELAY: Duration = Duration::from_millis(80);
/// Codex TUI pacing: beat between typed text and CR, and between CR and LF.
const CODEX_CR_DELAY: Duration = Duration::from_millis(15);
const CODEX_LF_DELAY: Duration = Duration::from_millis(25);

const PTY_COLS: u16 = 100;
const PTY_ROWS: u16 = 30;

/// Env vars removed from the inherited environment for Codex children.
const CODEX_SCRUBBED_VARS: &[&str] = &["CODEX_THREAD_ID", "CODEX_SESSION_ID", "CODEX_CI"];

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("session_already_exists")]
    SessionExists,

    #[error("unknown_session")]
    UnknownSession,

    #[error("spawn_failed: {0}")]
    SpawnFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Inputs for creating one session.
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub id: Option<String>,
    pub tool: Option<Tool>,
    pub profile_id: Option<String>,
    pub cwd: Option<String>,
    pub extra_args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workspace_key: Option<String>,
    pub workspace_root: Option<String>,
    pub tree_path: Option<String>,
}

struct SessionEntry {
    id: String,
    tool: Tool,
    pty: Arc<PtySession>,
    write_tx: mpsc::Sender<String>,
    output_tx: broadcast::Sender<Bytes>,
    status: ArcSwap<SessionStatus>,
    exit_tx: watch::Sender<Option<SessionStatus>>,
    /// Signal we delivered ourselves, folded into the exit report.
    sent_signal: StdMutex<Option<i32>>,
    gone: AtomicBool,
}

pub struct SessionSupervisor {
    sessions: DashMap<String, Arc<SessionEntry>>,
    store: Arc<Store>,
    claude_auth_mode: ClaudeAuthMode,
}

impl SessionSupervisor {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            claude_auth_mode: ClaudeAuthMode::from_env(),
        }
    }

    /// Spawn a PTY session. Returns the session id.
    pub fn create(&self, req: CreateSession) -> Result<String, SupervisorError> {
        let id = req.id.unwrap_or_else(new_id);
        if self.sessions.contains_key(&id) {
            return Err(SupervisorError::SessionExists);
        }

        let tool = req.tool.unwrap_or(Tool::Codex);
        let profile = profiles::resolve(tool, req.profile_id.as_deref());
        let cwd = req
            .cwd
            .clone()
            .unwrap_or_else(|| std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()));

        let mut argv = profile.argv.clone();
        argv.extend(req.extra_args.iter().cloned());

        let process_env: Vec<(String, String)> = std::env::vars().collect();
        let env = build_child_env(
            tool,
            self.claude_auth_mode,
            process_env,
            &profile.env,
            &req.env,
        );

        let spawn_time_ms = now_ms();
        let pty = PtySession::spawn(PtySpawnConfig {
            argv,
            cwd: cwd.clone().into(),
            env,
            cols: PTY_COLS,
            rows: PTY_ROWS,
        })
        .map_err(|e| SupervisorError::SpawnFailed(e.to_string()))?;
        let pty = Arc::new(pty);

        let record = SessionRecord {
            id: id.clone(),
            tool,
            profile_id: profile.id.clone(),
            tool_session_id: None,
            cwd: cwd.clone(),
            workspace_key: req.workspace_key,
            workspace_root: req.workspace_root,
            tree_path: req.tree_path,
            label: None,
            pinned_slot: None,
            created_at: spawn_time_ms,
            updated_at: spawn_time_ms,
            exit: None,
        };
        if let Err(e) = self.store.create_session(&record) {
            pty.kill();
            return Err(match e {
                StoreError::SessionExists => SupervisorError::SessionExists,
                other => SupervisorError::Store(other),
            });
        }
        let _ = self.store.append_event(
            &id,
            "session.created",
            &serde_json::json!({ "tool": tool.as_str(), "profileId": profile.id, "cwd": cwd }),
        );

        let (output_tx, _) = broadcast::channel(256);
        let (exit_tx, _) = watch::channel(None);
        let (write_tx, write_rx) = mpsc::channel::<String>(128);

        let entry = Arc::new(SessionEntry {
            id: id.clone(),
            tool,
            pty: pty.clone(),
            write_tx,
            output_tx: output_tx.clone(),
            status: ArcSwap::from_pointee(SessionStatus {
                running: true,
                pid: pty.pid(),
                exit_code: None,
                signal: None,
            }),
            exit_tx,
            sent_signal: StdMutex::new(None),
            gone: AtomicBool::new(false),
        });
        self.sessions.insert(id.clone(), entry.clone());

        spawn_output_pump(entry.clone(), self.store.clone());
        spawn_exit_watcher(entry.clone(), self.store.clone());
        spawn_write_drain(entry.clone(), write_rx);

        if tool == Tool::Codex {
            linker::spawn_codex_linker(self.store.clone(), id.clone(), cwd.clone(), spawn_time_ms);
        }

        info!(
            component = "supervisor",
            event = "session.spawned",
            session_id = %id,
            tool = tool.as_str(),
            pid = ?pty.pid(),
            cwd = %cwd,
            "Session spawned"
        );
        Ok(id)
    }

    fn entry(&self, id: &str) -> Result<Arc<SessionEntry>, SupervisorError> {
        self.sessions
            .get(id)
            .map(|e| e.clone())
            .ok_or(SupervisorError::UnknownSession)
    }

    /// Enqueue data for the session's single write drain. Queue overflow
    /// and write errors are swallowed per the supervisor contract.
    pub async fn write(&self, id: &str, data: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        if entry.write_tx.send(data.to_string()).await.is_err() {
            debug!(
                component = "supervisor",
                event = "session.write_dropped",
                session_id = %id,
                "Write drain gone, data dropped"
            );
        }
        Ok(())
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        if let Err(e) = entry.pty.resize(cols, rows) {
            debug!(
                component = "supervisor",
                event = "session.resize_failed",
                session_id = %id,
                error = %e,
                "Resize failed"
            );
        }
        Ok(())
    }

    pub fn subscribe_output(&self, id: &str) -> Result<broadcast::Receiver<Bytes>, SupervisorError> {
        Ok(self.entry(id)?.output_tx.subscribe())
    }

    pub fn subscribe_exit(
        &self,
        id: &str,
    ) -> Result<watch::Receiver<Option<SessionStatus>>, SupervisorError> {
        Ok(self.entry(id)?.exit_tx.subscribe())
    }

    pub fn status(&self, id: &str) -> Result<SessionStatus, SupervisorError> {
        Ok(**self.entry(id)?.status.load())
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.sessions
            .get(id)
            .map(|e| e.status.load().running)
            .unwrap_or(false)
    }

    /// Write ETX immediately (jumping the paced queue), then deliver one
    /// SIGINT ~80 ms later if the child is still running.
    pub fn interrupt(&self, id: &str) -> Result<(), SupervisorError> {
        self.interrupt_inner(id, "interrupt")
    }

    /// `stop` is an alias for interrupt with its own audit kind.
    pub fn stop(&self, id: &str) -> Result<(), SupervisorError> {
        self.interrupt_inner(id, "stop")
    }

    fn interrupt_inner(&self, id: &str, kind: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        if let Err(e) = entry.pty.write(b"\x03") {
            debug!(
                component = "supervisor",
                event = "session.interrupt_write_failed",
                session_id = %id,
                error = %e,
                "ETX write failed"
            );
        }
        let _ = self.store.append_event(id, kind, &serde_json::json!({}));

        let signal_entry = entry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(INTERRUPT_SIGNAL_DELAY).await;
            if signal_entry.status.load().running {
                // Best-effort; the child may have exited in the gap.
                let _ = signal_entry.pty.signal(libc::SIGINT);
            }
        });
        Ok(())
    }

    /// SIGKILL the child. Non-fatal on error.
    pub fn kill(&self, id: &str) -> Result<(), SupervisorError> {
        let entry = self.entry(id)?;
        *entry.sent_signal.lock().expect("sent_signal poisoned") = Some(libc::SIGKILL);
        entry.pty.kill();
        let _ = self.store.append_event(id, "kill", &serde_json::json!({}));
        Ok(())
    }

    /// Drop all listeners, kill the PTY, and remove the entry. Used by
    /// delete flows; the store row is the caller's concern.
    pub fn forget(&self, id: &str) {
        if let Some((_, entry)) = self.sessions.remove(id) {
            entry.gone.store(true, Ordering::SeqCst);
            entry.pty.kill();
        }
    }

    /// Kill everything and clear the map.
    pub fn dispose(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.forget(&id);
        }
    }
}

fn spawn_output_pump(entry: Arc<SessionEntry>, store: Arc<Store>) {
    let Some(mut output_rx) = entry.pty.take_output() else {
        return;
    };
    tokio::spawn(async move {
        while let Some(chunk) = output_rx.recv().await {
            if entry.gone.load(Ordering::SeqCst) {
                break;
            }
            let text = String::from_utf8_lossy(&chunk).into_owned();
            let _ = store.append_output(&entry.id, &text);
            let _ = entry.output_tx.send(chunk);
        }
    });
}

fn spawn_exit_watcher(entry: Arc<SessionEntry>, store: Arc<Store>) {
    let Some(exit_rx) = entry.pty.take_exit() else {
        return;
    };
    tokio::spawn(async move {
        let code = exit_rx.await.unwrap_or(-1);
        let signal = entry
            .sent_signal
            .lock()
            .expect("sent_signal poisoned")
            .take();

        let status = SessionStatus {
            running: false,
            pid: entry.pty.pid(),
            exit_code: Some(code),
            signal,
        };
        entry.status.store(Arc::new(status));

        let _ = store.set_session_exit(
            &entry.id,
            SessionExit {
                code: Some(code),
                signal,
            },
        );
        let _ = store.append_event(
            &entry.id,
            "session.exit",
            &serde_json::json!({ "code": code, "signal": signal }),
        );

        // Exit listeners fire exactly once with the final status.
        let _ = entry.exit_tx.send(Some(status));

        info!(
            component = "supervisor",
            event = "session.exit",
            session_id = %entry.id,
            code = code,
            signal = ?signal,
            "Session exited"
        );
    });
}

fn spawn_write_drain(entry: Arc<SessionEntry>, mut write_rx: mpsc::Receiver<String>) {
    tokio::spawn(async move {
        while let Some(data) = write_rx.recv().await {
            match entry.tool {
                Tool::Codex => {
                    for step in paced_segments(&data) {
                        match step {
                            PacedWrite::Text(text) => {
                                if let Err(e) = entry.pty.write(text.as_bytes()) {
                                    swallow_write_error(&entry.id, e);
                                }
                            }
                            PacedWrite::CarriageReturn => {
                                tokio::time::sleep(CODEX_CR_DELAY).await;
                                if let Err(e) = entry.pty.write(b"\r") {
                                    swallow_write_error(&entry.id, e);
                                }
                            }
                            PacedWrite::LineFeed => {
                                tokio::time::sleep(CODEX_LF_DELAY).await;
                                if let Err(e) = entry.pty.write(b"\n") {
                                    swallow_write_error(&entry.id, e);
                                }
                            }
                        }
                    }
                }
                _ => {
                    if let Err(e) = entry.pty.write(data.as_bytes()) {
                        swallow_write_error(&entry.id, e);
                    }
                }
            }
        }
    });
}

fn swallow_write_error(session_id: &str, e: std::io::Error) {
    warn!(
        component = "supervisor",
        event = "session.write_failed",
        session_id = %session_id,
        error = %e,
        "PTY write failed"
    );
}

/// One step of a paced Codex write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacedWrite {
    Text(String),
    CarriageReturn,
    LineFeed,
}

/// Split input on `\r` into the write sequence the Codex TUI needs:
/// the typed text, then CR and LF as separate writes. A `\n` directly
/// following a `\r` in the input is consumed so `\r\n` never becomes
/// `\r\n\n`.
pub fn paced_segments(input: &str) -> Vec<PacedWrite> {
    let mut out = Vec::new();
    let mut rest = input;
    loop {
        match rest.find('\r') {
            Some(idx) => {
                if idx > 0 {
                    out.push(PacedWrite::Text(rest[..idx].to_string()));
                }
                out.push(PacedWrite::CarriageReturn);
                out.push(PacedWrite::LineFeed);
                rest = &rest[idx + 1..];
                if let Some(stripped) = rest.strip_prefix('\n') {
                    rest = stripped;
                }
            }
            None => {
                if !rest.is_empty() {
                    out.push(PacedWrite::Text(rest.to_string()));
                }
                break;
            }
        }
    }
    out
}

/// Merge the child environment: inherited process env (scrubbed per
/// tool), then profile env, then request env, then TERM.
pub fn build_child_env(
    tool: Tool,
    claude_auth_mode: ClaudeAuthMode,
    process_env: Vec<(String, String)>,
    profile_env: &[(String, String)],
    request_env: &[(String, String)],
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = process_env
        .into_iter()
        .filter(|(key, _)| match tool {
            Tool::Codex => !CODEX_SCRUBBED_VARS.contains(&key.as_str()),
            // Subscription mode strips only ANTHROPIC_API_KEY; the source
            // leaves ANTHROPIC_AUTH_TOKEN alone and so do we.
            Tool::Claude => {
                claude_auth_mode == ClaudeAuthMode::Api || key != "ANTHROPIC_API_KEY"
            }
            Tool::Opencode => true,
        })
        .collect();

    for (key, value) in profile_env.iter().chain(request_env.iter()) {
        merged.retain(|(k, _)| k != key);
        merged.push((key.clone(), value.clone()));
    }

    merged.retain(|(k, _)| k != "TERM");
    merged.push(("TERM".into(), "xterm-256color".into()));
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paced_segments_split_text_cr_lf() {
        assert_eq!(
            paced_segments("hello\r"),
            vec![
                PacedWrite::Text("hello".into()),
                PacedWrite::CarriageReturn,
                PacedWrite::LineFeed,
            ]
        );
    }

    #[test]
    fn paced_segments_consume_caller_lf_after_cr() {
        // `\r\n` input must not produce `\r\n\n`
        assert_eq!(
            paced_segments("hello\r\n"),
            vec![
                PacedWrite::Text("hello".into()),
                PacedWrite::CarriageReturn,
                PacedWrite::LineFeed,
            ]
        );
    }

    #[test]
    fn paced_segments_handle_multiple_lines() {
        assert_eq!(
            paced_segments("a\rb\r"),
            vec![
                PacedWrite::Text("a".into()),
                PacedWrite::CarriageReturn,
                PacedWrite::LineFeed,
                PacedWrite::Text("b".into()),
                PacedWrite::CarriageReturn,
                PacedWrite::LineFeed,
            ]
        );
    }

    #[test]
    fn paced_segments_pass_plain_text_through() {
        assert_eq!(
            paced_segments("no enter"),
            vec![PacedWrite::Text("no enter".into())]
        );
        assert_eq!(paced_segments(""), Vec::<PacedWrite>::new());
    }

    #[test]
    fn paced_segments_bare_cr_gets_lf() {
        assert_eq!(
            paced_segments("\r"),
            vec![PacedWrite::CarriageReturn, PacedWrite::LineFeed]
        );
    }

    #[test]
    fn codex_env_scrubs_thread_vars() {
        let process_env = vec![
            ("CODEX_THREAD_ID".to_string(), "t-123".to_string()),
            ("CODEX_SESSION_ID".to_string(), "s-123".to_string()),
            ("CODEX_CI".to_string(), "1".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let env = build_child_env(Tool::Codex, ClaudeAuthMode::Subscription, process_env, &[], &[]);
        assert!(!env.iter().any(|(k, _)| k == "CODEX_THREAD_ID"));
        assert!(!env.iter().any(|(k, _)| k == "CODEX_SESSION_ID"));
        assert!(!env.iter().any(|(k, _)| k == "CODEX_CI"));
        assert!(env.iter().any(|(k, v)| k == "PATH" && v == "/usr/bin"));
        assert!(env
            .iter()
            .any(|(k, v)| k == "TERM" && v == "xterm-256color"));
    }

    #[test]
    fn claude_subscription_mode_strips_api_key() {
        let process_env = vec![
            ("ANTHROPIC_API_KEY".to_string(), "sk-test".to_string()),
            ("ANTHROPIC_AUTH_TOKEN".to_string(), "tok".to_string()),
        ];
        let env = build_child_env(
            Tool::Claude,
            ClaudeAuthMode::Subscription,
            process_env.clone(),
            &[],
            &[],
        );
        assert!(!env.iter().any(|(k, _)| k == "ANTHROPIC_API_KEY"));
        assert!(env.iter().any(|(k, _)| k == "ANTHROPIC_AUTH_TOKEN"));

        let env = build_child_env(Tool::Claude, ClaudeAuthMode::Api, process_env, &[], &[]);
        assert!(env.iter().any(|(k, _)| k == "ANTHROPIC_API_KEY"));
    }

    #[test]
    fn request_env_overrides_inherited() {
        let process_env = vec![("FOO".to_string(), "old".to_string())];
        let env = build_child_env(
            Tool::Opencode,
            ClaudeAuthMode::Subscription,
            process_env,
            &[],
            &[("FOO".to_string(), "new".to_string())],
        );
        let foo: Vec<_> = env.iter().filter(|(k, _)| k == "FOO").collect();
        assert_eq!(foo.len(), 1);
        assert_eq!(foo[0].1, "new");
    }
}
