//! Core types shared across the protocol

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Supported coding-assistant CLI tools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Codex,
    Claude,
    Opencode,
}

impl Tool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tool::Codex => "codex",
            Tool::Claude => "claude",
            Tool::Opencode => "opencode",
        }
    }

    pub fn parse(s: &str) -> Option<Tool> {
        match s {
            "codex" => Some(Tool::Codex),
            "claude" => Some(Tool::Claude),
            "opencode" => Some(Tool::Opencode),
            _ => None,
        }
    }
}

/// Exit information recorded when a session's child process terminates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Live process status of a session
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

/// A supervised session row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub tool: Tool,
    pub profile_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_session_id: Option<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tree_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Quick-access slot 1..6, unique per workspace
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pinned_slot: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit: Option<SessionExit>,
}

/// Append-only session event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: i64,
    pub session_id: String,
    pub ts: i64,
    pub kind: String,
    pub data: Value,
}

/// Append-only transcript chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputRecord {
    pub id: i64,
    pub session_id: String,
    pub ts: i64,
    pub chunk: String,
}

/// Status of an attention (inbox) item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionStatus {
    Open,
    Sent,
    Resolved,
    Dismissed,
}

impl AttentionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionStatus::Open => "open",
            AttentionStatus::Sent => "sent",
            AttentionStatus::Resolved => "resolved",
            AttentionStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(s: &str) -> Option<AttentionStatus> {
        match s {
            "open" => Some(AttentionStatus::Open),
            "sent" => Some(AttentionStatus::Sent),
            "resolved" => Some(AttentionStatus::Resolved),
            "dismissed" => Some(AttentionStatus::Dismissed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionSeverity {
    Info,
    Warn,
    Danger,
}

impl AttentionSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttentionSeverity::Info => "info",
            AttentionSeverity::Warn => "warn",
            AttentionSeverity::Danger => "danger",
        }
    }

    pub fn parse(s: &str) -> Option<AttentionSeverity> {
        match s {
            "info" => Some(AttentionSeverity::Info),
            "warn" => Some(AttentionSeverity::Warn),
            "danger" => Some(AttentionSeverity::Danger),
            _ => None,
        }
    }
}

/// One selectable response for an attention item. `send` is written
/// verbatim into the owning session's terminal when chosen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionOption {
    pub id: String,
    pub label: String,
    pub send: String,
}

/// A deduplicated, actionable inbox item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionItem {
    pub id: i64,
    pub session_id: String,
    pub ts: i64,
    pub updated_at: i64,
    pub status: AttentionStatus,
    pub kind: String,
    pub severity: AttentionSeverity,
    pub title: String,
    pub body: String,
    pub signature: String,
    pub options: Vec<AttentionOption>,
}

/// Audit record for a respond/dismiss on an attention item
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttentionAction {
    pub id: i64,
    pub attention_id: i64,
    pub session_id: String,
    pub ts: i64,
    pub action: String,
    pub data: Value,
}

/// Per-workspace default profile and overrides for one tool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspacePreset {
    pub path: String,
    pub tool: Tool,
    pub profile_id: String,
    pub overrides: Value,
    pub updated_at: i64,
}

/// How initial worker prompts are released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMode {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "orchestrator-first")]
    OrchestratorFirst,
}

impl Default for DispatchMode {
    fn default() -> Self {
        DispatchMode::Auto
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationStatus {
    Active,
    Cleaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Manual,
    Interval,
}

/// Digest sync policy for one orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    pub mode: SyncMode,
    pub interval_ms: u64,
    pub deliver_to_orchestrator: bool,
    pub min_delivery_gap_ms: u64,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            mode: SyncMode::Manual,
            interval_ms: 90_000,
            deliver_to_orchestrator: true,
            min_delivery_gap_ms: 15_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionMode {
    Inline,
    Orchestrator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SteeringMode {
    Off,
    PassiveReview,
}

/// Governs whether worker questions go to a human or the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationPolicy {
    pub question_mode: QuestionMode,
    pub steering_mode: SteeringMode,
    pub yolo_mode: bool,
    pub question_timeout_ms: u64,
    pub review_interval_ms: u64,
}

impl Default for AutomationPolicy {
    fn default() -> Self {
        Self {
            question_mode: QuestionMode::Inline,
            steering_mode: SteeringMode::Off,
            yolo_mode: false,
            question_timeout_ms: 120_000,
            review_interval_ms: 300_000,
        }
    }
}

/// One worker inside an orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInfo {
    pub name: String,
    pub session_id: String,
    pub tool: Tool,
    pub profile_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<String>,
    pub task_prompt: String,
    pub initial_dispatched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupState {
    #[serde(rename = "waiting-first-dispatch")]
    WaitingFirstDispatch,
    #[serde(rename = "running")]
    Running,
}

/// Deferred first-prompt bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupInfo {
    pub state: StartupState,
    pub pending_session_ids: Vec<String>,
    pub dispatched_session_ids: Vec<String>,
}

/// Deterministic snapshot of one worker's observable state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    /// 16-hex SHA-256 prefix over the canonical state tuple
    pub state_hash: String,
    pub running: bool,
    pub attention: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_updated_at: Option<i64>,
    pub checklist_done: u32,
    pub checklist_total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_rel_path: Option<String>,
    pub changed_at: i64,
}

/// Sync scheduler state for one orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub policy: SyncPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_digest_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_digest_hash: Option<String>,
    pub snapshots: BTreeMap<String, WorkerSnapshot>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::default(),
            last_digest_at: None,
            last_digest_hash: None,
            snapshots: BTreeMap::new(),
        }
    }
}

/// Automation state for one orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationState {
    pub policy: AutomationPolicy,
    pub pending_question_count: u32,
    pub question_dispatch_count: u64,
}

impl Default for AutomationState {
    fn default() -> Self {
        Self {
            policy: AutomationPolicy::default(),
            pending_question_count: 0,
            question_dispatch_count: 0,
        }
    }
}

/// Full orchestration view returned by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationView {
    pub id: String,
    pub name: String,
    pub project_path: String,
    pub created_at: i64,
    pub status: OrchestrationStatus,
    pub dispatch_mode: DispatchMode,
    pub orchestrator_session_id: String,
    pub workers: Vec<WorkerInfo>,
    pub startup: StartupInfo,
    pub sync: SyncState,
    pub automation: AutomationState,
}

/// Per-session write failure inside a dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    pub session_id: String,
    pub reason: String,
}

/// Result of delivering one prompt to one or more workers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOutcome {
    pub sent: Vec<String>,
    pub failed: Vec<DispatchFailure>,
    pub injected_bootstrap: bool,
    pub interrupt_requested: bool,
}
