//! Named command registry.
//!
//! Each command maps to an execution mode, a risk tier, and a payload
//! envelope. The envelopes are closed (`additionalProperties: false`)
//! so typos and smuggled fields are rejected before any side effect.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    WorkerDispatch,
    WorkerSendTask,
    OrchestratorInput,
    SystemSync,
    SystemReview,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::WorkerDispatch => "worker.dispatch",
            ExecutionMode::WorkerSendTask => "worker.send_task",
            ExecutionMode::OrchestratorInput => "orchestrator.input",
            ExecutionMode::SystemSync => "system.sync",
            ExecutionMode::SystemReview => "system.review",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub id: &'static str,
    pub mode: ExecutionMode,
    pub tier: RiskTier,
    /// Fields that must each be a non-empty string.
    pub required_non_empty: &'static [&'static str],
    /// At least one of these must be a non-empty string.
    pub required_any_of: &'static [&'static str],
}

const TASK_ANY: &[&str] = &["task", "text", "objective", "rawPrompt"];
const TASK_OR_TEXT: &[&str] = &["task", "text"];

use ExecutionMode::*;
use RiskTier::*;

pub const COMMANDS: &[CommandSpec] = &[
    // Coordination
    CommandSpec { id: "coord-task", mode: WorkerSendTask, tier: Low, required_non_empty: &[], required_any_of: TASK_ANY },
    CommandSpec { id: "coord-followup", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "coord-split", mode: WorkerSendTask, tier: Low, required_non_empty: &[], required_any_of: TASK_ANY },
    CommandSpec { id: "coord-handoff", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "coord-unblock", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "coord-redirect", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: TASK_ANY },
    // Scope control
    CommandSpec { id: "scope-lock", mode: WorkerDispatch, tier: Low, required_non_empty: &["scope"], required_any_of: &[] },
    CommandSpec { id: "scope-expand", mode: WorkerDispatch, tier: Medium, required_non_empty: &["scope"], required_any_of: &[] },
    CommandSpec { id: "scope-trim", mode: WorkerDispatch, tier: Low, required_non_empty: &["scope"], required_any_of: &[] },
    // Diagnostics
    CommandSpec { id: "diag-evidence", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "diag-repro", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "diag-bisect", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "diag-logs", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    // Verification
    CommandSpec { id: "verify-completion", mode: WorkerDispatch, tier: Low, required_non_empty: &["verify"], required_any_of: &[] },
    CommandSpec { id: "verify-tests", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "verify-build", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "verify-lint", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    // Testing
    CommandSpec { id: "test-add", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "test-flaky-hunt", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    // Fixing
    CommandSpec { id: "fix-bug", mode: WorkerSendTask, tier: Low, required_non_empty: &[], required_any_of: TASK_ANY },
    CommandSpec { id: "fix-regression", mode: WorkerSendTask, tier: Low, required_non_empty: &[], required_any_of: TASK_ANY },
    CommandSpec { id: "refactor-safe", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    // Housekeeping
    CommandSpec { id: "docs-update", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "bench-run", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "deps-audit", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "deps-upgrade", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    // Git
    CommandSpec { id: "git-status-report", mode: WorkerDispatch, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "git-commit-now", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "git-push-branch", mode: WorkerDispatch, tier: Medium, required_non_empty: &[], required_any_of: &[] },
    // Reviews
    CommandSpec { id: "review-hard", mode: SystemReview, tier: Medium, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "review-quick", mode: SystemReview, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "review-security", mode: SystemReview, tier: Medium, required_non_empty: &[], required_any_of: &[] },
    // Sync
    CommandSpec { id: "sync-status", mode: SystemSync, tier: Low, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "sync-full", mode: SystemSync, tier: Low, required_non_empty: &[], required_any_of: &[] },
    // Orchestrator input
    CommandSpec { id: "orch-note", mode: OrchestratorInput, tier: Low, required_non_empty: &[], required_any_of: &["text", "notes"] },
    CommandSpec { id: "orch-replan", mode: OrchestratorInput, tier: Medium, required_non_empty: &[], required_any_of: TASK_ANY },
    CommandSpec { id: "orch-status-request", mode: OrchestratorInput, tier: Low, required_non_empty: &[], required_any_of: &[] },
    // High risk
    CommandSpec { id: "security-vuln-repro", mode: WorkerDispatch, tier: High, required_non_empty: &[], required_any_of: TASK_ANY },
    CommandSpec { id: "destructive-reset", mode: WorkerDispatch, tier: High, required_non_empty: &[], required_any_of: &[] },
    CommandSpec { id: "data-migration-run", mode: WorkerDispatch, tier: High, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
    CommandSpec { id: "prod-config-change", mode: OrchestratorInput, tier: High, required_non_empty: &[], required_any_of: TASK_OR_TEXT },
];

pub fn find(id: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.id == id)
}

/// Payload envelope for one command, keyed off its execution mode.
pub fn schema_for(spec: &CommandSpec) -> Value {
    let policy_properties = json!({
        "force": { "type": "boolean" },
        "policyAck": { "type": "boolean" },
        "policyOverride": { "type": "boolean" },
        "policyReason": { "type": "string", "maxLength": 2000 },
        "policyApprovedBy": { "type": "string", "maxLength": 200 },
        "policyAuthorizedScope": { "type": "string", "maxLength": 2000 },
        "rollbackPlan": { "type": "string", "maxLength": 4000 },
    });

    let mut properties = policy_properties.as_object().cloned().expect("policy props");
    let mut add = |extra: Value| {
        for (key, value) in extra.as_object().cloned().unwrap_or_default() {
            properties.insert(key, value);
        }
    };

    match spec.mode {
        ExecutionMode::WorkerDispatch | ExecutionMode::WorkerSendTask => add(json!({
            "target": { "type": "string", "minLength": 1, "maxLength": 200 },
            "task": { "type": "string", "maxLength": 24000 },
            "text": { "type": "string", "maxLength": 24000 },
            "objective": { "type": "string", "maxLength": 24000 },
            "rawPrompt": { "type": "string", "maxLength": 24000 },
            "scope": { "type": "string", "maxLength": 8000 },
            "verify": { "type": "string", "maxLength": 8000 },
            "notYourJob": { "type": "string", "maxLength": 8000 },
            "doneWhen": { "type": "string", "maxLength": 8000 },
            "priority": { "enum": ["low", "normal", "high"] },
            "extra": { "type": "string", "maxLength": 8000 },
            "notes": { "type": "string", "maxLength": 8000 },
            "interrupt": { "type": "boolean" },
            "forceInterrupt": { "type": "boolean" },
            "initialize": { "type": "boolean" },
        })),
        ExecutionMode::OrchestratorInput => add(json!({
            "task": { "type": "string", "maxLength": 24000 },
            "text": { "type": "string", "maxLength": 24000 },
            "objective": { "type": "string", "maxLength": 24000 },
            "rawPrompt": { "type": "string", "maxLength": 24000 },
            "priority": { "enum": ["low", "normal", "high"] },
            "notes": { "type": "string", "maxLength": 8000 },
        })),
        ExecutionMode::SystemSync => add(json!({
            "deliverToOrchestrator": { "type": "boolean" },
            "notes": { "type": "string", "maxLength": 8000 },
        })),
        ExecutionMode::SystemReview => add(json!({
            "scope": { "type": "string", "maxLength": 8000 },
            "notes": { "type": "string", "maxLength": 8000 },
            "priority": { "enum": ["low", "normal", "high"] },
        })),
    }

    json!({
        "type": "object",
        "additionalProperties": false,
        "properties": Value::Object(properties),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_unique_ids() {
        let mut ids: Vec<&str> = COMMANDS.iter().map(|c| c.id).collect();
        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
        assert!(total >= 40, "expected ~40 commands, have {total}");
    }

    #[test]
    fn named_commands_resolve() {
        for id in [
            "diag-evidence",
            "coord-task",
            "scope-lock",
            "verify-completion",
            "sync-status",
            "review-hard",
            "security-vuln-repro",
        ] {
            assert!(find(id).is_some(), "missing command {id}");
        }
        assert!(find("nope").is_none());
    }

    #[test]
    fn scope_lock_requires_scope_coord_task_any_of() {
        let scope_lock = find("scope-lock").unwrap();
        assert_eq!(scope_lock.required_non_empty, &["scope"]);

        let coord = find("coord-task").unwrap();
        assert_eq!(coord.required_any_of, TASK_ANY);
        assert_eq!(coord.mode, WorkerSendTask);
    }

    #[test]
    fn schemas_are_closed_objects() {
        for spec in COMMANDS {
            let schema = schema_for(spec);
            assert_eq!(
                schema.get("additionalProperties"),
                Some(&Value::Bool(false)),
                "{} schema must be closed",
                spec.id
            );
            assert!(schema.get("properties").is_some());
        }
    }

    #[test]
    fn worker_schemas_accept_dispatch_fields() {
        let spec = find("coord-task").unwrap();
        let schema = schema_for(spec);
        let result = crate::commands::schema::validate_payload(
            &schema,
            &serde_json::json!({
                "target": "worker:a",
                "task": "do it",
                "scope": "src/",
                "interrupt": true,
            }),
            spec.required_non_empty,
            spec.required_any_of,
        );
        assert!(result.ok(), "{:?}", result.errors);
    }

    #[test]
    fn sync_schema_rejects_worker_fields() {
        let spec = find("sync-status").unwrap();
        let schema = schema_for(spec);
        let result = crate::commands::schema::validate_payload(
            &schema,
            &serde_json::json!({ "target": "all" }),
            spec.required_non_empty,
            spec.required_any_of,
        );
        assert!(!result.ok());
    }
}
