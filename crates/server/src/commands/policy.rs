//! Risk-tier policy evaluation.
//!
//! Low-tier commands pass. Medium-tier commands pass unless `force` is
//! set, in which case a reason is demanded. High-tier commands need the
//! full acknowledgement set; `policyOverride` is only honoured when the
//! host explicitly allows it via `FYP_HARNESS_POLICY_ALLOW_HIGH_RISK`.

use serde_json::Value;

use super::registry::{CommandSpec, RiskTier};

pub const ALLOW_HIGH_RISK_ENV: &str = "FYP_HARNESS_POLICY_ALLOW_HIGH_RISK";

const MEDIUM_REASON_MIN: usize = 8;
const HIGH_REASON_MIN: usize = 12;
const HIGH_APPROVER_MIN: usize = 2;
const HIGH_ROLLBACK_MIN: usize = 12;
const HIGH_AUTHORIZED_SCOPE_MIN: usize = 6;

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyBlock {
    pub tier: &'static str,
    pub unmet: Vec<String>,
}

/// True when the host environment permits `policyOverride` on high-tier
/// commands.
pub fn high_risk_override_allowed() -> bool {
    matches!(
        std::env::var(ALLOW_HIGH_RISK_ENV).as_deref(),
        Ok("1") | Ok("true")
    )
}

/// Evaluate the policy gate for one command payload.
pub fn evaluate_policy(
    spec: &CommandSpec,
    payload: &Value,
    override_allowed: bool,
) -> Result<(), PolicyBlock> {
    match spec.tier {
        RiskTier::Low => Ok(()),
        RiskTier::Medium => {
            if flag(payload, "force") && !min_len(payload, "policyReason", MEDIUM_REASON_MIN) {
                return Err(PolicyBlock {
                    tier: "medium",
                    unmet: vec![format!("policyReason (≥{MEDIUM_REASON_MIN} chars)")],
                });
            }
            Ok(())
        }
        RiskTier::High => {
            if flag(payload, "policyOverride") && override_allowed {
                return Ok(());
            }

            let mut unmet = Vec::new();
            if !flag(payload, "policyAck") {
                unmet.push("policyAck".to_string());
            }
            if !min_len(payload, "policyReason", HIGH_REASON_MIN) {
                unmet.push(format!("policyReason (≥{HIGH_REASON_MIN} chars)"));
            }
            if !min_len(payload, "policyApprovedBy", HIGH_APPROVER_MIN) {
                unmet.push(format!("policyApprovedBy (≥{HIGH_APPROVER_MIN} chars)"));
            }
            if !min_len(payload, "rollbackPlan", HIGH_ROLLBACK_MIN) {
                unmet.push(format!("rollbackPlan (≥{HIGH_ROLLBACK_MIN} chars)"));
            }
            if spec.id == "security-vuln-repro"
                && !min_len(payload, "policyAuthorizedScope", HIGH_AUTHORIZED_SCOPE_MIN)
            {
                unmet.push(format!(
                    "policyAuthorizedScope (≥{HIGH_AUTHORIZED_SCOPE_MIN} chars)"
                ));
            }

            if unmet.is_empty() {
                Ok(())
            } else {
                Err(PolicyBlock {
                    tier: "high",
                    unmet,
                })
            }
        }
    }
}

fn flag(payload: &Value, key: &str) -> bool {
    payload.get(key).and_then(|v| v.as_bool()) == Some(true)
}

fn min_len(payload: &Value, key: &str, min: usize) -> bool {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().chars().count())
        .map_or(false, |len| len >= min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::registry::find;
    use serde_json::json;

    #[test]
    fn low_tier_always_passes() {
        let spec = find("diag-evidence").unwrap();
        assert!(evaluate_policy(spec, &json!({}), false).is_ok());
    }

    #[test]
    fn medium_tier_force_requires_reason() {
        let spec = find("refactor-safe").unwrap();
        assert!(evaluate_policy(spec, &json!({}), false).is_ok());
        assert!(evaluate_policy(spec, &json!({"force": true}), false).is_err());
        assert!(evaluate_policy(
            spec,
            &json!({"force": true, "policyReason": "short"}),
            false
        )
        .is_err());
        assert!(evaluate_policy(
            spec,
            &json!({"force": true, "policyReason": "merge window closes"}),
            false
        )
        .is_ok());
    }

    #[test]
    fn high_tier_requires_full_set() {
        let spec = find("security-vuln-repro").unwrap();
        let block = evaluate_policy(spec, &json!({}), false).unwrap_err();
        assert_eq!(block.tier, "high");
        assert!(block.unmet.iter().any(|u| u.starts_with("policyAck")));
        assert!(block.unmet.iter().any(|u| u.starts_with("policyReason")));
        assert!(block.unmet.iter().any(|u| u.starts_with("policyApprovedBy")));
        assert!(block.unmet.iter().any(|u| u.starts_with("rollbackPlan")));
        assert!(block
            .unmet
            .iter()
            .any(|u| u.starts_with("policyAuthorizedScope")));

        let full = json!({
            "policyAck": true,
            "policyReason": "reproduce CVE in staging",
            "policyApprovedBy": "sec-lead",
            "rollbackPlan": "discard staging namespace",
            "policyAuthorizedScope": "staging-only",
        });
        assert!(evaluate_policy(spec, &full, false).is_ok());
    }

    #[test]
    fn authorized_scope_only_demanded_for_vuln_repro() {
        let spec = find("destructive-reset").unwrap();
        let full = json!({
            "policyAck": true,
            "policyReason": "reset corrupted sandbox",
            "policyApprovedBy": "oncall",
            "rollbackPlan": "restore from snapshot",
        });
        assert!(evaluate_policy(spec, &full, false).is_ok());
    }

    #[test]
    fn override_honoured_only_when_env_allows() {
        let spec = find("security-vuln-repro").unwrap();
        let payload = json!({"policyOverride": true});
        // Without host permission the override is ignored
        assert!(evaluate_policy(spec, &payload, false).is_err());
        // With it, the gate opens
        assert!(evaluate_policy(spec, &payload, true).is_ok());
    }
}
