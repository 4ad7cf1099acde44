//! Contract validation for A2A request and response payloads.
//!
//! Each named contract enforces exact shape: field presence, primitive
//! types, array element types, enum membership. Violations accumulate in
//! one pass and are surfaced before any handler side effect.

use serde_json::{Map, Value};
use thiserror::Error;

/// All violations found in one validation pass.
#[derive(Error, Debug, Clone)]
#[error("Contract '{contract}' violated: {}", issues.join("; "))]
pub struct ContractViolations {
    pub contract: String,
    pub issues: Vec<String>,
}

const DISPOSITIONS: &[&str] = &["investigate", "monitor", "suppress"];
const SEVERITIES: &[&str] = &["low", "medium", "high", "critical"];
const RECOMMENDED_NEXT: &[&str] = &["threat_hunt", "plan_remediation", "escalate"];
const ACTION_TYPES: &[&str] = &["containment", "remediation", "communication", "documentation"];
const CRITERION_OPS: &[&str] = &["lt", "lte", "gt", "gte", "eq"];
const EXECUTION_STATUSES: &[&str] = &["completed", "partial_failure", "failed"];
const ACTION_RESULT_STATUSES: &[&str] = &["completed", "failed", "skipped"];

/// Validate `payload` against the named contract.
pub fn validate(contract: &str, payload: &Value) -> Result<(), ContractViolations> {
    let mut issues = Vec::new();
    match object_of(payload) {
        Some(obj) => check_contract(contract, obj, &mut issues),
        None => issues.push("payload must be an object".to_string()),
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(ContractViolations {
            contract: contract.to_string(),
            issues,
        })
    }
}

fn check_contract(contract: &str, obj: &Map<String, Value>, issues: &mut Vec<String>) {
    match contract {
        "triage_request" => {
            if let Some(alert) = require_object(obj, "alert", issues) {
                require_string(alert, "alert_id", issues);
                require_string(alert, "rule_id", issues);
                require_enum(alert, "severity_original", SEVERITIES, issues);
            }
        }
        "triage_response" => {
            require_string(obj, "alert_id", issues);
            require_unit_number(obj, "priority_score", issues);
            require_enum(obj, "disposition", DISPOSITIONS, issues);
            require_object(obj, "factors", issues);
            require_string(obj, "triaged_at", issues);
        }
        "investigate_request" => {
            require_string(obj, "incident_id", issues);
            require_enum(obj, "mode", &["security", "operational"], issues);
            require_object(obj, "alert", issues);
            optional_string(obj, "previous_failure_analysis", issues);
            optional_object(obj, "change_event", issues);
        }
        "investigate_response" => {
            require_string(obj, "incident_id", issues);
            require_string(obj, "root_cause", issues);
            require_string_array(obj, "affected_services", issues);
            if let Some(assets) = require_array(obj, "compromised_assets", issues) {
                for (i, asset) in assets.iter().enumerate() {
                    match asset.as_object() {
                        Some(a) => {
                            if !a.get("asset_id").is_some_and(Value::is_string) {
                                issues.push(format!("compromised_assets[{i}].asset_id must be a string"));
                            }
                            if !a.get("confidence").is_some_and(Value::is_number) {
                                issues.push(format!("compromised_assets[{i}].confidence must be a number"));
                            }
                        }
                        None => issues.push(format!("compromised_assets[{i}] must be an object")),
                    }
                }
            }
            require_enum(obj, "recommended_next", RECOMMENDED_NEXT, issues);
            require_string_array(obj, "mitre_techniques", issues);
            require_array(obj, "attack_chain", issues);
            require_array(obj, "threat_intel_matches", issues);
        }
        "sweep_request" => {
            require_string(obj, "incident_id", issues);
            if let Some(iocs) = require_object(obj, "iocs", issues) {
                for kind in ["ips", "domains", "hashes", "processes"] {
                    require_string_array(iocs, kind, issues);
                }
            }
            require_string_array(obj, "compromised_users", issues);
        }
        "sweep_response" => {
            require_string(obj, "incident_id", issues);
            require_asset_array(obj, "confirmed_compromised", issues);
            require_asset_array(obj, "suspected", issues);
            require_array(obj, "behavioral_anomalies", issues);
            require_count(obj, "total_assets", issues);
            require_count(obj, "clean_assets", issues);
        }
        "plan_request" => {
            require_string(obj, "incident_id", issues);
            require_enum(obj, "severity", SEVERITIES, issues);
            require_object(obj, "investigation", issues);
            optional_object(obj, "threat_scope", issues);
        }
        "plan_response" => {
            require_string(obj, "incident_id", issues);
            if let Some(actions) = require_array(obj, "actions", issues) {
                for (i, action) in actions.iter().enumerate() {
                    check_planned_action(i, action, issues);
                }
            }
            if let Some(criteria) = require_array(obj, "success_criteria", issues) {
                for (i, criterion) in criteria.iter().enumerate() {
                    check_criterion(i, criterion, issues);
                }
            }
            require_bool(obj, "requires_approval", issues);
        }
        "execute_request" => {
            match obj.get("task").and_then(Value::as_str) {
                Some("execute_plan") => {}
                _ => issues.push("task must be 'execute_plan'".to_string()),
            }
            require_string(obj, "incident_id", issues);
            match obj.get("actions").and_then(Value::as_array) {
                Some(actions) if actions.is_empty() => {
                    issues.push("actions must be non-empty".to_string());
                }
                Some(_) => {}
                None => issues.push("missing field: actions (array)".to_string()),
            }
        }
        "execute_response" => {
            require_string(obj, "incident_id", issues);
            require_enum(obj, "status", EXECUTION_STATUSES, issues);
            if let Some(results) = require_array(obj, "action_results", issues) {
                for (i, result) in results.iter().enumerate() {
                    match result.as_object() {
                        Some(r) => {
                            if !r.get("order").and_then(Value::as_u64).is_some() {
                                issues.push(format!("action_results[{i}].order must be an integer"));
                            }
                            match r.get("status").and_then(Value::as_str) {
                                Some(s) if ACTION_RESULT_STATUSES.contains(&s) => {}
                                _ => issues.push(format!(
                                    "action_results[{i}].status must be one of {ACTION_RESULT_STATUSES:?}"
                                )),
                            }
                        }
                        None => issues.push(format!("action_results[{i}] must be an object")),
                    }
                }
            }
        }
        "verify_request" => {
            require_string(obj, "incident_id", issues);
            require_string_array(obj, "affected_services", issues);
            if let Some(criteria) = require_array(obj, "success_criteria", issues) {
                for (i, criterion) in criteria.iter().enumerate() {
                    check_criterion(i, criterion, issues);
                }
            }
            require_count(obj, "attempt", issues);
        }
        "verify_response" => {
            require_string(obj, "incident_id", issues);
            require_bool(obj, "passed", issues);
            require_unit_number(obj, "health_score", issues);
            require_array(obj, "criteria_results", issues);
            optional_string(obj, "failure_analysis", issues);
        }
        other => issues.push(format!("unknown contract: {other}")),
    }
}

fn check_planned_action(i: usize, action: &Value, issues: &mut Vec<String>) {
    let Some(a) = action.as_object() else {
        issues.push(format!("actions[{i}] must be an object"));
        return;
    };
    if a.get("order").and_then(Value::as_u64).is_none() {
        issues.push(format!("actions[{i}].order must be an integer"));
    }
    match a.get("action_type").and_then(Value::as_str) {
        Some(t) if ACTION_TYPES.contains(&t) => {}
        _ => issues.push(format!("actions[{i}].action_type must be one of {ACTION_TYPES:?}")),
    }
    for field in ["description", "target_system", "target_asset"] {
        if !a.get(field).is_some_and(Value::is_string) {
            issues.push(format!("actions[{i}].{field} must be a string"));
        }
    }
    if !a.get("approval_required").is_some_and(Value::is_boolean) {
        issues.push(format!("actions[{i}].approval_required must be a boolean"));
    }
}

fn check_criterion(i: usize, criterion: &Value, issues: &mut Vec<String>) {
    let Some(c) = criterion.as_object() else {
        issues.push(format!("success_criteria[{i}] must be an object"));
        return;
    };
    if !c.get("metric").is_some_and(Value::is_string) {
        issues.push(format!("success_criteria[{i}].metric must be a string"));
    }
    match c.get("operator").and_then(Value::as_str) {
        Some(op) if CRITERION_OPS.contains(&op) => {}
        _ => issues.push(format!("success_criteria[{i}].operator must be one of {CRITERION_OPS:?}")),
    }
    if !c.get("threshold").is_some_and(Value::is_number) {
        issues.push(format!("success_criteria[{i}].threshold must be a number"));
    }
}

fn object_of(value: &Value) -> Option<&Map<String, Value>> {
    value.as_object()
}

fn require_string(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    match obj.get(field).and_then(Value::as_str) {
        Some(s) if !s.trim().is_empty() => {}
        Some(_) => issues.push(format!("{field} must be non-empty")),
        None => issues.push(format!("missing field: {field} (string)")),
    }
}

fn optional_string(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    if let Some(v) = obj.get(field) {
        if !v.is_null() && !v.is_string() {
            issues.push(format!("{field} must be a string when present"));
        }
    }
}

fn require_bool(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    if !obj.get(field).is_some_and(Value::is_boolean) {
        issues.push(format!("missing field: {field} (boolean)"));
    }
}

fn require_unit_number(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    match obj.get(field).and_then(Value::as_f64) {
        Some(n) if (0.0..=1.0).contains(&n) => {}
        Some(n) => issues.push(format!("{field} must be in [0, 1], got {n}")),
        None => issues.push(format!("missing field: {field} (number)")),
    }
}

fn require_count(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    if obj.get(field).and_then(Value::as_u64).is_none() {
        issues.push(format!("missing field: {field} (non-negative integer)"));
    }
}

fn require_enum(obj: &Map<String, Value>, field: &str, allowed: &[&str], issues: &mut Vec<String>) {
    match obj.get(field).and_then(Value::as_str) {
        Some(v) if allowed.contains(&v) => {}
        Some(v) => issues.push(format!("{field} must be one of {allowed:?}, got '{v}'")),
        None => issues.push(format!("missing field: {field} (one of {allowed:?})")),
    }
}

fn require_object<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    issues: &mut Vec<String>,
) -> Option<&'a Map<String, Value>> {
    match obj.get(field).and_then(Value::as_object) {
        Some(o) => Some(o),
        None => {
            issues.push(format!("missing field: {field} (object)"));
            None
        }
    }
}

fn optional_object(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    if let Some(v) = obj.get(field) {
        if !v.is_null() && !v.is_object() {
            issues.push(format!("{field} must be an object when present"));
        }
    }
}

fn require_array<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
    issues: &mut Vec<String>,
) -> Option<&'a Vec<Value>> {
    match obj.get(field).and_then(Value::as_array) {
        Some(a) => Some(a),
        None => {
            issues.push(format!("missing field: {field} (array)"));
            None
        }
    }
}

fn require_string_array(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    if let Some(arr) = require_array(obj, field, issues) {
        for (i, v) in arr.iter().enumerate() {
            if !v.is_string() {
                issues.push(format!("{field}[{i}] must be a string"));
            }
        }
    }
}

fn require_asset_array(obj: &Map<String, Value>, field: &str, issues: &mut Vec<String>) {
    if let Some(arr) = require_array(obj, field, issues) {
        for (i, v) in arr.iter().enumerate() {
            match v.as_object() {
                Some(a) if a.get("asset_id").is_some_and(Value::is_string) => {}
                _ => issues.push(format!("{field}[{i}] must be an object with asset_id")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_triage_response() -> Value {
        json!({
            "alert_id": "A-001",
            "priority_score": 0.87,
            "disposition": "investigate",
            "factors": {"severity": 0.75},
            "triaged_at": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn test_triage_response_valid() {
        assert!(validate("triage_response", &valid_triage_response()).is_ok());
    }

    #[test]
    fn test_triage_response_accumulates_all_errors() {
        let payload = json!({
            "priority_score": 1.5,
            "disposition": "panic"
        });
        let err = validate("triage_response", &payload).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("alert_id")));
        assert!(err.issues.iter().any(|i| i.contains("priority_score")));
        assert!(err.issues.iter().any(|i| i.contains("disposition")));
        assert!(err.issues.iter().any(|i| i.contains("factors")));
        assert!(err.issues.iter().any(|i| i.contains("triaged_at")));
        assert_eq!(err.issues.len(), 5);
    }

    #[test]
    fn test_unknown_contract_rejected() {
        let err = validate("nonexistent", &json!({})).unwrap_err();
        assert!(err.issues[0].contains("unknown contract"));
    }

    #[test]
    fn test_non_object_payload_rejected() {
        let err = validate("triage_response", &json!([1, 2])).unwrap_err();
        assert_eq!(err.issues, vec!["payload must be an object".to_string()]);
    }

    #[test]
    fn test_investigate_response_asset_shape() {
        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "root_cause": "Credential stuffing from 10.0.0.5",
            "affected_services": ["api-gateway"],
            "compromised_assets": [
                {"asset_id": "user-42", "confidence": 0.9},
                {"asset_id": 7, "confidence": "high"}
            ],
            "recommended_next": "threat_hunt",
            "mitre_techniques": ["T1110"],
            "attack_chain": [],
            "threat_intel_matches": []
        });
        let err = validate("investigate_response", &payload).unwrap_err();
        assert_eq!(err.issues.len(), 2);
        assert!(err.issues[0].contains("compromised_assets[1].asset_id"));
        assert!(err.issues[1].contains("compromised_assets[1].confidence"));
    }

    #[test]
    fn test_execute_request_requires_task_marker() {
        let payload = json!({
            "task": "do_stuff",
            "incident_id": "INC-2026-ABCDE",
            "actions": []
        });
        let err = validate("execute_request", &payload).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("execute_plan")));
        assert!(err.issues.iter().any(|i| i.contains("non-empty")));
    }

    #[test]
    fn test_plan_response_action_and_criterion_checks() {
        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "actions": [
                {
                    "order": 1,
                    "action_type": "containment",
                    "description": "Isolate",
                    "target_system": "kubernetes",
                    "target_asset": "api-gateway",
                    "approval_required": true
                },
                {"order": "two", "action_type": "reboot"}
            ],
            "success_criteria": [
                {"metric": "error_rate", "operator": "lt", "threshold": 0.05},
                {"metric": "latency", "operator": "~", "threshold": "fast"}
            ],
            "requires_approval": true
        });
        let err = validate("plan_response", &payload).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("actions[1].order")));
        assert!(err.issues.iter().any(|i| i.contains("actions[1].action_type")));
        assert!(err.issues.iter().any(|i| i.contains("success_criteria[1].operator")));
        assert!(err.issues.iter().any(|i| i.contains("success_criteria[1].threshold")));
    }

    #[test]
    fn test_verify_response_valid() {
        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "passed": true,
            "health_score": 0.95,
            "criteria_results": []
        });
        assert!(validate("verify_response", &payload).is_ok());
    }

    #[test]
    fn test_sweep_request_ioc_arrays() {
        let payload = json!({
            "incident_id": "INC-2026-ABCDE",
            "iocs": {"ips": ["10.0.0.5"], "domains": [], "hashes": [], "processes": [9]},
            "compromised_users": ["user-42"]
        });
        let err = validate("sweep_request", &payload).unwrap_err();
        assert_eq!(err.issues.len(), 1);
        assert!(err.issues[0].contains("processes[0]"));
    }
}
