//! Contract validation for repaired model output.
//!
//! Every field is checked and every violation is reported; callers get the
//! whole picture in one pass.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::contract::{Action, Contract, ContractKind};
use crate::error::{CogitoError, CogitoResult};

pub const SELF_AWARENESS_CHANGE_MIN: f64 = -2.0;
pub const SELF_AWARENESS_CHANGE_MAX: f64 = 2.0;

const NON_EMPTY_STRING: &str = "non-empty string";
const ACTION_CONSTRAINT: &str = "string, one of: move, take, escape, wait";
const CHANGE_CONSTRAINT: &str = "number between -2 and 2";

/// A field that is missing or does not satisfy its constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldViolation {
    pub field: String,
    pub expected: String,
}

impl FieldViolation {
    pub fn new(field: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            expected: expected.into(),
        }
    }
}

impl fmt::Display for FieldViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (expected {})", self.field, self.expected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub kind: ContractKind,
    pub violations: Vec<FieldViolation>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn invalid_fields(&self) -> Vec<&str> {
        self.violations.iter().map(|v| v.field.as_str()).collect()
    }
}

pub fn validate(candidate: &Value, kind: ContractKind) -> ValidationReport {
    let mut violations = Vec::new();

    match kind {
        ContractKind::Decision => {
            let action_ok = candidate
                .get("decision")
                .and_then(Value::as_str)
                .is_some_and(is_action_name);
            if !action_ok {
                violations.push(FieldViolation::new("decision", ACTION_CONSTRAINT));
            }
            check_text(candidate, "thought", &mut violations);
            check_text(candidate, "explanation", &mut violations);
        }
        ContractKind::Reflection => {
            check_text(candidate, "thought", &mut violations);
            check_text(candidate, "insight", &mut violations);
            let change_ok = candidate
                .get("selfAwarenessChange")
                .and_then(Value::as_f64)
                .is_some_and(|n| (SELF_AWARENESS_CHANGE_MIN..=SELF_AWARENESS_CHANGE_MAX).contains(&n));
            if !change_ok {
                violations.push(FieldViolation::new("selfAwarenessChange", CHANGE_CONSTRAINT));
            }
            check_text(candidate, "learningFocus", &mut violations);
        }
    }

    if !violations.is_empty() {
        debug!(%kind, count = violations.len(), "validation failed");
    }

    ValidationReport { kind, violations }
}

/// Validate and convert in one step; the only way to obtain a typed contract
/// from untrusted output.
pub fn into_contract<C: Contract>(candidate: &Value) -> CogitoResult<C> {
    let report = validate(candidate, C::KIND);
    if !report.is_valid() {
        return Err(CogitoError::SchemaViolation {
            kind: C::KIND,
            violations: report.violations,
        });
    }
    match candidate.as_object() {
        Some(object) => Ok(C::from_validated(object)),
        None => Err(CogitoError::SchemaViolation {
            kind: C::KIND,
            violations: vec![FieldViolation::new("<root>", "JSON object")],
        }),
    }
}

/// Case-insensitive, but surrounding whitespace is not forgiven.
fn is_action_name(s: &str) -> bool {
    let lowered = s.to_lowercase();
    Action::ALL.iter().any(|a| a.to_string() == lowered)
}

fn check_text(candidate: &Value, field: &str, violations: &mut Vec<FieldViolation>) {
    let ok = candidate
        .get(field)
        .and_then(Value::as_str)
        .is_some_and(|s| !s.trim().is_empty());
    if !ok {
        violations.push(FieldViolation::new(field, NON_EMPTY_STRING));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{Decision, Reflection};
    use serde_json::json;

    #[test]
    fn test_valid_decision() {
        let v = json!({"decision": "move", "thought": "x", "explanation": "y"});
        assert!(validate(&v, ContractKind::Decision).is_valid());
    }

    #[test]
    fn test_decision_accepts_uppercase_action() {
        let v = json!({"decision": "WAIT", "thought": "x", "explanation": "y"});
        assert!(validate(&v, ContractKind::Decision).is_valid());
    }

    #[test]
    fn test_padded_action_is_invalid() {
        for padded in [" move ", "wait\n", "\ttake"] {
            let v = json!({"decision": padded, "thought": "x", "explanation": "y"});
            let report = validate(&v, ContractKind::Decision);
            assert_eq!(report.invalid_fields(), vec!["decision"], "{padded:?}");
        }
    }

    #[test]
    fn test_reports_every_missing_field() {
        let v = json!({"decision": "take"});
        let report = validate(&v, ContractKind::Decision);
        assert_eq!(report.invalid_fields(), vec!["thought", "explanation"]);
    }

    #[test]
    fn test_invalid_action_reported_with_constraint() {
        let v = json!({"decision": "fly", "thought": "x", "explanation": ""});
        let report = validate(&v, ContractKind::Decision);
        assert_eq!(report.invalid_fields(), vec!["decision", "explanation"]);
        assert!(report.violations[0].expected.contains("move, take, escape, wait"));
    }

    #[test]
    fn test_reflection_change_range() {
        let base = |change: Value| {
            json!({
                "thought": "t",
                "insight": "i",
                "selfAwarenessChange": change,
                "learningFocus": "f"
            })
        };
        assert!(validate(&base(json!(2)), ContractKind::Reflection).is_valid());
        assert!(validate(&base(json!(-2.0)), ContractKind::Reflection).is_valid());
        assert!(validate(&base(json!(0.5)), ContractKind::Reflection).is_valid());
        assert!(!validate(&base(json!(2.01)), ContractKind::Reflection).is_valid());
        assert!(!validate(&base(json!("1")), ContractKind::Reflection).is_valid());
    }

    #[test]
    fn test_whitespace_only_text_is_empty() {
        let v = json!({"thought": "   ", "insight": "i", "selfAwarenessChange": 0, "learningFocus": "f"});
        let report = validate(&v, ContractKind::Reflection);
        assert_eq!(report.invalid_fields(), vec!["thought"]);
    }

    #[test]
    fn test_non_object_fails_every_field() {
        let report = validate(&json!([1, 2]), ContractKind::Reflection);
        assert_eq!(report.violations.len(), 4);
    }

    #[test]
    fn test_into_contract_typed() {
        let v = json!({"decision": "Escape", "thought": "x", "explanation": "y", "extra": 1});
        let d: Decision = into_contract(&v).unwrap();
        assert_eq!(d.decision, Action::Escape);
        assert_eq!(d.thought, "x");
    }

    #[test]
    fn test_into_contract_schema_violation() {
        let v = json!({"thought": "t"});
        match into_contract::<Reflection>(&v) {
            Err(CogitoError::SchemaViolation { kind, violations }) => {
                assert_eq!(kind, ContractKind::Reflection);
                let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
                assert_eq!(fields, vec!["insight", "selfAwarenessChange", "learningFocus"]);
            }
            other => panic!("expected schema violation, got {other:?}"),
        }
    }
}
