// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Governance Policy Domain Model
//!
//! Declarative policies gate every orchestrated action: an action-type
//! pattern selects the policies to run, a rule expression is evaluated
//! against the action context, and the policy's outcome decides whether the
//! action proceeds, is rewritten, is blocked, or requires human approval.
//!
//! Policy sets are versioned per tenant; a run pins the version active at
//! start and keeps it for its whole lifetime.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::tenant::TenantId;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid rule pattern: {0}")]
    InvalidPattern(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub Uuid);

impl PolicyId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PolicyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who a policy applies to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum PolicyScope {
    Global,
    Tenant { tenant_id: TenantId },
}

impl PolicyScope {
    pub fn applies_to(&self, tenant: &TenantId) -> bool {
        match self {
            Self::Global => true,
            Self::Tenant { tenant_id } => tenant_id == tenant,
        }
    }
}

// ============================================================================
// Rule Expressions
// ============================================================================

/// Declarative rule AST evaluated against the action context (a JSON
/// document). Field paths are JSON pointers (e.g., "/input/consent").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleExpr {
    /// Every sub-rule must hold
    All { rules: Vec<RuleExpr> },

    /// At least one sub-rule must hold
    Any { rules: Vec<RuleExpr> },

    /// Negation
    Not { rule: Box<RuleExpr> },

    /// Field exists (any value, including null)
    FieldExists { pointer: String },

    /// Field equals the given JSON value
    FieldEquals {
        pointer: String,
        value: serde_json::Value,
    },

    /// Field is a string matching the regex
    FieldMatches { pointer: String, pattern: String },

    /// Always holds; useful as a catch-all guard
    Always,
}

impl RuleExpr {
    /// Evaluate against an action context document.
    pub fn evaluate(&self, context: &serde_json::Value) -> Result<bool, PolicyError> {
        Ok(match self {
            Self::All { rules } => {
                for rule in rules {
                    if !rule.evaluate(context)? {
                        return Ok(false);
                    }
                }
                true
            }
            Self::Any { rules } => {
                for rule in rules {
                    if rule.evaluate(context)? {
                        return Ok(true);
                    }
                }
                false
            }
            Self::Not { rule } => !rule.evaluate(context)?,
            Self::FieldExists { pointer } => context.pointer(pointer).is_some(),
            Self::FieldEquals { pointer, value } => {
                context.pointer(pointer).is_some_and(|v| v == value)
            }
            Self::FieldMatches { pointer, pattern } => {
                let re = regex::Regex::new(pattern)
                    .map_err(|e| PolicyError::InvalidPattern(e.to_string()))?;
                context
                    .pointer(pointer)
                    .and_then(|v| v.as_str())
                    .is_some_and(|s| re.is_match(s))
            }
            Self::Always => true,
        })
    }
}

// ============================================================================
// Outcomes & Escalation
// ============================================================================

/// What a matched policy decides for the action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyOutcome {
    /// Proceed unchanged
    Allow,

    /// Proceed with the payload rewritten by a JSON merge patch
    Modify { patch: serde_json::Value },

    /// Do not proceed; no side effect is performed for the action
    Block { reason: String },

    /// Suspend for human judgment instead of deciding automatically
    RequireApproval,
}

/// What happens when an approval wait hits its deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationDefault {
    AutoApprove,
    #[default]
    AutoReject,
}

/// A single governance policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub name: String,

    #[serde(flatten)]
    pub scope: PolicyScope,

    /// Wildcard pattern over action types, e.g. "step.governance-check.pre"
    /// or "step.*"
    pub action_pattern: String,

    /// Rule that must hold for the outcome to apply
    pub rule: RuleExpr,

    pub outcome: PolicyOutcome,

    #[serde(default)]
    pub escalation: EscalationDefault,
}

impl Policy {
    pub fn matches_action(&self, action_type: &str) -> bool {
        matches_pattern(&self.action_pattern, action_type)
    }
}

/// Versioned set of policies for one scope. Versions are monotonic; a run
/// evaluates against the newest set whose version does not exceed the
/// version pinned at run start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySet {
    pub version: u32,
    pub policies: Vec<Policy>,
}

/// Wildcard matcher over dotted action types: exact match, "*" for
/// everything, or a "prefix.*" segment wildcard.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == "*" || pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(".*") {
        return value.starts_with(prefix)
            && value[prefix.len()..].starts_with('.');
    }
    false
}

/// RFC 7386 JSON merge patch: objects merge recursively, null removes a key,
/// anything else replaces.
pub fn merge_patch(target: &mut serde_json::Value, patch: &serde_json::Value) {
    if let serde_json::Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = serde_json::Value::Object(serde_json::Map::new());
        }
        let target_map = target.as_object_mut().expect("target coerced to object");
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(
                    target_map
                        .entry(key.clone())
                        .or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
    } else {
        *target = patch.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("*", "step.publish.pre"));
        assert!(matches_pattern("step.publish.pre", "step.publish.pre"));
        assert!(matches_pattern("step.*", "step.publish.pre"));
        assert!(!matches_pattern("step.*", "steps.publish"));
        assert!(!matches_pattern("step.publish.pre", "step.publish.post"));
    }

    #[test]
    fn test_rule_field_checks() {
        let ctx = json!({"input": {"consent": true, "region": "eu-west"}});

        let exists = RuleExpr::FieldExists {
            pointer: "/input/consent".to_string(),
        };
        assert!(exists.evaluate(&ctx).unwrap());

        let missing = RuleExpr::Not {
            rule: Box::new(RuleExpr::FieldExists {
                pointer: "/input/license".to_string(),
            }),
        };
        assert!(missing.evaluate(&ctx).unwrap());

        let equals = RuleExpr::FieldEquals {
            pointer: "/input/consent".to_string(),
            value: json!(true),
        };
        assert!(equals.evaluate(&ctx).unwrap());

        let matches = RuleExpr::FieldMatches {
            pointer: "/input/region".to_string(),
            pattern: "^eu-".to_string(),
        };
        assert!(matches.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_rule_combinators() {
        let ctx = json!({"a": 1});
        let rule = RuleExpr::All {
            rules: vec![
                RuleExpr::FieldExists {
                    pointer: "/a".to_string(),
                },
                RuleExpr::Any {
                    rules: vec![
                        RuleExpr::FieldExists {
                            pointer: "/b".to_string(),
                        },
                        RuleExpr::Always,
                    ],
                },
            ],
        };
        assert!(rule.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_invalid_regex_is_an_error() {
        let rule = RuleExpr::FieldMatches {
            pointer: "/x".to_string(),
            pattern: "(unclosed".to_string(),
        };
        assert!(rule.evaluate(&json!({"x": "y"})).is_err());
    }

    #[test]
    fn test_merge_patch_semantics() {
        let mut target = json!({"title": "a", "tags": {"draft": true, "beta": true}});
        merge_patch(
            &mut target,
            &json!({"title": "b", "tags": {"draft": null}, "extra": 1}),
        );
        assert_eq!(
            target,
            json!({"title": "b", "tags": {"beta": true}, "extra": 1})
        );
    }

    #[test]
    fn test_scope_application() {
        let t1 = TenantId::new("t1");
        let t2 = TenantId::new("t2");
        let scoped = PolicyScope::Tenant {
            tenant_id: t1.clone(),
        };
        assert!(scoped.applies_to(&t1));
        assert!(!scoped.applies_to(&t2));
        assert!(PolicyScope::Global.applies_to(&t2));
    }
}
