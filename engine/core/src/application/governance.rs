// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Policy (Governance) Engine Application Service
//!
//! Evaluates declarative policies against proposed actions, twice per step:
//! pre-action (authorize) and post-action (validate the result). Evaluation
//! is synchronous and blocking: no side-effecting call proceeds before a
//! pre-action decision is returned. Every evaluation is recorded in the
//! audit log; a Block additionally publishes `PolicyViolationDetected`.
//!
//! Policy sets are versioned per scope (tenant or global) and versions are
//! monotonic. A run pins the active version at start and evaluates against
//! it for its whole lifetime, so rule changes never apply retroactively
//! mid-run.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::domain::audit::{ActorId, AuditRecordId, PolicyOutcomeRecord};
use crate::domain::error::EngineError;
use crate::domain::events::DomainEvent;
use crate::domain::policy::{merge_patch, EscalationDefault, Policy, PolicyOutcome, PolicySet};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::RunId;
use crate::infrastructure::audit_log::AuditLog;
use crate::infrastructure::event_bus::EventBus;

/// Action submitted for evaluation.
#[derive(Debug, Clone)]
pub struct ProposedAction {
    /// Dotted action type, e.g. "step.governance-check.pre"
    pub action_type: String,
    pub tenant_id: TenantId,
    pub run_id: Option<RunId>,

    /// Evaluation context document the rule pointers resolve against
    /// (payload, run input, prior outputs)
    pub context: serde_json::Value,
}

/// Result of an evaluation, with the audit record that recorded it.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub outcome: PolicyOutcome,
    pub policy_id: Option<crate::domain::policy::PolicyId>,
    pub policy_name: Option<String>,
    pub escalation: EscalationDefault,
    pub audit_record_id: AuditRecordId,
}

/// Keyed by tenant ("" is the global scope); each scope holds its installed
/// sets sorted by version.
type ScopeKey = String;

const GLOBAL_SCOPE: &str = "";

pub struct PolicyEngine {
    sets: RwLock<HashMap<ScopeKey, Vec<PolicySet>>>,
    audit: Arc<AuditLog>,
    event_bus: Arc<EventBus>,
    default_escalation: EscalationDefault,
}

impl PolicyEngine {
    pub fn new(audit: Arc<AuditLog>, event_bus: Arc<EventBus>) -> Self {
        Self {
            sets: RwLock::new(HashMap::new()),
            audit,
            event_bus,
            default_escalation: EscalationDefault::AutoReject,
        }
    }

    /// Install a policy set for a tenant (or globally with `tenant: None`).
    /// Versions within a scope must be strictly increasing.
    pub async fn install(
        &self,
        tenant: Option<&TenantId>,
        set: PolicySet,
    ) -> Result<(), EngineError> {
        let key = tenant.map(|t| t.as_str().to_string()).unwrap_or_default();
        let mut sets = self.sets.write().await;
        let scope = sets.entry(key.clone()).or_default();
        if let Some(last) = scope.last() {
            if set.version <= last.version {
                return Err(EngineError::Internal(format!(
                    "policy set version {} is not newer than installed version {}",
                    set.version, last.version
                )));
            }
        }
        let scope_label = if key.is_empty() { "<global>" } else { key.as_str() };
        info!(
            scope = %scope_label,
            version = set.version,
            policies = set.policies.len(),
            "Policy set installed"
        );
        scope.push(set);
        Ok(())
    }

    /// Version a run starting now for this tenant would pin: the newest
    /// installed version across the tenant's scope and the global scope.
    pub async fn active_version(&self, tenant: &TenantId) -> u32 {
        let sets = self.sets.read().await;
        let scope_max = |key: &str| {
            sets.get(key)
                .and_then(|s| s.last())
                .map(|s| s.version)
                .unwrap_or(0)
        };
        scope_max(tenant.as_str()).max(scope_max(GLOBAL_SCOPE))
    }

    /// Policies visible at a pinned version: the newest set per scope whose
    /// version does not exceed the pin.
    async fn policies_at(&self, tenant: &TenantId, pinned_version: u32) -> Vec<Policy> {
        let sets = self.sets.read().await;
        let pick = |key: &str| {
            sets.get(key)
                .map(|scope| {
                    scope
                        .iter()
                        .filter(|s| s.version <= pinned_version)
                        .next_back()
                        .map(|s| s.policies.clone())
                        .unwrap_or_default()
                })
                .unwrap_or_default()
        };
        let mut policies = pick(tenant.as_str());
        policies.extend(pick(GLOBAL_SCOPE));
        policies
    }

    /// Evaluate an action against the policies pinned at `pinned_version`.
    ///
    /// Resolution order: any Block wins; otherwise a RequireApproval wins;
    /// otherwise Modify patches (in policy order) are folded into one;
    /// otherwise Allow. The evaluation itself is always audited.
    pub async fn evaluate(
        &self,
        action: &ProposedAction,
        pinned_version: u32,
    ) -> Result<PolicyDecision, EngineError> {
        let policies = self.policies_at(&action.tenant_id, pinned_version).await;

        let mut block: Option<&Policy> = None;
        let mut approval: Option<&Policy> = None;
        let mut patches: Vec<&Policy> = Vec::new();

        for policy in policies
            .iter()
            .filter(|p| p.matches_action(&action.action_type))
        {
            let holds = policy
                .rule
                .evaluate(&action.context)
                .map_err(|e| EngineError::Internal(format!("policy rule error: {e}")))?;
            if !holds {
                continue;
            }
            match &policy.outcome {
                PolicyOutcome::Block { .. } => {
                    block = Some(policy);
                    break;
                }
                PolicyOutcome::RequireApproval => {
                    approval.get_or_insert(policy);
                }
                PolicyOutcome::Modify { .. } => patches.push(policy),
                PolicyOutcome::Allow => {}
            }
        }

        let (outcome, matched) = if let Some(policy) = block {
            (policy.outcome.clone(), Some(policy))
        } else if let Some(policy) = approval {
            (PolicyOutcome::RequireApproval, Some(policy))
        } else if !patches.is_empty() {
            let mut combined = serde_json::Value::Object(serde_json::Map::new());
            for policy in &patches {
                if let PolicyOutcome::Modify { patch } = &policy.outcome {
                    combine_patches(&mut combined, patch);
                }
            }
            (PolicyOutcome::Modify { patch: combined }, patches.first().copied())
        } else {
            (PolicyOutcome::Allow, None)
        };

        let escalation = matched
            .map(|p| p.escalation)
            .unwrap_or(self.default_escalation);

        let outcome_record = PolicyOutcomeRecord {
            kind: outcome_kind(&outcome).to_string(),
            policy_id: matched.map(|p| p.id.0),
            reason: match &outcome {
                PolicyOutcome::Block { reason } => Some(reason.clone()),
                _ => None,
            },
        };

        let record = self
            .audit
            .append(
                &action.tenant_id,
                ActorId::System,
                "policy.evaluate",
                serde_json::json!({
                    "action_type": action.action_type,
                    "run_id": action.run_id.map(|id| id.to_string()),
                    "pinned_version": pinned_version,
                    "decision": outcome_kind(&outcome),
                    "policy": matched.map(|p| p.name.clone()),
                }),
                Some(outcome_record),
            )
            .await?;

        if let PolicyOutcome::Block { reason } = &outcome {
            let policy = matched.expect("block always has a matched policy");
            warn!(
                action_type = %action.action_type,
                tenant_id = %action.tenant_id,
                policy = %policy.name,
                reason = %reason,
                "Action blocked by policy"
            );
            let event = DomainEvent::PolicyViolationDetected {
                run_id: action.run_id,
                policy_id: policy.id.0,
                action: action.action_type.clone(),
                reason: reason.clone(),
                detected_at: chrono::Utc::now(),
            };
            if let Err(e) = self
                .event_bus
                .publish(event.into_envelope(
                    action.tenant_id.clone(),
                    Some(record.id.to_string()),
                ))
                .await
            {
                warn!(error = %e, "Failed to publish policy violation event");
            }
        }

        Ok(PolicyDecision {
            outcome,
            policy_id: matched.map(|p| p.id),
            policy_name: matched.map(|p| p.name.clone()),
            escalation,
            audit_record_id: record.id,
        })
    }
}

fn outcome_kind(outcome: &PolicyOutcome) -> &'static str {
    match outcome {
        PolicyOutcome::Allow => "allow",
        PolicyOutcome::Modify { .. } => "modify",
        PolicyOutcome::Block { .. } => "block",
        PolicyOutcome::RequireApproval => "require_approval",
    }
}

/// Fold patch `b` over patch `a` so that applying the combined patch equals
/// applying `a` then `b`. Unlike [`merge_patch`], nulls are kept (they still
/// have to delete keys when the combined patch is applied).
fn combine_patches(a: &mut serde_json::Value, b: &serde_json::Value) {
    match (a, b) {
        (serde_json::Value::Object(a_map), serde_json::Value::Object(b_map)) => {
            for (key, b_value) in b_map {
                match a_map.get_mut(key) {
                    Some(a_value) if a_value.is_object() && b_value.is_object() => {
                        combine_patches(a_value, b_value);
                    }
                    _ => {
                        a_map.insert(key.clone(), b_value.clone());
                    }
                }
            }
        }
        (a_slot, b_value) => *a_slot = b_value.clone(),
    }
}

/// Apply a policy decision's patch (if any) to a payload.
pub fn apply_decision_patch(payload: &mut serde_json::Value, decision: &PolicyDecision) {
    if let PolicyOutcome::Modify { patch } = &decision.outcome {
        merge_patch(payload, patch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{PolicyId, PolicyScope, RuleExpr};
    use crate::infrastructure::audit_log::AuditQuery;
    use crate::infrastructure::repositories::{InMemoryAuditStore, InMemoryEventJournal};
    use serde_json::json;

    fn engine() -> (Arc<PolicyEngine>, Arc<AuditLog>, Arc<EventBus>) {
        let audit = Arc::new(AuditLog::new(
            Arc::new(InMemoryAuditStore::new()),
            b"test-key".to_vec(),
        ));
        let bus = Arc::new(EventBus::new(Arc::new(InMemoryEventJournal::new()), 16));
        let engine = Arc::new(PolicyEngine::new(audit.clone(), bus.clone()));
        (engine, audit, bus)
    }

    fn policy(
        name: &str,
        pattern: &str,
        rule: RuleExpr,
        outcome: PolicyOutcome,
        tenant: Option<&str>,
    ) -> Policy {
        Policy {
            id: PolicyId::new(),
            name: name.to_string(),
            scope: match tenant {
                Some(t) => PolicyScope::Tenant {
                    tenant_id: TenantId::new(t),
                },
                None => PolicyScope::Global,
            },
            action_pattern: pattern.to_string(),
            rule,
            outcome,
            escalation: EscalationDefault::AutoReject,
        }
    }

    fn action(action_type: &str, context: serde_json::Value) -> ProposedAction {
        ProposedAction {
            action_type: action_type.to_string(),
            tenant_id: TenantId::new("t1"),
            run_id: None,
            context,
        }
    }

    #[tokio::test]
    async fn test_default_is_allow_and_audited() {
        let (engine, audit, _) = engine();
        let decision = engine
            .evaluate(&action("step.publish.pre", json!({})), 0)
            .await
            .unwrap();
        assert_eq!(decision.outcome, PolicyOutcome::Allow);

        let records = audit
            .query(
                &TenantId::new("t1"),
                &AuditQuery {
                    action: Some("policy.evaluate".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_block_wins_and_publishes_violation() {
        let (engine, _, bus) = engine();
        let mut sub = bus.subscribe("governance.*", TenantId::new("t1"));

        engine
            .install(
                Some(&TenantId::new("t1")),
                PolicySet {
                    version: 1,
                    policies: vec![
                        policy(
                            "allow-all",
                            "step.*",
                            RuleExpr::Always,
                            PolicyOutcome::Allow,
                            Some("t1"),
                        ),
                        policy(
                            "require-consent",
                            "step.governance-check.pre",
                            RuleExpr::Not {
                                rule: Box::new(RuleExpr::FieldExists {
                                    pointer: "/input/consent".to_string(),
                                }),
                            },
                            PolicyOutcome::Block {
                                reason: "missing consent flag".to_string(),
                            },
                            Some("t1"),
                        ),
                    ],
                },
            )
            .await
            .unwrap();

        let decision = engine
            .evaluate(
                &action("step.governance-check.pre", json!({"input": {}})),
                1,
            )
            .await
            .unwrap();
        assert!(matches!(decision.outcome, PolicyOutcome::Block { .. }));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "governance.policy_violation");
    }

    #[tokio::test]
    async fn test_version_pinning_ignores_later_sets() {
        let (engine, _, _) = engine();
        let tenant = TenantId::new("t1");

        engine
            .install(
                Some(&tenant),
                PolicySet {
                    version: 1,
                    policies: vec![],
                },
            )
            .await
            .unwrap();
        let pinned = engine.active_version(&tenant).await;
        assert_eq!(pinned, 1);

        // A stricter set lands mid-run
        engine
            .install(
                Some(&tenant),
                PolicySet {
                    version: 2,
                    policies: vec![policy(
                        "block-everything",
                        "*",
                        RuleExpr::Always,
                        PolicyOutcome::Block {
                            reason: "lockdown".to_string(),
                        },
                        Some("t1"),
                    )],
                },
            )
            .await
            .unwrap();

        // The pinned run still evaluates under version 1
        let decision = engine
            .evaluate(&action("step.publish.pre", json!({})), pinned)
            .await
            .unwrap();
        assert_eq!(decision.outcome, PolicyOutcome::Allow);

        // A new run would pin version 2 and get blocked
        let decision = engine
            .evaluate(&action("step.publish.pre", json!({})), 2)
            .await
            .unwrap();
        assert!(matches!(decision.outcome, PolicyOutcome::Block { .. }));
    }

    #[tokio::test]
    async fn test_modify_patches_fold_in_order() {
        let (engine, _, _) = engine();
        engine
            .install(
                None,
                PolicySet {
                    version: 1,
                    policies: vec![
                        policy(
                            "tag-source",
                            "step.*",
                            RuleExpr::Always,
                            PolicyOutcome::Modify {
                                patch: json!({"meta": {"source": "synapse", "draft": true}}),
                            },
                            None,
                        ),
                        policy(
                            "final",
                            "step.*",
                            RuleExpr::Always,
                            PolicyOutcome::Modify {
                                patch: json!({"meta": {"draft": false}}),
                            },
                            None,
                        ),
                    ],
                },
            )
            .await
            .unwrap();

        let decision = engine
            .evaluate(&action("step.publish.pre", json!({})), 1)
            .await
            .unwrap();

        let mut payload = json!({"title": "x"});
        apply_decision_patch(&mut payload, &decision);
        assert_eq!(
            payload,
            json!({"title": "x", "meta": {"source": "synapse", "draft": false}})
        );
    }

    #[tokio::test]
    async fn test_non_monotonic_install_rejected() {
        let (engine, _, _) = engine();
        let tenant = TenantId::new("t1");
        engine
            .install(
                Some(&tenant),
                PolicySet {
                    version: 3,
                    policies: vec![],
                },
            )
            .await
            .unwrap();
        assert!(engine
            .install(
                Some(&tenant),
                PolicySet {
                    version: 3,
                    policies: vec![],
                },
            )
            .await
            .is_err());
    }
}
