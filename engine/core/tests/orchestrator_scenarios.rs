// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! End-to-end orchestration scenarios:
//! 1. Governance block fails the run with zero port calls
//! 2. Primary agent timeout falls back to the next-ranked agent
//! 3. Approval timeout auto-rejects and compensates completed steps
//! 4. Crash-and-resume never duplicates an external side effect
//! 5. Audit coverage: one record per step attempt and per policy evaluation

mod support;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use support::{wait_for_suspended, wait_for_terminal, MockPort};
use synapse_core::application::Engine;
use synapse_core::domain::agent::AgentDescriptor;
use synapse_core::domain::invocation::InvocationOutcome;
use synapse_core::domain::tenant::TenantId;
use synapse_core::domain::workflow::{Capability, RunState};
use synapse_core::infrastructure::audit_log::AuditQuery;
use synapse_core::infrastructure::config::{EngineConfig, StorageBackend};

const PUBLISH_WORKFLOW: &str = r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: publish-content
  version: 1
spec:
  steps:
    - name: governance-check
      capability: governance.check
      timeout: 2s
    - name: publish
      capability: cms.publish
      timeout: 2s
  compensation_steps:
    - name: unpublish
      capability: cms.unpublish
  compensation:
    publish: unpublish
"#;

const CONSENT_POLICY: &str = r#"
apiVersion: synapse.dev/v1
kind: PolicySet
metadata:
  tenant: t1
  version: 1
spec:
  policies:
    - name: require-consent
      action_pattern: step.governance-check.pre
      rule:
        op: not
        rule:
          op: field_exists
          pointer: /input/consent
      outcome:
        kind: block
        reason: missing consent flag
"#;

fn agent(name: &str, capability: &str) -> AgentDescriptor {
    AgentDescriptor::new(
        name,
        "content",
        Capability::new(capability),
        vec!["*".to_string()],
        vec![],
        4,
    )
}

async fn publish_engine() -> (Engine, Arc<MockPort>, Arc<MockPort>, Arc<MockPort>) {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine.publish_definition_yaml(PUBLISH_WORKFLOW).await.unwrap();

    let governance = MockPort::up("governance.check");
    let cms = MockPort::up("cms.publish");
    let unpublish = MockPort::up("cms.unpublish");
    engine.register_port("governance.check", governance.clone());
    engine.register_port("cms.publish", cms.clone());
    engine.register_port("cms.unpublish", unpublish.clone());
    engine.register_agent(agent("governance-bot", "governance.check"));
    engine.register_agent(agent("cms-writer", "cms.publish"));
    engine.register_agent(agent("cms-eraser", "cms.unpublish"));

    (engine, governance, cms, unpublish)
}

// ============================================================================
// Scenario A: policy Block → Failed, zero port calls, one Block record
// ============================================================================

#[tokio::test]
async fn governance_block_fails_run_with_zero_port_calls() {
    let (engine, governance, cms, _) = publish_engine().await;
    engine.install_policy_yaml(CONSENT_POLICY).await.unwrap();

    let tenant = TenantId::new("t1");
    let run_id = engine
        .start_workflow("publish-content", tenant.clone(), json!({"contentId": "c1"}))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Failed);

    // The blocked action performed no side effects at all
    assert_eq!(governance.call_count(), 0);
    assert_eq!(cms.call_count(), 0);
    assert!(engine.invocations_for_run(run_id).await.unwrap().is_empty());

    // Exactly one audit record with a Block outcome, and the failure
    // surface points at it
    let evaluations = engine
        .audit()
        .query(
            &tenant,
            &AuditQuery {
                action: Some("policy.evaluate".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let blocks: Vec<_> = evaluations
        .iter()
        .filter(|r| {
            r.policy_outcome
                .as_ref()
                .is_some_and(|o| o.kind == "block")
        })
        .collect();
    assert_eq!(blocks.len(), 1);

    let failure = snapshot.failure.expect("failed run carries a reason");
    assert!(failure.reason.contains("require-consent"));
    assert_eq!(failure.audit_record_id, Some(blocks[0].id.0));

    engine.audit().verify(&tenant).await.unwrap();
}

#[tokio::test]
async fn consent_present_allows_run_to_complete() {
    let (engine, governance, cms, unpublish) = publish_engine().await;
    engine.install_policy_yaml(CONSENT_POLICY).await.unwrap();

    let run_id = engine
        .start_workflow(
            "publish-content",
            TenantId::new("t1"),
            json!({"contentId": "c1", "consent": true}),
        )
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Completed);
    assert_eq!(governance.call_count(), 1);
    assert_eq!(cms.call_count(), 1);
    assert_eq!(unpublish.call_count(), 0);
}

// ============================================================================
// Scenario B: primary times out → ranked fallback succeeds
// ============================================================================

#[tokio::test]
async fn primary_timeout_falls_back_to_next_ranked_agent() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: resilient-publish
  version: 1
spec:
  steps:
    - name: publish
      capability: cms.publish
      timeout: 300ms
      retry:
        max_attempts: 3
        backoff_base: 10ms
    - name: notify
      capability: notify.send
      timeout: 2s
"#,
        )
        .await
        .unwrap();

    let slow = MockPort::slow("cms.publish", Duration::from_secs(5));
    let fast = MockPort::up("cms.publish");
    let notify = MockPort::up("notify.send");
    engine.register_port("cms-primary", slow.clone());
    engine.register_port("cms-backup", fast.clone());
    engine.register_port("notify.send", notify.clone());

    // Registered first, so the primary on fresh (tied) stats
    engine.register_agent(
        agent("primary-writer", "cms.publish").with_executor_port("cms-primary"),
    );
    engine.register_agent(
        agent("backup-writer", "cms.publish").with_executor_port("cms-backup"),
    );
    engine.register_agent(agent("notifier", "notify.send"));

    let run_id = engine
        .start_workflow("resilient-publish", TenantId::new("t1"), json!({}))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Completed);

    // The run proceeded to the next step after the fallback succeeded
    assert_eq!(notify.call_count(), 1);
    assert_eq!(slow.call_count(), 1);
    assert_eq!(fast.call_count(), 1);

    // Two invocation records for the publish step: the timed-out primary
    // attempt and the successful fallback attempt
    let invocations = engine.invocations_for_run(run_id).await.unwrap();
    let publish_attempts: Vec<_> = invocations
        .iter()
        .filter(|i| i.step.as_str() == "publish")
        .collect();
    assert_eq!(publish_attempts.len(), 2);
    assert!(matches!(
        publish_attempts[0].outcome,
        InvocationOutcome::TimedOut
    ));
    assert!(matches!(
        publish_attempts[1].outcome,
        InvocationOutcome::Succeeded
    ));
    assert_ne!(publish_attempts[0].agent_id, publish_attempts[1].agent_id);
}

// ============================================================================
// Scenario C: approval timeout → auto-reject → compensation → Failed
// ============================================================================

#[tokio::test]
async fn approval_timeout_auto_rejects_and_compensates() {
    let config = EngineConfig {
        approval_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let engine = Engine::new(&config).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: gated-publish
  version: 1
spec:
  steps:
    - name: publish
      capability: cms.publish
      timeout: 2s
    - name: announce
      capability: notify.send
      timeout: 2s
      requires_approval: true
  compensation_steps:
    - name: unpublish
      capability: cms.unpublish
  compensation:
    publish: unpublish
"#,
        )
        .await
        .unwrap();

    let cms = MockPort::up("cms.publish");
    let notify = MockPort::up("notify.send");
    let unpublish = MockPort::up("cms.unpublish");
    engine.register_port("cms.publish", cms.clone());
    engine.register_port("notify.send", notify.clone());
    engine.register_port("cms.unpublish", unpublish.clone());
    engine.register_agent(agent("cms-writer", "cms.publish"));
    engine.register_agent(agent("notifier", "notify.send"));
    engine.register_agent(agent("cms-eraser", "cms.unpublish"));

    let tenant = TenantId::new("t1");
    let mut events = engine.subscribe("workflow.*", tenant.clone());

    let run_id = engine
        .start_workflow("gated-publish", tenant.clone(), json!({"contentId": "c1"}))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Failed);
    let failure = snapshot.failure.expect("failed run carries a reason");
    assert!(failure.reason.contains("auto-rejected"));

    // The approved step never ran; the completed one was compensated
    assert_eq!(cms.call_count(), 1);
    assert_eq!(notify.call_count(), 0);
    assert_eq!(unpublish.call_count(), 1);

    // The suspension was announced before the timeout fired
    let mut saw_approval_request = false;
    while let Ok(event) = events.try_recv() {
        if event.event_type == "workflow.hil_approval_required" {
            saw_approval_request = true;
        }
    }
    assert!(saw_approval_request);
}

#[tokio::test]
async fn approval_signal_resumes_run() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: gated
  version: 1
spec:
  steps:
    - name: publish
      capability: cms.publish
      timeout: 2s
      requires_approval: true
"#,
        )
        .await
        .unwrap();
    let cms = MockPort::up("cms.publish");
    engine.register_port("cms.publish", cms.clone());
    engine.register_agent(agent("cms-writer", "cms.publish"));

    let run_id = engine
        .start_workflow("gated", TenantId::new("t1"), json!({}))
        .await
        .unwrap();

    wait_for_suspended(&engine, run_id).await;
    engine
        .signal(run_id, "approve", json!({"by": "alice"}))
        .await
        .unwrap();

    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Completed);
    assert_eq!(cms.call_count(), 1);
}

#[tokio::test]
async fn signal_on_non_suspended_run_is_an_error() {
    let (engine, _, _, _) = publish_engine().await;
    let run_id = engine
        .start_workflow(
            "publish-content",
            TenantId::new("t1"),
            json!({"consent": true}),
        )
        .await
        .unwrap();
    wait_for_terminal(&engine, run_id).await;

    let result = engine.signal(run_id, "approve", json!({})).await;
    assert!(result.is_err());
}

// ============================================================================
// Crash-and-resume idempotency
// ============================================================================

#[test]
fn crash_resume_does_not_duplicate_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("engine-db");
    let config = EngineConfig {
        storage: StorageBackend::Sled {
            path: db_path.clone(),
        },
        ..Default::default()
    };

    // The port survives the "crash": it stands in for the external system
    let cms = MockPort::crashy("cms.publish");

    // Phase 1: the side effect commits, then the process dies mid-call
    let run_id = {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let run_id = runtime.block_on(async {
            let engine = Engine::new(&config).unwrap();
            engine
                .publish_definition_yaml(
                    r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: once-only
  version: 1
spec:
  steps:
    - name: publish
      capability: cms.publish
      timeout: 30s
"#,
                )
                .await
                .unwrap();
            engine.register_port("cms.publish", cms.clone());
            engine.register_agent(agent("cms-writer", "cms.publish"));

            let run_id = engine
                .start_workflow("once-only", TenantId::new("t1"), json!({"contentId": "c1"}))
                .await
                .unwrap();

            // Wait until the port has committed the side effect
            for _ in 0..500 {
                if cms.side_effect_count() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(cms.side_effect_count(), 1);
            run_id
        });
        // Dropping the runtime aborts the driver mid-invocation
        run_id
    };

    // Phase 2: a fresh process resumes from the checkpoint and re-delivers
    // the same idempotency key
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let engine = Engine::new(&config).unwrap();
        engine.register_port("cms.publish", cms.clone());
        engine.register_agent(agent("cms-writer", "cms.publish"));

        let resumed = engine.resume_all().await.unwrap();
        assert_eq!(resumed, 1);

        let snapshot = wait_for_terminal(&engine, run_id).await;
        assert_eq!(snapshot.state, RunState::Completed);
    });

    // The port saw a second delivery of the key, but only one side effect
    assert_eq!(cms.side_effect_count(), 1);
    assert!(cms.call_count() >= 2);
}

// ============================================================================
// Audit coverage properties
// ============================================================================

#[tokio::test]
async fn audit_has_one_record_per_attempt_and_per_evaluation() {
    let (engine, _, _, _) = publish_engine().await;
    let tenant = TenantId::new("t1");

    let run_id = engine
        .start_workflow(
            "publish-content",
            tenant.clone(),
            json!({"contentId": "c1", "consent": true}),
        )
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Completed);

    let attempts = engine
        .audit()
        .query(
            &tenant,
            &AuditQuery {
                run_id: Some(run_id),
                action: Some("step.attempt".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let invocations = engine.invocations_for_run(run_id).await.unwrap();
    assert_eq!(attempts.len(), invocations.len());
    assert_eq!(attempts.len(), 2);

    // Two evaluations (pre + post) per executed attempt
    let evaluations = engine
        .audit()
        .query(
            &tenant,
            &AuditQuery {
                run_id: Some(run_id),
                action: Some("policy.evaluate".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(evaluations.len(), 4);

    engine.audit().verify(&tenant).await.unwrap();
}

#[tokio::test]
async fn transient_failures_retry_within_budget() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: retry-me
  version: 1
spec:
  steps:
    - name: publish
      capability: cms.publish
      timeout: 2s
      retry:
        max_attempts: 3
        backoff_base: 10ms
"#,
        )
        .await
        .unwrap();

    let cms = MockPort::flaky("cms.publish", 2);
    engine.register_port("cms.publish", cms.clone());
    engine.register_agent(agent("cms-writer", "cms.publish"));

    let run_id = engine
        .start_workflow("retry-me", TenantId::new("t1"), json!({}))
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Completed);
    assert_eq!(cms.call_count(), 3);

    let invocations = engine.invocations_for_run(run_id).await.unwrap();
    assert_eq!(invocations.len(), 3);
}

#[tokio::test]
async fn retry_exhaustion_fails_and_compensates() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: doomed
  version: 1
spec:
  steps:
    - name: stage
      capability: cms.stage
      timeout: 2s
    - name: publish
      capability: cms.publish
      timeout: 2s
      retry:
        max_attempts: 2
        backoff_base: 10ms
  compensation_steps:
    - name: unstage
      capability: cms.unstage
  compensation:
    stage: unstage
"#,
        )
        .await
        .unwrap();

    let stage = MockPort::up("cms.stage");
    let publish = MockPort::flaky("cms.publish", 99);
    let unstage = MockPort::up("cms.unstage");
    engine.register_port("cms.stage", stage.clone());
    engine.register_port("cms.publish", publish.clone());
    engine.register_port("cms.unstage", unstage.clone());
    engine.register_agent(agent("stager", "cms.stage"));
    engine.register_agent(agent("cms-writer", "cms.publish"));
    engine.register_agent(agent("unstager", "cms.unstage"));

    let run_id = engine
        .start_workflow("doomed", TenantId::new("t1"), json!({}))
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&engine, run_id).await;

    assert_eq!(snapshot.state, RunState::Failed);
    assert_eq!(publish.call_count(), 2);
    // The completed stage step was compensated in reverse order
    assert_eq!(unstage.call_count(), 1);
    let failure = snapshot.failure.unwrap();
    assert!(failure.reason.contains("exhausted"));
}

#[tokio::test]
async fn cancel_runs_compensation_before_terminal_state() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: cancellable
  version: 1
spec:
  steps:
    - name: stage
      capability: cms.stage
      timeout: 2s
    - name: publish
      capability: cms.publish
      timeout: 30s
  compensation_steps:
    - name: unstage
      capability: cms.unstage
  compensation:
    stage: unstage
"#,
        )
        .await
        .unwrap();

    let stage = MockPort::up("cms.stage");
    let publish = MockPort::slow("cms.publish", Duration::from_secs(20));
    let unstage = MockPort::up("cms.unstage");
    engine.register_port("cms.stage", stage.clone());
    engine.register_port("cms.publish", publish.clone());
    engine.register_port("cms.unstage", unstage.clone());
    engine.register_agent(agent("stager", "cms.stage"));
    engine.register_agent(agent("cms-writer", "cms.publish"));
    engine.register_agent(agent("unstager", "cms.unstage"));

    let run_id = engine
        .start_workflow("cancellable", TenantId::new("t1"), json!({}))
        .await
        .unwrap();

    // Let the first step finish and the second get in flight
    for _ in 0..500 {
        if publish.call_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.cancel(run_id).await.unwrap();

    let snapshot = wait_for_terminal(&engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Cancelled);
    assert_eq!(unstage.call_count(), 1);
}

#[tokio::test]
async fn fan_out_joins_before_next_step() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    engine
        .publish_definition_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: broadcast
  version: 1
spec:
  steps:
    - name: deliver
      capability: notify.send
      timeout: 2s
      fan_out:
        items_pointer: /input/channels
        max_parallelism: 2
    - name: record
      capability: crm.log
      timeout: 2s
"#,
        )
        .await
        .unwrap();

    let notify = MockPort::up("notify.send");
    let crm = MockPort::up("crm.log");
    engine.register_port("notify.send", notify.clone());
    engine.register_port("crm.log", crm.clone());
    engine.register_agent(agent("notifier", "notify.send"));
    engine.register_agent(agent("logger", "crm.log"));

    let run_id = engine
        .start_workflow(
            "broadcast",
            TenantId::new("t1"),
            json!({"channels": ["email", "sms", "push"]}),
        )
        .await
        .unwrap();
    let snapshot = wait_for_terminal(&engine, run_id).await;

    assert_eq!(snapshot.state, RunState::Completed);
    assert_eq!(notify.call_count(), 3);
    assert_eq!(crm.call_count(), 1);

    // The joined output keeps item order
    let deliver_output = snapshot
        .step_outputs
        .iter()
        .find(|(name, _)| name.as_str() == "deliver")
        .map(|(_, output)| output)
        .unwrap();
    assert_eq!(deliver_output["items"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn events_are_journaled_in_publish_order() {
    let (engine, _, _, _) = publish_engine().await;
    let tenant = TenantId::new("t1");

    let run_id = engine
        .start_workflow(
            "publish-content",
            tenant.clone(),
            json!({"consent": true}),
        )
        .await
        .unwrap();
    wait_for_terminal(&engine, run_id).await;

    // Journal sequences are contiguous, bracketed by the start and
    // completion events
    let journal = engine.replay_events(&tenant, 0).await.unwrap();
    let sequences: Vec<u64> = journal.iter().map(|(seq, _)| *seq).collect();
    let expected: Vec<u64> = (0..journal.len() as u64).collect();
    assert_eq!(sequences, expected);
    assert_eq!(journal[0].1.event_type, "workflow.started");
    assert_eq!(journal.last().unwrap().1.event_type, "workflow.completed");

    // Subscribers deduplicate by event id; ids in the journal are unique
    let mut ids: Vec<String> = journal.iter().map(|(_, e)| e.id.to_string()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), journal.len());
}
