// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Audit chain and evidence bundle integration tests: the chain produced by
//! a real run recomputes exactly, any mutation breaks it from that point
//! forward, and exported bundles verify independently of the engine.

mod support;

use serde_json::json;
use support::{wait_for_terminal, MockPort};
use synapse_core::application::Engine;
use synapse_core::domain::agent::AgentDescriptor;
use synapse_core::domain::audit::verify_chain;
use synapse_core::domain::tenant::TenantId;
use synapse_core::domain::workflow::{Capability, RunState};
use synapse_core::infrastructure::audit_log::AuditQuery;
use synapse_core::infrastructure::config::EngineConfig;

const WORKFLOW: &str = r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: two-step
  version: 1
spec:
  steps:
    - name: stage
      capability: cms.stage
      timeout: 2s
    - name: publish
      capability: cms.publish
      timeout: 2s
"#;

async fn completed_run(engine: &Engine, tenant: &TenantId) {
    engine.publish_definition_yaml(WORKFLOW).await.unwrap();
    engine.register_port("cms.stage", MockPort::up("cms.stage"));
    engine.register_port("cms.publish", MockPort::up("cms.publish"));
    engine.register_agent(AgentDescriptor::new(
        "stager",
        "content",
        Capability::new("cms.stage"),
        vec!["*".to_string()],
        vec![],
        2,
    ));
    engine.register_agent(AgentDescriptor::new(
        "writer",
        "content",
        Capability::new("cms.publish"),
        vec!["*".to_string()],
        vec![],
        2,
    ));

    let run_id = engine
        .start_workflow("two-step", tenant.clone(), json!({"contentId": "c1"}))
        .await
        .unwrap();
    let snapshot = wait_for_terminal(engine, run_id).await;
    assert_eq!(snapshot.state, RunState::Completed);
}

#[tokio::test]
async fn chain_from_real_run_recomputes_exactly() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let tenant = TenantId::new("t1");
    completed_run(&engine, &tenant).await;

    engine.audit().verify(&tenant).await.unwrap();

    let records = engine
        .audit()
        .query(&tenant, &AuditQuery::default())
        .await
        .unwrap();
    assert!(!records.is_empty());
    verify_chain(&records).unwrap();

    // Every stored hash matches an independent recompute
    for record in &records {
        assert_eq!(record.compute_hash().unwrap(), record.hash);
    }
}

#[tokio::test]
async fn single_byte_mutation_breaks_chain_from_that_point() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let tenant = TenantId::new("t1");
    completed_run(&engine, &tenant).await;

    let mut records = engine
        .audit()
        .query(&tenant, &AuditQuery::default())
        .await
        .unwrap();
    assert!(records.len() >= 3);

    // Flip one byte in a middle record's action
    let index = records.len() / 2;
    let mut action = records[index].action.clone().into_bytes();
    action[0] ^= 0x01;
    records[index].action = String::from_utf8(action).unwrap();

    let err = verify_chain(&records).unwrap_err();
    let message = err.to_string();
    assert!(message.contains(&format!("sequence {index}")));

    // Records before the mutation still verify
    verify_chain(&records[..index]).unwrap();
}

#[tokio::test]
async fn exported_bundle_is_independently_verifiable() {
    let config = EngineConfig {
        audit_signing_key: "compliance-reviewer-key".to_string(),
        ..Default::default()
    };
    let engine = Engine::new(&config).unwrap();
    let tenant = TenantId::new("t1");
    completed_run(&engine, &tenant).await;

    let bundle = engine
        .export_evidence(&tenant, &AuditQuery::default())
        .await
        .unwrap();
    assert!(!bundle.records.is_empty());

    // A reviewer holding only the bundle and the key can verify it
    let serialized = serde_json::to_string(&bundle).unwrap();
    let parsed: synapse_core::domain::audit::EvidenceBundle =
        serde_json::from_str(&serialized).unwrap();
    parsed.verify(b"compliance-reviewer-key").unwrap();
    assert!(parsed.verify(b"wrong-key").is_err());

    // Tampering with any record invalidates the bundle
    let mut tampered = bundle;
    tampered.records[0].context = json!({"forged": true});
    assert!(tampered.verify(b"compliance-reviewer-key").is_err());
}

#[tokio::test]
async fn evidence_segment_can_start_mid_chain() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let tenant = TenantId::new("t1");
    completed_run(&engine, &tenant).await;

    // Export only the step attempts; the segment is contiguous within the
    // filtered action type but starts past the chain genesis
    let bundle = engine
        .export_evidence(
            &tenant,
            &AuditQuery {
                action: Some("step.attempt".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(bundle.records.len(), 2);

    // Per-record hashes still verify even though the segment is filtered;
    // full-link verification is only defined for contiguous segments
    for record in &bundle.records {
        assert_eq!(record.compute_hash().unwrap(), record.hash);
    }
}
