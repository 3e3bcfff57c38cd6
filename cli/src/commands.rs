// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use synapse_core::application::Engine;
use synapse_core::domain::agent::AgentDescriptor;
use synapse_core::domain::audit::EvidenceBundle;
use synapse_core::domain::ports::{Port, PortError, PortHealth, PortRequest, PortResponse};
use synapse_core::domain::tenant::TenantId;
use synapse_core::domain::workflow::{Capability, WorkflowDefinition};
use synapse_core::infrastructure::audit_log::AuditQuery;
use synapse_core::infrastructure::config::EngineConfig;
use synapse_core::infrastructure::manifest::{PolicySetParser, WorkflowParser};

/// Echo adapter standing in for an external system during simulation
struct EchoPort {
    capability: String,
}

#[async_trait]
impl Port for EchoPort {
    fn capability(&self) -> &str {
        &self.capability
    }

    async fn invoke(&self, request: PortRequest) -> Result<PortResponse, PortError> {
        info!(
            capability = %self.capability,
            idempotency_key = %request.idempotency_key,
            "Echo port invoked"
        );
        Ok(PortResponse {
            payload: serde_json::json!({
                "ok": true,
                "capability": self.capability,
                "echo": request.payload,
            }),
            confidence: Some(1.0),
            citations: request
                .context
                .map(|pack| pack.citations())
                .unwrap_or_default(),
        })
    }

    async fn health(&self) -> PortHealth {
        PortHealth::Up
    }
}

pub fn validate(files: &[std::path::PathBuf]) -> Result<()> {
    for file in files {
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        if content.contains("kind: Workflow") {
            let definition = WorkflowParser::parse_yaml(&content)
                .with_context(|| format!("{} is not a valid workflow manifest", file.display()))?;
            println!(
                "ok: {} (workflow '{}' v{}, {} steps)",
                file.display(),
                definition.name,
                definition.version,
                definition.steps.len()
            );
        } else if content.contains("kind: PolicySet") {
            let (tenant, set) = PolicySetParser::parse_yaml(&content)
                .with_context(|| format!("{} is not a valid policy set manifest", file.display()))?;
            println!(
                "ok: {} (policy set v{} for {}, {} policies)",
                file.display(),
                set.version,
                tenant
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "<global>".to_string()),
                set.policies.len()
            );
        } else {
            bail!("{}: unknown manifest kind", file.display());
        }
    }
    Ok(())
}

pub async fn simulate(
    config: &EngineConfig,
    workflow: &Path,
    policies: &[std::path::PathBuf],
    tenant: &str,
    input: &str,
    export_evidence: Option<&Path>,
) -> Result<()> {
    let definition = WorkflowParser::parse_file(workflow)?;
    let input: serde_json::Value =
        serde_json::from_str(input).context("--input is not valid JSON")?;
    let tenant = TenantId::new(tenant);

    let engine = Engine::new(config)?;
    register_echo_agents(&engine, &definition);
    engine.publish_definition(definition.clone()).await?;

    for path in policies {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        engine.install_policy_yaml(&content).await?;
    }

    let mut events = engine.subscribe("*", tenant.clone());
    let run_id = engine
        .start_workflow(&definition.name, tenant.clone(), input)
        .await?;
    println!("run {run_id} started");

    // Stream events until the run terminates
    let snapshot = loop {
        while let Ok(event) = events.try_recv() {
            println!("  event: {} ({})", event.event_type, event.id);
        }
        let snapshot = engine.query(run_id).await?;
        if snapshot.state.is_terminal() {
            break snapshot;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    while let Ok(event) = events.try_recv() {
        println!("  event: {} ({})", event.event_type, event.id);
    }

    println!("run {} finished: {}", run_id, snapshot.state);
    if let Some(failure) = &snapshot.failure {
        println!("  reason: {}", failure.reason);
        if let Some(record) = failure.audit_record_id {
            println!("  audit record: {record}");
        }
    }
    for (step, output) in &snapshot.step_outputs {
        println!("  output[{step}]: {output}");
    }

    engine
        .audit()
        .verify(&tenant)
        .await
        .context("audit chain verification failed")?;
    println!("audit chain verified");

    if let Some(path) = export_evidence {
        let bundle = engine
            .export_evidence(&tenant, &AuditQuery::default())
            .await?;
        std::fs::write(path, serde_json::to_string_pretty(&bundle)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!(
            "evidence bundle written to {} ({} records)",
            path.display(),
            bundle.records.len()
        );
    }

    Ok(())
}

/// One echo agent (and port) per capability the workflow touches.
fn register_echo_agents(engine: &Engine, definition: &WorkflowDefinition) {
    let mut capabilities: Vec<&Capability> = definition
        .steps
        .iter()
        .chain(definition.compensation_steps.iter())
        .map(|s| &s.capability)
        .collect();
    capabilities.sort_by_key(|c| c.as_str().to_string());
    capabilities.dedup();

    for capability in capabilities {
        engine.register_port(
            capability.as_str(),
            Arc::new(EchoPort {
                capability: capability.as_str().to_string(),
            }),
        );
        engine.register_agent(AgentDescriptor::new(
            format!("sim-{}", capability.as_str().replace('.', "-")),
            "simulation",
            capability.clone(),
            vec!["*".to_string()],
            vec![],
            4,
        ));
    }
}

pub fn verify_evidence(bundle_path: &Path, key: &str) -> Result<()> {
    let content = std::fs::read_to_string(bundle_path)
        .with_context(|| format!("Failed to read {}", bundle_path.display()))?;
    let bundle: EvidenceBundle =
        serde_json::from_str(&content).context("Bundle is not valid JSON")?;

    bundle
        .verify(key.as_bytes())
        .context("Evidence bundle failed verification")?;
    println!(
        "ok: {} records for tenant '{}', head hash {}",
        bundle.records.len(),
        bundle.tenant_id,
        bundle.head_hash
    );
    Ok(())
}
