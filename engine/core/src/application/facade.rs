// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Engine Facade
//!
//! Wires the engine components together from configuration and exposes the
//! inbound surface: publish definitions and policy sets, register agents
//! and ports, then start/signal/query/cancel runs. Hosts (CLI, embedding
//! services) hold one `Engine`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::application::governance::PolicyEngine;
use crate::application::orchestrator::Orchestrator;
use crate::application::retrieval::ContextRetrievalService;
use crate::application::router::AgentRegistry;
use crate::domain::agent::{AgentDescriptor, AgentId};
use crate::domain::audit::EvidenceBundle;
use crate::domain::context::SourceIndex;
use crate::domain::error::EngineError;
use crate::domain::events::DomainEvent;
use crate::domain::invocation::Invocation;
use crate::domain::policy::PolicySet;
use crate::domain::ports::Port;
use crate::domain::repository::{
    AuditRecordStore, DefinitionRepository, EventJournal, InvocationRepository, RunRepository,
};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{RunId, RunSnapshot, WorkflowDefinition};
use crate::infrastructure::approval::ApprovalService;
use crate::infrastructure::audit_log::{AuditLog, AuditQuery};
use crate::infrastructure::config::{EngineConfig, StorageBackend};
use crate::infrastructure::event_bus::{EventBus, EventSubscription};
use crate::infrastructure::manifest::{PolicySetParser, WorkflowParser};
use crate::infrastructure::memory_index::InMemorySourceIndex;
use crate::infrastructure::repositories::{
    InMemoryAuditStore, InMemoryDefinitionRepository, InMemoryEventJournal,
    InMemoryInvocationRepository, InMemoryRunRepository, SledAuditStore,
    SledDefinitionRepository, SledEventJournal, SledInvocationRepository, SledRunRepository,
};

pub struct Engine {
    orchestrator: Arc<Orchestrator>,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    audit: Arc<AuditLog>,
    event_bus: Arc<EventBus>,
    definitions: Arc<dyn DefinitionRepository>,
    invocations: Arc<dyn InvocationRepository>,
}

impl Engine {
    /// Build an engine with the in-memory source index. Production
    /// deployments pass a search adapter via [`Engine::with_source_index`].
    pub fn new(config: &EngineConfig) -> Result<Self> {
        Self::with_source_index(config, Arc::new(InMemorySourceIndex::new()))
    }

    pub fn with_source_index(
        config: &EngineConfig,
        index: Arc<dyn SourceIndex>,
    ) -> Result<Self> {
        let (definitions, runs, invocations, audit_store, journal) = open_backend(config)?;

        let audit = Arc::new(AuditLog::new(
            audit_store,
            config.audit_signing_key.as_bytes().to_vec(),
        ));
        let event_bus = Arc::new(EventBus::new(journal, config.event_capacity));
        let policy = Arc::new(PolicyEngine::new(audit.clone(), event_bus.clone()));
        let registry = Arc::new(AgentRegistry::new(
            invocations.clone(),
            audit.clone(),
            config.rate_limit_per_minute,
        ));
        let retrieval = Arc::new(ContextRetrievalService::new(index, audit.clone()));
        let approvals = Arc::new(ApprovalService::new());

        let orchestrator = Arc::new(Orchestrator::new(
            definitions.clone(),
            runs,
            registry.clone(),
            policy.clone(),
            Some(retrieval),
            audit.clone(),
            event_bus.clone(),
            approvals,
            config,
        ));

        info!(storage = ?config.storage, "Engine assembled");
        Ok(Self {
            orchestrator,
            registry,
            policy,
            audit,
            event_bus,
            definitions,
            invocations,
        })
    }

    // ========================================================================
    // Catalogue & Governance Surface
    // ========================================================================

    pub async fn publish_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        self.definitions
            .save(&definition)
            .await
            .context("Failed to publish workflow definition")
    }

    pub async fn publish_definition_yaml(&self, yaml: &str) -> Result<WorkflowDefinition> {
        let definition = WorkflowParser::parse_yaml(yaml)?;
        self.publish_definition(definition.clone()).await?;
        Ok(definition)
    }

    pub async fn install_policy_set(
        &self,
        tenant: Option<&TenantId>,
        set: PolicySet,
    ) -> Result<(), EngineError> {
        self.policy.install(tenant, set).await
    }

    pub async fn install_policy_yaml(&self, yaml: &str) -> Result<()> {
        let (tenant, set) = PolicySetParser::parse_yaml(yaml)?;
        self.policy
            .install(tenant.as_ref(), set)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))
    }

    pub fn register_agent(&self, descriptor: AgentDescriptor) -> AgentId {
        self.registry.register(descriptor)
    }

    pub fn register_port(&self, name: impl Into<String>, port: Arc<dyn Port>) {
        self.registry.register_port(name, port);
    }

    // ========================================================================
    // Inbound Run Surface
    // ========================================================================

    pub async fn start_workflow(
        &self,
        definition_name: &str,
        tenant_id: TenantId,
        input: serde_json::Value,
    ) -> Result<RunId, EngineError> {
        self.orchestrator
            .start(definition_name, tenant_id, input)
            .await
    }

    pub async fn signal(
        &self,
        run_id: RunId,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.orchestrator.signal(run_id, signal_name, payload).await
    }

    pub async fn query(&self, run_id: RunId) -> Result<RunSnapshot, EngineError> {
        self.orchestrator.query(run_id).await
    }

    pub async fn cancel(&self, run_id: RunId) -> Result<(), EngineError> {
        self.orchestrator.cancel(run_id).await
    }

    /// Resume checkpointed runs after a process restart.
    pub async fn resume_all(&self) -> Result<usize, EngineError> {
        self.orchestrator.resume_all().await
    }

    // ========================================================================
    // Observability Surface
    // ========================================================================

    pub fn subscribe(
        &self,
        type_pattern: impl Into<String>,
        tenant_id: TenantId,
    ) -> EventSubscription {
        self.event_bus.subscribe(type_pattern, tenant_id)
    }

    /// Re-read a tenant's durable event journal from a sequence.
    pub async fn replay_events(
        &self,
        tenant_id: &TenantId,
        from_sequence: u64,
    ) -> Result<Vec<(u64, crate::domain::events::Event)>, EngineError> {
        self.event_bus
            .replay(tenant_id, from_sequence)
            .await
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn invocations_for_run(
        &self,
        run_id: RunId,
    ) -> Result<Vec<Invocation>, EngineError> {
        Ok(self.invocations.find_by_run(run_id).await?)
    }

    /// Export a signed, independently verifiable audit chain segment and
    /// announce it on the event bus.
    pub async fn export_evidence(
        &self,
        tenant_id: &TenantId,
        filter: &AuditQuery,
    ) -> Result<EvidenceBundle, EngineError> {
        let bundle = self.audit.export_evidence(tenant_id, filter).await?;
        let event = DomainEvent::AuditEvidenceAppended {
            record_count: bundle.records.len(),
            head_hash: bundle.head_hash.clone(),
            exported_at: bundle.exported_at,
        };
        if let Err(e) = self
            .event_bus
            .publish(event.into_envelope(tenant_id.clone(), None))
            .await
        {
            tracing::warn!(error = %e, "Failed to publish evidence export event");
        }
        Ok(bundle)
    }
}

type Backend = (
    Arc<dyn DefinitionRepository>,
    Arc<dyn RunRepository>,
    Arc<dyn InvocationRepository>,
    Arc<dyn AuditRecordStore>,
    Arc<dyn EventJournal>,
);

fn open_backend(config: &EngineConfig) -> Result<Backend> {
    match &config.storage {
        StorageBackend::InMemory => Ok((
            Arc::new(InMemoryDefinitionRepository::new()),
            Arc::new(InMemoryRunRepository::new()),
            Arc::new(InMemoryInvocationRepository::new()),
            Arc::new(InMemoryAuditStore::new()),
            Arc::new(InMemoryEventJournal::new()),
        )),
        StorageBackend::Sled { path } => {
            let db = sled::open(path)
                .with_context(|| format!("Failed to open sled store at {}", path.display()))?;
            Ok((
                Arc::new(SledDefinitionRepository::open(&db)?),
                Arc::new(SledRunRepository::open(&db)?),
                Arc::new(SledInvocationRepository::open(&db)?),
                Arc::new(SledAuditStore::open(&db)?),
                Arc::new(SledEventJournal::open(&db)?),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_engine_assembles_in_memory() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        assert_eq!(engine.registry().list_agents().len(), 0);
    }

    #[tokio::test]
    async fn test_engine_assembles_sled() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            storage: StorageBackend::Sled {
                path: dir.path().join("engine-db"),
            },
            ..Default::default()
        };
        let engine = Engine::new(&config).unwrap();
        let definition = WorkflowParser::parse_yaml(
            r#"
apiVersion: synapse.dev/v1
kind: Workflow
metadata:
  name: smoke
  version: 1
spec:
  steps:
    - name: only
      capability: cap.only
"#,
        )
        .unwrap();
        engine.publish_definition(definition).await.unwrap();
    }

    #[tokio::test]
    async fn test_evidence_export_publishes_event() {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let tenant = TenantId::new("t1");
        let mut sub = engine.subscribe("audit.*", tenant.clone());

        let bundle = engine
            .export_evidence(&tenant, &AuditQuery::default())
            .await
            .unwrap();
        assert!(bundle.records.is_empty());

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, "audit.evidence_appended");
    }
}
