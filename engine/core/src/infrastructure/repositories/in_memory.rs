// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
// In-memory repositories for development and testing. State is lost on
// restart; durable deployments use the sled-backed implementations.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::audit::AuditRecord;
use crate::domain::events::Event;
use crate::domain::invocation::Invocation;
use crate::domain::repository::{
    AuditRecordStore, DefinitionRepository, EventJournal, InvocationRepository, RepositoryError,
    RunRepository,
};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{DefinitionId, RunId, WorkflowDefinition, WorkflowRun};

// ============================================================================
// Definitions
// ============================================================================

#[derive(Default)]
pub struct InMemoryDefinitionRepository {
    definitions: RwLock<HashMap<(String, u32), WorkflowDefinition>>,
}

impl InMemoryDefinitionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let key = (definition.name.clone(), definition.version);
        let mut definitions = self.definitions.write().await;
        if definitions.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "definition '{}' version {} already published",
                definition.name, definition.version
            )));
        }
        definitions.insert(key, definition.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: DefinitionId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.values().find(|d| d.id == id).cloned())
    }

    async fn find(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&(name.to_string(), version)).cloned())
    }

    async fn find_latest(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        let definitions = self.definitions.read().await;
        Ok(definitions
            .values()
            .filter(|d| d.name == name)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_all(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.read().await.values().cloned().collect())
    }
}

// ============================================================================
// Runs
// ============================================================================

#[derive(Default)]
pub struct InMemoryRunRepository {
    runs: RwLock<HashMap<RunId, WorkflowRun>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter(|r| !r.state.is_terminal())
            .cloned()
            .collect())
    }
}

// ============================================================================
// Invocations
// ============================================================================

#[derive(Default)]
pub struct InMemoryInvocationRepository {
    invocations: RwLock<Vec<Invocation>>,
}

impl InMemoryInvocationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvocationRepository for InMemoryInvocationRepository {
    async fn append(&self, invocation: &Invocation) -> Result<(), RepositoryError> {
        self.invocations.write().await.push(invocation.clone());
        Ok(())
    }

    async fn find_by_run(&self, run_id: RunId) -> Result<Vec<Invocation>, RepositoryError> {
        Ok(self
            .invocations
            .read()
            .await
            .iter()
            .filter(|i| i.run_id == run_id)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Audit
// ============================================================================

#[derive(Default)]
pub struct InMemoryAuditStore {
    chains: RwLock<HashMap<String, Vec<AuditRecord>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditRecordStore for InMemoryAuditStore {
    async fn append(
        &self,
        tenant_id: &TenantId,
        record: &AuditRecord,
    ) -> Result<(), RepositoryError> {
        self.chains
            .write()
            .await
            .entry(tenant_id.as_str().to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn head(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<(String, u64)>, RepositoryError> {
        Ok(self
            .chains
            .read()
            .await
            .get(tenant_id.as_str())
            .and_then(|chain| chain.last())
            .map(|r| (r.hash.clone(), r.sequence)))
    }

    async fn load_chain(&self, tenant_id: &TenantId) -> Result<Vec<AuditRecord>, RepositoryError> {
        Ok(self
            .chains
            .read()
            .await
            .get(tenant_id.as_str())
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Events
// ============================================================================

#[derive(Default)]
pub struct InMemoryEventJournal {
    streams: RwLock<HashMap<String, Vec<Event>>>,
}

impl InMemoryEventJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventJournal for InMemoryEventJournal {
    async fn append(&self, event: &Event) -> Result<u64, RepositoryError> {
        let mut streams = self.streams.write().await;
        let stream = streams
            .entry(event.tenant_id.as_str().to_string())
            .or_default();
        stream.push(event.clone());
        Ok((stream.len() - 1) as u64)
    }

    async fn replay(
        &self,
        tenant_id: &TenantId,
        from_sequence: u64,
    ) -> Result<Vec<(u64, Event)>, RepositoryError> {
        Ok(self
            .streams
            .read()
            .await
            .get(tenant_id.as_str())
            .map(|stream| {
                stream
                    .iter()
                    .enumerate()
                    .skip(from_sequence as usize)
                    .map(|(seq, event)| (seq as u64, event.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}
