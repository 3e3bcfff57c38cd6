// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain Repository Interfaces
//!
//! Persistence contracts for each aggregate, following the repository
//! pattern: one trait per aggregate, defined in the domain layer,
//! implemented in `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `DefinitionRepository` | `WorkflowDefinition` | `InMemoryDefinitionRepository`, `SledDefinitionRepository` |
//! | `RunRepository` | `WorkflowRun` (checkpoints) | `InMemoryRunRepository`, `SledRunRepository` |
//! | `InvocationRepository` | `Invocation` | `InMemoryInvocationRepository`, `SledInvocationRepository` |
//! | `AuditRecordStore` | `AuditRecord` chains | `InMemoryAuditStore`, `SledAuditStore` |
//! | `EventJournal` | `Event` log | `InMemoryEventJournal`, `SledEventJournal` |
//!
//! Concrete implementations are selected at startup from configuration:
//! in-memory for development and testing, sled for durable single-node
//! deployments.

use async_trait::async_trait;

use crate::domain::audit::AuditRecord;
use crate::domain::events::Event;
use crate::domain::invocation::Invocation;
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{DefinitionId, RunId, WorkflowDefinition, WorkflowRun};

/// Repository interface for published workflow definitions
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Save a definition (definitions are immutable; saving the same
    /// name+version twice is an error)
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: DefinitionId)
        -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn find(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    /// Newest version published under the name
    async fn find_latest(&self, name: &str) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError>;
}

/// Repository interface for run checkpoints. `save` is the durable
/// checkpoint write the orchestrator issues after every state transition.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError>;

    async fn find_by_id(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError>;

    /// Runs in a non-terminal state, for crash recovery
    async fn find_active(&self) -> Result<Vec<WorkflowRun>, RepositoryError>;
}

/// Repository interface for invocation records (append-only)
#[async_trait]
pub trait InvocationRepository: Send + Sync {
    async fn append(&self, invocation: &Invocation) -> Result<(), RepositoryError>;

    async fn find_by_run(&self, run_id: RunId) -> Result<Vec<Invocation>, RepositoryError>;
}

/// Storage backing a tenant's audit chain. Appends are serialized by the
/// audit log; the store only persists and reads.
#[async_trait]
pub trait AuditRecordStore: Send + Sync {
    async fn append(&self, tenant_id: &TenantId, record: &AuditRecord)
        -> Result<(), RepositoryError>;

    /// Hash and sequence of the newest record, if any
    async fn head(&self, tenant_id: &TenantId)
        -> Result<Option<(String, u64)>, RepositoryError>;

    /// Full chain in sequence order
    async fn load_chain(&self, tenant_id: &TenantId) -> Result<Vec<AuditRecord>, RepositoryError>;
}

/// Durable, per-tenant ordered event journal. `append` must not return
/// until the event is durable; the assigned sequence is the per-tenant
/// publish order.
#[async_trait]
pub trait EventJournal: Send + Sync {
    async fn append(&self, event: &Event) -> Result<u64, RepositoryError>;

    /// Events with sequence >= `from_sequence`, in order
    async fn replay(
        &self,
        tenant_id: &TenantId,
        from_sequence: u64,
    ) -> Result<Vec<(u64, Event)>, RepositoryError>;
}

/// Repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}

impl From<sled::Error> for RepositoryError {
    fn from(err: sled::Error) -> Self {
        RepositoryError::Storage(err.to_string())
    }
}
