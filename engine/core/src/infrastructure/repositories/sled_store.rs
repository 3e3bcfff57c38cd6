// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
// Sled-backed repositories for durable single-node deployments.
//
// Keys for per-tenant ordered data are "{tenant}/{sequence:020}" so that a
// prefix scan yields records in sequence order. Appends that assign a
// sequence hold a short process-wide mutex; sled itself serializes the
// on-disk writes. Every append flushes before acknowledging.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::audit::AuditRecord;
use crate::domain::events::Event;
use crate::domain::invocation::Invocation;
use crate::domain::repository::{
    AuditRecordStore, DefinitionRepository, EventJournal, InvocationRepository, RepositoryError,
    RunRepository,
};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{DefinitionId, RunId, WorkflowDefinition, WorkflowRun};

fn sequence_key(tenant_id: &TenantId, sequence: u64) -> Vec<u8> {
    format!("{}/{:020}", tenant_id.as_str(), sequence).into_bytes()
}

fn tenant_prefix(tenant_id: &TenantId) -> Vec<u8> {
    format!("{}/", tenant_id.as_str()).into_bytes()
}

// ============================================================================
// Definitions
// ============================================================================

pub struct SledDefinitionRepository {
    tree: sled::Tree,
}

impl SledDefinitionRepository {
    pub fn open(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree("definitions")?,
        })
    }

    fn key(name: &str, version: u32) -> Vec<u8> {
        format!("{name}@{version:010}").into_bytes()
    }
}

#[async_trait]
impl DefinitionRepository for SledDefinitionRepository {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let key = Self::key(&definition.name, definition.version);
        if self.tree.contains_key(&key)? {
            return Err(RepositoryError::Conflict(format!(
                "definition '{}' version {} already published",
                definition.name, definition.version
            )));
        }
        self.tree.insert(key, serde_json::to_vec(definition)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn find_by_id(
        &self,
        id: DefinitionId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let definition: WorkflowDefinition = serde_json::from_slice(&value)?;
            if definition.id == id {
                return Ok(Some(definition));
            }
        }
        Ok(None)
    }

    async fn find(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        match self.tree.get(Self::key(name, version))? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn find_latest(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        // Versions are zero-padded, so the last key under the name prefix is
        // the newest version.
        let prefix = format!("{name}@").into_bytes();
        let mut latest = None;
        for entry in self.tree.scan_prefix(&prefix) {
            let (_, value) = entry?;
            latest = Some(serde_json::from_slice(&value)?);
        }
        Ok(latest)
    }

    async fn list_all(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut definitions = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            definitions.push(serde_json::from_slice(&value)?);
        }
        Ok(definitions)
    }
}

// ============================================================================
// Runs
// ============================================================================

pub struct SledRunRepository {
    tree: sled::Tree,
}

impl SledRunRepository {
    pub fn open(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree("runs")?,
        })
    }
}

#[async_trait]
impl RunRepository for SledRunRepository {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.tree
            .insert(run.id.0.as_bytes(), serde_json::to_vec(run)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn find_by_id(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        match self.tree.get(id.0.as_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn find_active(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut active = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            let run: WorkflowRun = serde_json::from_slice(&value)?;
            if !run.state.is_terminal() {
                active.push(run);
            }
        }
        Ok(active)
    }
}

// ============================================================================
// Invocations
// ============================================================================

pub struct SledInvocationRepository {
    tree: sled::Tree,
}

impl SledInvocationRepository {
    pub fn open(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            tree: db.open_tree("invocations")?,
        })
    }
}

#[async_trait]
impl InvocationRepository for SledInvocationRepository {
    async fn append(&self, invocation: &Invocation) -> Result<(), RepositoryError> {
        let key = format!("{}/{}", invocation.run_id, invocation.id).into_bytes();
        self.tree.insert(key, serde_json::to_vec(invocation)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn find_by_run(&self, run_id: RunId) -> Result<Vec<Invocation>, RepositoryError> {
        let prefix = format!("{run_id}/").into_bytes();
        let mut invocations: Vec<Invocation> = Vec::new();
        for entry in self.tree.scan_prefix(&prefix) {
            let (_, value) = entry?;
            invocations.push(serde_json::from_slice(&value)?);
        }
        invocations.sort_by_key(|i| i.started_at);
        Ok(invocations)
    }
}

// ============================================================================
// Audit
// ============================================================================

pub struct SledAuditStore {
    records: sled::Tree,
}

impl SledAuditStore {
    pub fn open(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            records: db.open_tree("audit_records")?,
        })
    }
}

#[async_trait]
impl AuditRecordStore for SledAuditStore {
    async fn append(
        &self,
        tenant_id: &TenantId,
        record: &AuditRecord,
    ) -> Result<(), RepositoryError> {
        let key = sequence_key(tenant_id, record.sequence);
        if self.records.contains_key(&key)? {
            return Err(RepositoryError::Conflict(format!(
                "audit sequence {} already written for tenant {}",
                record.sequence, tenant_id
            )));
        }
        self.records.insert(key, serde_json::to_vec(record)?)?;
        self.records.flush_async().await?;
        Ok(())
    }

    // The newest record is the head; keys are zero-padded so the last key
    // under the tenant prefix is the highest sequence.
    async fn head(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<(String, u64)>, RepositoryError> {
        match self.records.scan_prefix(tenant_prefix(tenant_id)).next_back() {
            Some(entry) => {
                let (_, value) = entry?;
                let record: AuditRecord = serde_json::from_slice(&value)?;
                Ok(Some((record.hash, record.sequence)))
            }
            None => Ok(None),
        }
    }

    async fn load_chain(&self, tenant_id: &TenantId) -> Result<Vec<AuditRecord>, RepositoryError> {
        let mut chain = Vec::new();
        for entry in self.records.scan_prefix(tenant_prefix(tenant_id)) {
            let (_, value) = entry?;
            chain.push(serde_json::from_slice(&value)?);
        }
        Ok(chain)
    }
}

// ============================================================================
// Events
// ============================================================================

pub struct SledEventJournal {
    events: sled::Tree,

    /// Serializes sequence assignment across concurrent publishers
    append_lock: Mutex<()>,
}

impl SledEventJournal {
    pub fn open(db: &sled::Db) -> Result<Self, RepositoryError> {
        Ok(Self {
            events: db.open_tree("events")?,
            append_lock: Mutex::new(()),
        })
    }

    fn parse_sequence(key: &[u8]) -> Result<u64, RepositoryError> {
        let key = String::from_utf8_lossy(key);
        key.rsplit('/')
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| RepositoryError::Storage(format!("malformed event key '{key}'")))
    }
}

#[async_trait]
impl EventJournal for SledEventJournal {
    async fn append(&self, event: &Event) -> Result<u64, RepositoryError> {
        let sequence = {
            let _guard = self.append_lock.lock();
            let next = match self
                .events
                .scan_prefix(tenant_prefix(&event.tenant_id))
                .next_back()
            {
                Some(entry) => {
                    let (key, _) = entry?;
                    Self::parse_sequence(&key)? + 1
                }
                None => 0,
            };
            self.events.insert(
                sequence_key(&event.tenant_id, next),
                serde_json::to_vec(event)?,
            )?;
            next
        };
        self.events.flush_async().await?;
        Ok(sequence)
    }

    async fn replay(
        &self,
        tenant_id: &TenantId,
        from_sequence: u64,
    ) -> Result<Vec<(u64, Event)>, RepositoryError> {
        let mut events = Vec::new();
        for entry in self.events.scan_prefix(tenant_prefix(tenant_id)) {
            let (key, value) = entry?;
            let sequence = Self::parse_sequence(&key)?;
            if sequence >= from_sequence {
                events.push((sequence, serde_json::from_slice(&value)?));
            }
        }
        Ok(events)
    }
}
