// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Audit Log
//!
//! Append-only, hash-chained audit trail, one chain per tenant. Appends to
//! a tenant's chain are serialized through a per-tenant async mutex so the
//! previous-hash link is race-free; reads are concurrent. The log never
//! mutates or deletes a stored record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::audit::{
    ActorId, AuditError, AuditRecord, EvidenceBundle, PolicyOutcomeRecord, GENESIS_HASH,
};
use crate::domain::repository::AuditRecordStore;
use crate::domain::tenant::TenantId;
use crate::domain::workflow::RunId;

/// Filter for audit queries; all criteria are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub actor: Option<ActorId>,
    pub run_id: Option<RunId>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditQuery {
    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(actor) = &self.actor {
            if &record.actor != actor {
                return false;
            }
        }
        if let Some(run_id) = &self.run_id {
            let matches_run = record
                .context
                .get("run_id")
                .and_then(|v| v.as_str())
                .map(|s| s == run_id.to_string())
                .unwrap_or(false);
            if !matches_run {
                return false;
            }
        }
        if let Some(action) = &self.action {
            if &record.action != action {
                return false;
            }
        }
        if let Some(from) = &self.from {
            if record.timestamp < *from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if record.timestamp > *to {
                return false;
            }
        }
        true
    }
}

/// Hash-chained audit log over a pluggable record store.
pub struct AuditLog {
    store: Arc<dyn AuditRecordStore>,

    /// Per-tenant append locks; the chain is single-writer-per-record
    append_locks: DashMap<String, Arc<Mutex<()>>>,

    /// Key for signing evidence bundles
    signing_key: Vec<u8>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditRecordStore>, signing_key: impl Into<Vec<u8>>) -> Self {
        Self {
            store,
            append_locks: DashMap::new(),
            signing_key: signing_key.into(),
        }
    }

    fn lock_for(&self, tenant_id: &TenantId) -> Arc<Mutex<()>> {
        self.append_locks
            .entry(tenant_id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Append a record to the tenant's chain and return it (with its hash
    /// and sequence assigned).
    pub async fn append(
        &self,
        tenant_id: &TenantId,
        actor: ActorId,
        action: impl Into<String>,
        context: serde_json::Value,
        policy_outcome: Option<PolicyOutcomeRecord>,
    ) -> Result<AuditRecord, AuditError> {
        let lock = self.lock_for(tenant_id);
        let _guard = lock.lock().await;

        let (previous_hash, sequence) = match self
            .store
            .head(tenant_id)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?
        {
            Some((hash, seq)) => (hash, seq + 1),
            None => (GENESIS_HASH.to_string(), 0),
        };

        let record = AuditRecord::chained(
            sequence,
            previous_hash,
            actor,
            action,
            context,
            policy_outcome,
        )?;

        self.store
            .append(tenant_id, &record)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;

        debug!(
            tenant_id = %tenant_id,
            sequence,
            action = %record.action,
            "Audit record appended"
        );
        Ok(record)
    }

    /// Lookup by actor, run, action, or time range.
    pub async fn query(
        &self,
        tenant_id: &TenantId,
        filter: &AuditQuery,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let chain = self
            .store
            .load_chain(tenant_id)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;
        Ok(chain.into_iter().filter(|r| filter.matches(r)).collect())
    }

    /// Recompute the tenant's whole chain from record zero.
    pub async fn verify(&self, tenant_id: &TenantId) -> Result<(), AuditError> {
        let chain = self
            .store
            .load_chain(tenant_id)
            .await
            .map_err(|e| AuditError::Store(e.to_string()))?;
        crate::domain::audit::verify_chain(&chain)
    }

    /// Produce a portable, signed chain segment for compliance review.
    /// The filter selects which records are included; links inside the
    /// segment must still be contiguous to verify, so callers typically
    /// filter by time range only.
    pub async fn export_evidence(
        &self,
        tenant_id: &TenantId,
        filter: &AuditQuery,
    ) -> Result<EvidenceBundle, AuditError> {
        let records = self.query(tenant_id, filter).await?;
        EvidenceBundle::sign(tenant_id.clone(), records, &self.signing_key)
    }

    pub fn signing_key(&self) -> &[u8] {
        &self.signing_key
    }
}
