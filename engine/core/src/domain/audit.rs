// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Audit Chain Domain Model
//!
//! Append-only, hash-chained audit records, one chain per tenant. Each
//! record's hash covers the previous hash plus the record's canonical JSON,
//! so any mutation of a stored record breaks every hash after it. Evidence
//! bundles are portable chain segments signed with HMAC-SHA256 and
//! verifiable without access to the engine.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::tenant::TenantId;

/// Hash of the (empty) chain head before the first record
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuditRecordId(pub Uuid);

impl AuditRecordId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AuditRecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AuditRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who performed the recorded action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "actor", rename_all = "snake_case")]
pub enum ActorId {
    Agent { agent_id: AgentId },
    User { user_id: String },
    System,
}

/// Policy outcome summary attached to audit records produced by the
/// governance engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcomeRecord {
    /// "allow" | "modify" | "block" | "require_approval"
    pub kind: String,
    pub policy_id: Option<Uuid>,
    pub reason: Option<String>,
}

/// A single chained audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditRecordId,

    /// Position in the tenant's chain, starting at 0
    pub sequence: u64,

    pub previous_hash: String,
    pub hash: String,

    pub actor: ActorId,

    /// Dotted action type, e.g. "step.attempt", "policy.evaluate",
    /// "router.route"
    pub action: String,

    /// Context snapshot at the time of the action
    pub context: serde_json::Value,

    pub policy_outcome: Option<PolicyOutcomeRecord>,
    pub timestamp: DateTime<Utc>,
}

/// Fields covered by the record hash, in canonical serialization order.
/// serde_json maps are sorted, so serialization is deterministic.
#[derive(Serialize)]
struct HashedFields<'a> {
    id: &'a AuditRecordId,
    sequence: u64,
    actor: &'a ActorId,
    action: &'a str,
    context: &'a serde_json::Value,
    policy_outcome: &'a Option<PolicyOutcomeRecord>,
    timestamp: &'a DateTime<Utc>,
}

impl AuditRecord {
    /// Build a record chained onto `previous_hash` at `sequence`.
    pub fn chained(
        sequence: u64,
        previous_hash: String,
        actor: ActorId,
        action: impl Into<String>,
        context: serde_json::Value,
        policy_outcome: Option<PolicyOutcomeRecord>,
    ) -> Result<Self, AuditError> {
        let mut record = Self {
            id: AuditRecordId::new(),
            sequence,
            previous_hash,
            hash: String::new(),
            actor,
            action: action.into(),
            context,
            policy_outcome,
            timestamp: Utc::now(),
        };
        record.hash = record.compute_hash()?;
        Ok(record)
    }

    /// Recompute this record's hash from its fields and previous hash.
    pub fn compute_hash(&self) -> Result<String, AuditError> {
        let fields = HashedFields {
            id: &self.id,
            sequence: self.sequence,
            actor: &self.actor,
            action: &self.action,
            context: &self.context,
            policy_outcome: &self.policy_outcome,
            timestamp: &self.timestamp,
        };
        let canonical =
            serde_json::to_vec(&fields).map_err(|e| AuditError::Serialization(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Recompute the whole chain from record zero and compare against stored
/// hashes. Any mutation of a stored record fails verification from that
/// point forward.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditError> {
    let mut previous = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        if record.sequence != index as u64 {
            return Err(AuditError::ChainBroken {
                sequence: index as u64,
                detail: format!("expected sequence {index}, found {}", record.sequence),
            });
        }
        if record.previous_hash != previous {
            return Err(AuditError::ChainBroken {
                sequence: record.sequence,
                detail: "previous_hash does not match prior record".to_string(),
            });
        }
        let recomputed = record.compute_hash()?;
        if recomputed != record.hash {
            return Err(AuditError::ChainBroken {
                sequence: record.sequence,
                detail: "stored hash does not match recomputed hash".to_string(),
            });
        }
        previous = record.hash.clone();
    }
    Ok(())
}

// ============================================================================
// Evidence Bundles
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Portable, independently verifiable chain segment for compliance review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub tenant_id: TenantId,
    pub records: Vec<AuditRecord>,
    pub head_hash: String,
    pub exported_at: DateTime<Utc>,

    /// HMAC-SHA256 over the canonical records + head hash, hex encoded
    pub signature: String,
}

impl EvidenceBundle {
    pub fn sign(
        tenant_id: TenantId,
        records: Vec<AuditRecord>,
        key: &[u8],
    ) -> Result<Self, AuditError> {
        let head_hash = records
            .last()
            .map(|r| r.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let exported_at = Utc::now();
        let signature = bundle_signature(&tenant_id, &records, &head_hash, key)?;
        Ok(Self {
            tenant_id,
            records,
            head_hash,
            exported_at,
            signature,
        })
    }

    /// Verify both the embedded chain and the bundle signature.
    pub fn verify(&self, key: &[u8]) -> Result<(), AuditError> {
        let expected = bundle_signature(&self.tenant_id, &self.records, &self.head_hash, key)?;
        if expected != self.signature {
            return Err(AuditError::BadSignature);
        }
        // The segment may start mid-chain; recompute links relative to the
        // first record's declared previous hash.
        let mut previous = match self.records.first() {
            Some(first) => first.previous_hash.clone(),
            None => return Ok(()),
        };
        for record in &self.records {
            if record.previous_hash != previous {
                return Err(AuditError::ChainBroken {
                    sequence: record.sequence,
                    detail: "previous_hash does not match prior record".to_string(),
                });
            }
            if record.compute_hash()? != record.hash {
                return Err(AuditError::ChainBroken {
                    sequence: record.sequence,
                    detail: "stored hash does not match recomputed hash".to_string(),
                });
            }
            previous = record.hash.clone();
        }
        if previous != self.head_hash {
            return Err(AuditError::ChainBroken {
                sequence: self.records.len() as u64,
                detail: "head hash does not match final record".to_string(),
            });
        }
        Ok(())
    }
}

fn bundle_signature(
    tenant_id: &TenantId,
    records: &[AuditRecord],
    head_hash: &str,
    key: &[u8],
) -> Result<String, AuditError> {
    let canonical = serde_json::to_vec(&(tenant_id, records, head_hash))
        .map_err(|e| AuditError::Serialization(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| AuditError::BadKey)?;
    mac.update(&canonical);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit chain broken at sequence {sequence}: {detail}")]
    ChainBroken { sequence: u64, detail: String },

    #[error("Evidence bundle signature does not verify")]
    BadSignature,

    #[error("Invalid signing key")]
    BadKey,

    #[error("Audit serialization error: {0}")]
    Serialization(String),

    #[error("Audit store error: {0}")]
    Store(String),
}
