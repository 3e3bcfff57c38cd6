// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Domain Events
//!
//! Outbound notification events published to the per-tenant event bus.
//! Events decouple the engine from dashboards and log pipelines; they are
//! never the control channel between the orchestrator and agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{RunId, StepName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable event envelope as it appears in the per-tenant journal.
/// Immutable once published; subscribers deduplicate by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub tenant_id: TenantId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,

    /// Originating audit record or run id, for traceability
    pub causation_id: Option<String>,
}

/// Engine notification events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    WorkflowStarted {
        run_id: RunId,
        definition_name: String,
        definition_version: u32,
        started_at: DateTime<Utc>,
    },
    StepCompleted {
        run_id: RunId,
        step: StepName,
        agent_id: AgentId,
        attempt: u32,
        completed_at: DateTime<Utc>,
    },
    StepFailed {
        run_id: RunId,
        step: StepName,
        reason: String,
        attempt: u32,
        failed_at: DateTime<Utc>,
    },
    HilApprovalRequired {
        run_id: RunId,
        step: StepName,
        deadline: DateTime<Utc>,
        requested_at: DateTime<Utc>,
    },
    WorkflowCompleted {
        run_id: RunId,
        completed_at: DateTime<Utc>,
    },
    WorkflowFailed {
        run_id: RunId,
        reason: String,
        audit_record_id: Option<Uuid>,
        failed_at: DateTime<Utc>,
    },
    WorkflowCancelled {
        run_id: RunId,
        cancelled_at: DateTime<Utc>,
    },
    PolicyViolationDetected {
        run_id: Option<RunId>,
        policy_id: Uuid,
        action: String,
        reason: String,
        detected_at: DateTime<Utc>,
    },
    AuditEvidenceAppended {
        record_count: usize,
        head_hash: String,
        exported_at: DateTime<Utc>,
    },
}

impl DomainEvent {
    /// Dotted event type used for subscription pattern matching
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow.started",
            Self::StepCompleted { .. } => "workflow.step_completed",
            Self::StepFailed { .. } => "workflow.step_failed",
            Self::HilApprovalRequired { .. } => "workflow.hil_approval_required",
            Self::WorkflowCompleted { .. } => "workflow.completed",
            Self::WorkflowFailed { .. } => "workflow.failed",
            Self::WorkflowCancelled { .. } => "workflow.cancelled",
            Self::PolicyViolationDetected { .. } => "governance.policy_violation",
            Self::AuditEvidenceAppended { .. } => "audit.evidence_appended",
        }
    }

    /// Wrap into a durable envelope for the given tenant.
    pub fn into_envelope(self, tenant_id: TenantId, causation_id: Option<String>) -> Event {
        let event_type = self.event_type().to_string();
        let payload = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        Event {
            id: EventId::new(),
            tenant_id,
            event_type,
            payload,
            timestamp: Utc::now(),
            causation_id,
        }
    }
}
