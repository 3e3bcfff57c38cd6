// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Engine Error Taxonomy
//!
//! Classified failures drive orchestrator behavior: transient errors are
//! retried under the step's policy, permanent errors unwind the run through
//! compensation, policy blocks perform no side effect and are always
//! audited, timeouts escalate per configuration, and routing failures
//! surface as run-failure causes.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::ports::PortError;
use crate::domain::repository::RepositoryError;
use crate::domain::workflow::{RunId, RunState};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Retried per the step's retry policy
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Exhausts the step and triggers compensation
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// The governance engine refused the action; no side effect was
    /// performed
    #[error("Blocked by policy {policy_id:?}: {reason}")]
    PolicyBlocked {
        policy_id: Option<Uuid>,
        reason: String,
        audit_record_id: Option<Uuid>,
    },

    /// A bounded wait elapsed (invocation, semaphore, approval)
    #[error("Timed out: {0}")]
    Timeout(String),

    /// No registered agent satisfies the step's capability, entitlement,
    /// and health requirements
    #[error("No eligible agent for capability '{capability}' (tenant '{tenant}')")]
    NoEligibleAgent { capability: String, tenant: String },

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error("Workflow definition '{0}' not found")]
    DefinitionNotFound(String),

    #[error("Agent '{0}' not found in registry")]
    AgentNotFound(String),

    /// `signal` on a run that is not suspended is an explicit error, not a
    /// silent no-op
    #[error("Run {run_id} is not awaiting a signal (state: {state})")]
    NotSuspended { run_id: RunId, state: RunState },

    #[error(transparent)]
    Workflow(#[from] crate::domain::workflow::WorkflowError),

    #[error(transparent)]
    Audit(#[from] crate::domain::audit::AuditError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether the orchestrator's retry loop should try again
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

impl From<PortError> for EngineError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::Transient(msg) => Self::Transient(msg),
            PortError::Permanent(msg) => Self::Permanent(msg),
        }
    }
}
