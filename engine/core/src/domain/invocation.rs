// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Invocation Records
//!
//! One invocation record per (run, step, attempt). Re-attempts create new
//! records; prior records are never mutated. The idempotency key derived
//! from the triple is what downstream ports use to deduplicate side effects
//! across crash-and-resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::agent::AgentId;
use crate::domain::context::Citation;
use crate::domain::workflow::{RunId, StepName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationId(pub Uuid);

impl InvocationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for InvocationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InvocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-supplied token that makes a retried operation safe: ports must
/// treat two invokes with the same key as one side effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    /// Derive the key for a step attempt. Stable across process restarts as
    /// long as the attempt counter is checkpointed before the port call.
    pub fn derive(run_id: RunId, step: &StepName, attempt: u32) -> Self {
        Self(format!("{}:{}:{}", run_id, step, attempt))
    }

    /// Key for a fan-out sub-task, disambiguated by item index
    pub fn derive_sub_task(run_id: RunId, step: &StepName, attempt: u32, index: usize) -> Self {
        Self(format!("{}:{}:{}#{}", run_id, step, attempt, index))
    }

    /// Key for a compensating invocation
    pub fn derive_compensation(run_id: RunId, step: &StepName, attempt: u32) -> Self {
        Self(format!("comp:{}:{}:{}", run_id, step, attempt))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of a single invocation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationOutcome {
    Succeeded,
    Failed { reason: String },
    TimedOut,
}

/// Record of one agent invocation attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: InvocationId,
    pub run_id: RunId,
    pub step: StepName,
    pub agent_id: AgentId,
    pub attempt: u32,
    pub idempotency_key: IdempotencyKey,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub confidence: Option<f64>,
    pub citations: Vec<Citation>,
    pub outcome: InvocationOutcome,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}
