// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Workflow Domain Model
//!
//! Defines the core domain entities for the orchestration engine: immutable
//! workflow definitions (ordered steps, retry policies, author-declared
//! compensation) and the durable run aggregate whose state machine drives
//! execution.
//!
//! # Design Principles
//!
//! 1. **Immutability:** Definitions are immutable once published, versioned
//!    by (name, version)
//! 2. **Type Safety:** Run state transitions are enforced by
//!    [`RunState::can_transition_to`]; illegal edges are domain errors
//! 3. **Self-Validating:** Constructors enforce invariants

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::tenant::TenantId;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for a published workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionId(pub Uuid);

impl DefinitionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DefinitionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DefinitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique name for a step within a workflow (e.g., "governance-check")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepName(String);

impl StepName {
    /// Create a new StepName with validation
    ///
    /// # Validation Rules
    /// - Must not be empty
    /// - Recommended: lowercase-with-hyphens
    pub fn new(name: impl Into<String>) -> Result<Self, WorkflowError> {
        let name = name.into();
        if name.is_empty() {
            return Err(WorkflowError::InvalidStepName(
                "Step name cannot be empty".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Capability descriptor required by a step and declared by agents
/// (e.g., "cms.publish", "crm.lookup")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability(String);

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects: Retry & Fan-Out
// ============================================================================

/// Per-step retry policy: exponential backoff with jitter, capped attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for the first retry
    #[serde(default = "default_backoff_base")]
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,

    /// Upper bound on any single delay
    #[serde(default = "default_backoff_cap")]
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,

    /// Jitter factor in [0.0, 1.0]; the delay is scaled by a random value in
    /// [1 - jitter, 1 + jitter]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(200)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff delay before the given attempt (1-based).
    /// Attempt 1 has no delay; attempt n waits base * 2^(n-2), capped,
    /// scaled by jitter.
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(2).min(31);
        let raw = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.backoff_cap);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + jitter * (2.0 * rand::random::<f64>() - 1.0);
        raw.mul_f64(factor.max(0.0))
    }
}

/// Fan-out declaration: a step that expands into parallel sub-tasks, joined
/// before the next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOut {
    /// JSON pointer into the run input / prior step outputs selecting the
    /// array of items to fan out over (e.g., "/input/channels")
    pub items_pointer: String,

    /// Upper bound on concurrently executing sub-tasks
    #[serde(default = "default_parallelism")]
    pub max_parallelism: usize,
}

fn default_parallelism() -> usize {
    4
}

// ============================================================================
// Entities: Step & Definition
// ============================================================================

/// A single step in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: StepName,

    /// Capability an agent must declare to be eligible for this step
    pub capability: Capability,

    /// Retry policy override; falls back to the definition default
    #[serde(default)]
    pub retry: Option<RetryPolicy>,

    /// Per-attempt timeout
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    /// Suspend the run for human approval before executing this step
    #[serde(default)]
    pub requires_approval: bool,

    /// When set, the retrieval service builds a cited context pack for this
    /// query and attaches it to the invocation
    #[serde(default)]
    pub context_query: Option<String>,

    /// Optional parallel expansion of this step
    #[serde(default)]
    pub fan_out: Option<FanOut>,
}

/// Workflow Definition Aggregate Root
///
/// An ordered list of steps plus retry defaults and an author-declared
/// compensation map. Immutable once published.
///
/// # Invariants
/// - Must have at least one step
/// - Step names are unique (across forward and compensation steps)
/// - Every compensation mapping references an existing forward step and an
///   existing compensation step
/// - Fan-out parallelism is at least 1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub version: u32,
    pub steps: Vec<Step>,

    /// Compensating steps, never executed forward; referenced from
    /// `compensation`
    #[serde(default)]
    pub compensation_steps: Vec<Step>,

    /// Forward step name → compensating step name
    #[serde(default)]
    pub compensation: HashMap<StepName, StepName>,

    /// Wall-clock bound for the whole run
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub global_timeout: Option<Duration>,

    #[serde(default)]
    pub default_retry: RetryPolicy,

    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create a new definition with validation
    pub fn new(
        name: impl Into<String>,
        version: u32,
        steps: Vec<Step>,
        compensation_steps: Vec<Step>,
        compensation: HashMap<StepName, StepName>,
        global_timeout: Option<Duration>,
        default_retry: RetryPolicy,
    ) -> Result<Self, WorkflowError> {
        if steps.is_empty() {
            return Err(WorkflowError::NoSteps);
        }

        let mut seen = std::collections::HashSet::new();
        for step in steps.iter().chain(compensation_steps.iter()) {
            if !seen.insert(step.name.clone()) {
                return Err(WorkflowError::DuplicateStepName(step.name.clone()));
            }
            if let Some(fan_out) = &step.fan_out {
                if fan_out.max_parallelism == 0 {
                    return Err(WorkflowError::InvalidFanOut(step.name.clone()));
                }
            }
        }

        for (forward, compensating) in &compensation {
            if !steps.iter().any(|s| &s.name == forward) {
                return Err(WorkflowError::UnknownCompensationSource(forward.clone()));
            }
            if !compensation_steps.iter().any(|s| &s.name == compensating) {
                return Err(WorkflowError::UnknownCompensationTarget {
                    forward: forward.clone(),
                    compensating: compensating.clone(),
                });
            }
        }

        Ok(Self {
            id: DefinitionId::new(),
            name: name.into(),
            version,
            steps,
            compensation_steps,
            compensation,
            global_timeout,
            default_retry,
            created_at: Utc::now(),
        })
    }

    pub fn step(&self, name: &StepName) -> Option<&Step> {
        self.steps.iter().find(|s| &s.name == name)
    }

    /// Compensating step declared for a forward step, if any
    pub fn compensating_step(&self, forward: &StepName) -> Option<&Step> {
        let target = self.compensation.get(forward)?;
        self.compensation_steps.iter().find(|s| &s.name == target)
    }

    /// Effective retry policy for a step (step override, else default)
    pub fn retry_for<'a>(&'a self, step: &'a Step) -> &'a RetryPolicy {
        step.retry.as_ref().unwrap_or(&self.default_retry)
    }
}

// ============================================================================
// Aggregate Root: WorkflowRun
// ============================================================================

/// Run lifecycle states.
///
/// ```text
/// Pending → Running → {AwaitingApproval, Compensating, Completed, Failed, Cancelled}
/// AwaitingApproval → {Running, Cancelled}
/// Compensating → {Failed, Cancelled}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    AwaitingApproval,
    Compensating,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the edge `self → next` is part of the run state machine
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, AwaitingApproval)
                | (Running, Compensating)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (AwaitingApproval, Running)
                | (AwaitingApproval, Cancelled)
                | (Compensating, Failed)
                | (Compensating, Cancelled)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Compensating => "compensating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Terminal failure detail surfaced to callers: a human-readable reason plus
/// the audit record that explains it. Never a bare backtrace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: String,
    pub audit_record_id: Option<Uuid>,
}

/// Workflow Run Aggregate Root (durable checkpoint state)
///
/// Owned exclusively by the orchestrator; every mutation goes through
/// [`WorkflowRun::transition_to`] or one of the recording methods, and the
/// orchestrator persists a checkpoint after each of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub definition_id: DefinitionId,
    pub definition_name: String,
    pub definition_version: u32,
    pub tenant_id: TenantId,
    pub state: RunState,

    /// Index into the definition's step list
    pub current_step_index: usize,

    /// Attempt counter for the current step (1-based once an attempt starts).
    /// Persisted before each port call so a resumed process reuses the same
    /// idempotency key.
    pub current_attempt: u32,

    pub input: serde_json::Value,

    /// Step name → recorded output
    pub step_outputs: HashMap<StepName, serde_json::Value>,

    /// Steps completed so far, in completion order (compensation runs in
    /// reverse over this list)
    pub completed_steps: Vec<StepName>,

    /// Policy-set version pinned at run start; evaluations use it for the
    /// duration of the run
    pub policy_version: u32,

    /// Deadline for an in-flight approval wait; survives restarts
    pub approval_deadline: Option<DateTime<Utc>>,

    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        definition: &WorkflowDefinition,
        tenant_id: TenantId,
        input: serde_json::Value,
        policy_version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::new(),
            definition_id: definition.id,
            definition_name: definition.name.clone(),
            definition_version: definition.version,
            tenant_id,
            state: RunState::Pending,
            current_step_index: 0,
            current_attempt: 0,
            input,
            step_outputs: HashMap::new(),
            completed_steps: Vec::new(),
            policy_version,
            approval_deadline: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition along a legal edge; illegal edges are domain errors.
    pub fn transition_to(&mut self, next: RunState) -> Result<(), WorkflowError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn record_step_output(&mut self, step: StepName, output: serde_json::Value) {
        self.step_outputs.insert(step, output);
        self.updated_at = Utc::now();
    }

    pub fn mark_step_completed(&mut self, step: StepName) {
        self.completed_steps.push(step);
        self.current_step_index += 1;
        self.current_attempt = 0;
        self.updated_at = Utc::now();
    }

    pub fn begin_attempt(&mut self, attempt: u32) {
        self.current_attempt = attempt;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>, audit_record_id: Option<Uuid>) {
        self.failure = Some(RunFailure {
            reason: reason.into(),
            audit_record_id,
        });
        self.updated_at = Utc::now();
    }
}

/// Read-only view of a run returned by `query`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: RunId,
    pub definition_name: String,
    pub definition_version: u32,
    pub tenant_id: TenantId,
    pub state: RunState,
    pub current_step_index: usize,
    pub completed_steps: Vec<StepName>,
    pub step_outputs: HashMap<StepName, serde_json::Value>,
    pub failure: Option<RunFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowRun> for RunSnapshot {
    fn from(run: &WorkflowRun) -> Self {
        Self {
            id: run.id,
            definition_name: run.definition_name.clone(),
            definition_version: run.definition_version,
            tenant_id: run.tenant_id.clone(),
            state: run.state,
            current_step_index: run.current_step_index,
            completed_steps: run.completed_steps.clone(),
            step_outputs: run.step_outputs.clone(),
            failure: run.failure.clone(),
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow must have at least one step")]
    NoSteps,

    #[error("Duplicate step name '{0}'")]
    DuplicateStepName(StepName),

    #[error("Invalid step name: {0}")]
    InvalidStepName(String),

    #[error("Fan-out parallelism must be at least 1 (step '{0}')")]
    InvalidFanOut(StepName),

    #[error("Compensation declared for unknown step '{0}'")]
    UnknownCompensationSource(StepName),

    #[error("Compensating step '{compensating}' for '{forward}' not found")]
    UnknownCompensationTarget {
        forward: StepName,
        compensating: StepName,
    },

    #[error("Illegal run state transition {from} → {to}")]
    InvalidTransition { from: RunState, to: RunState },
}
