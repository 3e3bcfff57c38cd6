// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Workflow Orchestrator Application Service
//!
//! Drives each workflow run as an independent durable state machine. A
//! checkpoint is persisted after every state transition (step start, step
//! success, step failure, retry scheduled, approval requested/received), so
//! a process restart resumes from the last checkpoint without re-executing
//! committed side effects: every invocation carries an idempotency key
//! derived from (run, step, attempt) that ports must honor.
//!
//! # Step lifecycle
//!
//! ```text
//! for each step:
//!     pre-action policy gate  → Block ⇒ no port call, unwind
//!     route capability        → ranked candidates under entitlements
//!     invoke (bounded)        → retry w/ backoff+jitter, ranked fallbacks
//!     post-action policy gate → Block ⇒ unwind; Modify ⇒ rewrite output
//!     checkpoint + audit + event
//! ```
//!
//! Retry exhaustion or a permanent failure runs the author-declared
//! compensation chain over completed steps in reverse order, then the run
//! terminates in Failed. Cancellation is cooperative: observed at
//! checkpoint boundaries, propagated to in-flight invocations, and followed
//! by the same compensation path before the Cancelled terminal state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::governance::{apply_decision_patch, PolicyEngine, ProposedAction};
use crate::application::retrieval::ContextRetrievalService;
use crate::application::router::{AgentRegistry, InvokeArgs};
use crate::domain::agent::AgentId;
use crate::domain::audit::ActorId;
use crate::domain::context::ContextBudget;
use crate::domain::error::EngineError;
use crate::domain::events::DomainEvent;
use crate::domain::invocation::IdempotencyKey;
use crate::domain::policy::{EscalationDefault, PolicyOutcome};
use crate::domain::repository::{DefinitionRepository, RunRepository};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{
    RunId, RunSnapshot, RunState, Step, WorkflowDefinition, WorkflowRun,
};
use crate::infrastructure::approval::{ApprovalOutcome, ApprovalService, ApprovalSignal};
use crate::infrastructure::audit_log::AuditLog;
use crate::infrastructure::config::EngineConfig;
use crate::infrastructure::event_bus::EventBus;

/// Why a step could not complete
enum StepFailure {
    Failed {
        reason: String,
        audit_record_id: Option<Uuid>,
    },
    Cancelled,
}

/// How an approval gate resolved
enum ApprovalResolution {
    Proceed,
    Reject(String),
    Cancelled,
}

pub struct Orchestrator {
    definitions: Arc<dyn DefinitionRepository>,
    runs: Arc<dyn RunRepository>,
    registry: Arc<AgentRegistry>,
    policy: Arc<PolicyEngine>,
    retrieval: Option<Arc<ContextRetrievalService>>,
    audit: Arc<AuditLog>,
    event_bus: Arc<EventBus>,
    approvals: Arc<ApprovalService>,

    approval_timeout: Duration,
    default_step_timeout: Duration,
    context_budget: ContextBudget,

    cancel_tokens: DashMap<RunId, CancellationToken>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        definitions: Arc<dyn DefinitionRepository>,
        runs: Arc<dyn RunRepository>,
        registry: Arc<AgentRegistry>,
        policy: Arc<PolicyEngine>,
        retrieval: Option<Arc<ContextRetrievalService>>,
        audit: Arc<AuditLog>,
        event_bus: Arc<EventBus>,
        approvals: Arc<ApprovalService>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            definitions,
            runs,
            registry,
            policy,
            retrieval,
            audit,
            event_bus,
            approvals,
            approval_timeout: config.approval_timeout,
            default_step_timeout: config.default_step_timeout,
            context_budget: ContextBudget::new(config.context_budget_tokens),
            cancel_tokens: DashMap::new(),
        }
    }

    // ========================================================================
    // Inbound Operations
    // ========================================================================

    /// Create a run for the latest published version of a definition and
    /// start driving it. Returns immediately; progress is asynchronous.
    pub async fn start(
        self: &Arc<Self>,
        definition_name: &str,
        tenant_id: TenantId,
        input: serde_json::Value,
    ) -> Result<RunId, EngineError> {
        let definition = self
            .definitions
            .find_latest(definition_name)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound(definition_name.to_string()))?;

        let policy_version = self.policy.active_version(&tenant_id).await;
        let mut run = WorkflowRun::new(&definition, tenant_id.clone(), input, policy_version);
        let run_id = run.id;

        self.runs.save(&run).await?;
        run.transition_to(RunState::Running)?;
        self.runs.save(&run).await?;

        info!(
            run_id = %run_id,
            definition = %definition.name,
            version = definition.version,
            tenant_id = %tenant_id,
            policy_version,
            "Workflow run started"
        );

        self.publish(
            &tenant_id,
            DomainEvent::WorkflowStarted {
                run_id,
                definition_name: definition.name.clone(),
                definition_version: definition.version,
                started_at: Utc::now(),
            },
            Some(run_id.to_string()),
        )
        .await;

        self.spawn_driver(run_id);
        Ok(run_id)
    }

    /// Deliver an external signal ("approve" / "reject") to a suspended
    /// run. Explicit error when the run is not suspended.
    pub async fn signal(
        &self,
        run_id: RunId,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        let run = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.state != RunState::AwaitingApproval {
            return Err(EngineError::NotSuspended {
                run_id,
                state: run.state,
            });
        }

        let by = payload
            .get("by")
            .and_then(|v| v.as_str())
            .map(String::from);
        let signal = match signal_name {
            "approve" => ApprovalSignal::Approve {
                approved_by: by,
                feedback: payload
                    .get("feedback")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            },
            "reject" => ApprovalSignal::Reject {
                rejected_by: by,
                reason: payload
                    .get("reason")
                    .and_then(|v| v.as_str())
                    .unwrap_or("rejected")
                    .to_string(),
            },
            other => {
                return Err(EngineError::Internal(format!(
                    "unknown signal '{other}' (expected 'approve' or 'reject')"
                )))
            }
        };

        if !self.approvals.deliver(run_id, signal).await {
            return Err(EngineError::NotSuspended {
                run_id,
                state: run.state,
            });
        }
        Ok(())
    }

    /// Read-only snapshot of a run; no side effects.
    pub async fn query(&self, run_id: RunId) -> Result<RunSnapshot, EngineError> {
        let run = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        Ok(RunSnapshot::from(&run))
    }

    /// Request cancellation. Observed cooperatively at the next checkpoint
    /// boundary; compensation runs before the run reaches Cancelled.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), EngineError> {
        let run = self
            .runs
            .find_by_id(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if run.state.is_terminal() {
            return Ok(());
        }
        info!(run_id = %run_id, "Cancellation requested");
        self.cancel_token(run_id).cancel();
        Ok(())
    }

    /// Reload non-terminal runs from the checkpoint store and resume their
    /// drivers. Called once at process startup.
    pub async fn resume_all(self: &Arc<Self>) -> Result<usize, EngineError> {
        let active = self.runs.find_active().await?;
        let count = active.len();
        for run in active {
            info!(run_id = %run.id, state = %run.state, "Resuming run from checkpoint");
            self.spawn_driver(run.id);
        }
        Ok(count)
    }

    // ========================================================================
    // Run Driver
    // ========================================================================

    fn cancel_token(&self, run_id: RunId) -> CancellationToken {
        self.cancel_tokens
            .entry(run_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn spawn_driver(self: &Arc<Self>, run_id: RunId) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.drive(run_id).await;
            this.cancel_tokens.remove(&run_id);
        });
    }

    async fn drive(self: &Arc<Self>, run_id: RunId) {
        let mut run = match self.runs.find_by_id(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => {
                error!(run_id = %run_id, "Driver started for unknown run");
                return;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Failed to load run checkpoint");
                return;
            }
        };
        if run.state.is_terminal() {
            return;
        }

        // A run checkpointed before its Running transition resumes here
        if run.state == RunState::Pending {
            self.transition(&mut run, RunState::Running).await;
        }

        let definition = match self.definitions.find_by_id(run.definition_id).await {
            Ok(Some(definition)) => definition,
            _ => {
                error!(run_id = %run_id, "Definition missing for checkpointed run");
                self.terminate(
                    &mut run,
                    RunState::Failed,
                    "workflow definition missing".to_string(),
                    None,
                )
                .await;
                return;
            }
        };

        let cancel = self.cancel_token(run_id);

        loop {
            if cancel.is_cancelled() {
                self.compensate(&mut run, &definition).await;
                self.terminate(
                    &mut run,
                    RunState::Cancelled,
                    "cancelled by caller".to_string(),
                    None,
                )
                .await;
                return;
            }

            if run.current_step_index >= definition.steps.len() {
                self.transition(&mut run, RunState::Completed).await;
                info!(run_id = %run_id, "Workflow run completed");
                self.publish(
                    &run.tenant_id.clone(),
                    DomainEvent::WorkflowCompleted {
                        run_id,
                        completed_at: Utc::now(),
                    },
                    Some(run_id.to_string()),
                )
                .await;
                return;
            }

            let step = definition.steps[run.current_step_index].clone();

            // Approval gate: the step flag, or a resumed suspension
            if step.requires_approval || run.state == RunState::AwaitingApproval {
                match self
                    .await_approval(&mut run, &step, EscalationDefault::AutoReject, &cancel)
                    .await
                {
                    ApprovalResolution::Proceed => {}
                    ApprovalResolution::Reject(reason) => {
                        self.compensate(&mut run, &definition).await;
                        self.terminate(&mut run, RunState::Failed, reason, None).await;
                        return;
                    }
                    ApprovalResolution::Cancelled => {
                        self.compensate(&mut run, &definition).await;
                        self.terminate(
                            &mut run,
                            RunState::Cancelled,
                            "cancelled while awaiting approval".to_string(),
                            None,
                        )
                        .await;
                        return;
                    }
                }
            }

            match self.execute_step(&mut run, &definition, &step, &cancel).await {
                Ok(()) => {}
                Err(StepFailure::Cancelled) => {
                    self.compensate(&mut run, &definition).await;
                    self.terminate(
                        &mut run,
                        RunState::Cancelled,
                        "cancelled by caller".to_string(),
                        None,
                    )
                    .await;
                    return;
                }
                Err(StepFailure::Failed {
                    reason,
                    audit_record_id,
                }) => {
                    self.publish(
                        &run.tenant_id.clone(),
                        DomainEvent::StepFailed {
                            run_id,
                            step: step.name.clone(),
                            reason: reason.clone(),
                            attempt: run.current_attempt,
                            failed_at: Utc::now(),
                        },
                        Some(run_id.to_string()),
                    )
                    .await;
                    self.compensate(&mut run, &definition).await;
                    self.terminate(&mut run, RunState::Failed, reason, audit_record_id)
                        .await;
                    return;
                }
            }
        }
    }

    // ========================================================================
    // Step Execution
    // ========================================================================

    async fn execute_step(
        self: &Arc<Self>,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Result<(), StepFailure> {
        let retry = definition.retry_for(step).clone();
        let timeout = step.timeout.unwrap_or(self.default_step_timeout);
        let mut failed_agents: HashSet<AgentId> = HashSet::new();

        // Resume mid-step re-runs the checkpointed attempt with the same
        // idempotency key; ports deduplicate the side effect.
        let mut attempt = run.current_attempt.max(1);

        loop {
            run.begin_attempt(attempt);
            self.checkpoint(run).await;

            let mut payload = self.step_payload(run, step);

            // Pre-action gate: nothing side-effecting proceeds before this
            // returns Allow or Modify.
            let pre = self
                .policy
                .evaluate(
                    &ProposedAction {
                        action_type: format!("step.{}.pre", step.name),
                        tenant_id: run.tenant_id.clone(),
                        run_id: Some(run.id),
                        context: self.eval_context(run, &payload),
                    },
                    run.policy_version,
                )
                .await
                .map_err(|e| StepFailure::Failed {
                    reason: format!("policy evaluation failed: {e}"),
                    audit_record_id: None,
                })?;

            match &pre.outcome {
                PolicyOutcome::Block { reason } => {
                    return Err(StepFailure::Failed {
                        reason: format!(
                            "blocked by policy {}: {}",
                            pre.policy_name.as_deref().unwrap_or("<unnamed>"),
                            reason
                        ),
                        audit_record_id: Some(pre.audit_record_id.0),
                    });
                }
                PolicyOutcome::RequireApproval => {
                    match self.await_approval(run, step, pre.escalation, cancel).await {
                        ApprovalResolution::Proceed => {}
                        ApprovalResolution::Reject(reason) => {
                            return Err(StepFailure::Failed {
                                reason,
                                audit_record_id: Some(pre.audit_record_id.0),
                            });
                        }
                        ApprovalResolution::Cancelled => return Err(StepFailure::Cancelled),
                    }
                }
                PolicyOutcome::Modify { .. } => apply_decision_patch(&mut payload, &pre),
                PolicyOutcome::Allow => {}
            }

            match self
                .attempt_invocation(run, step, attempt, payload, timeout, &failed_agents, cancel)
                .await
            {
                Ok((agent_id, mut output)) => {
                    // Post-action gate validates the result
                    let post = self
                        .policy
                        .evaluate(
                            &ProposedAction {
                                action_type: format!("step.{}.post", step.name),
                                tenant_id: run.tenant_id.clone(),
                                run_id: Some(run.id),
                                context: self.eval_context(run, &output),
                            },
                            run.policy_version,
                        )
                        .await
                        .map_err(|e| StepFailure::Failed {
                            reason: format!("policy evaluation failed: {e}"),
                            audit_record_id: None,
                        })?;

                    match &post.outcome {
                        PolicyOutcome::Block { reason } => {
                            return Err(StepFailure::Failed {
                                reason: format!(
                                    "result blocked by policy {}: {}",
                                    post.policy_name.as_deref().unwrap_or("<unnamed>"),
                                    reason
                                ),
                                audit_record_id: Some(post.audit_record_id.0),
                            });
                        }
                        PolicyOutcome::Modify { .. } => apply_decision_patch(&mut output, &post),
                        _ => {}
                    }

                    self.audit_attempt(run, step, attempt, Some(agent_id), "succeeded", None)
                        .await;

                    run.record_step_output(step.name.clone(), output);
                    run.mark_step_completed(step.name.clone());
                    self.checkpoint(run).await;

                    self.publish(
                        &run.tenant_id.clone(),
                        DomainEvent::StepCompleted {
                            run_id: run.id,
                            step: step.name.clone(),
                            agent_id,
                            attempt,
                            completed_at: Utc::now(),
                        },
                        Some(run.id.to_string()),
                    )
                    .await;
                    return Ok(());
                }
                Err((agent_id, error)) => {
                    if cancel.is_cancelled() {
                        return Err(StepFailure::Cancelled);
                    }

                    let record_id = self
                        .audit_attempt(
                            run,
                            step,
                            attempt,
                            agent_id,
                            "failed",
                            Some(error.to_string()),
                        )
                        .await;

                    warn!(
                        run_id = %run.id,
                        step = %step.name,
                        attempt,
                        error = %error,
                        "Step attempt failed"
                    );

                    if let Some(agent_id) = agent_id {
                        failed_agents.insert(agent_id);
                    }

                    if !error.is_transient() {
                        return Err(StepFailure::Failed {
                            reason: format!("step '{}' failed: {error}", step.name),
                            audit_record_id: record_id,
                        });
                    }
                    if attempt >= retry.max_attempts {
                        return Err(StepFailure::Failed {
                            reason: format!(
                                "step '{}' exhausted {} attempts: {error}",
                                step.name, retry.max_attempts
                            ),
                            audit_record_id: record_id,
                        });
                    }

                    attempt += 1;
                    // Retry scheduled is a checkpointed transition too
                    run.begin_attempt(attempt);
                    self.checkpoint(run).await;

                    let delay = retry.delay_before_attempt(attempt);
                    debug!(
                        run_id = %run.id,
                        step = %step.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retry scheduled"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StepFailure::Cancelled),
                    }
                }
            }
        }
    }

    /// Route and invoke one attempt (fanning out when declared). Returns
    /// the executing agent and the recorded output, or the agent (when one
    /// was selected) and the classified error.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_invocation(
        self: &Arc<Self>,
        run: &WorkflowRun,
        step: &Step,
        attempt: u32,
        payload: serde_json::Value,
        timeout: Duration,
        failed_agents: &HashSet<AgentId>,
        cancel: &CancellationToken,
    ) -> Result<(AgentId, serde_json::Value), (Option<AgentId>, EngineError)> {
        let decision = self
            .registry
            .route(&step.capability, &run.tenant_id)
            .await
            .map_err(|e| {
                let error = match e {
                    // Routing failure is a run-failure cause
                    e @ EngineError::NoEligibleAgent { .. } => {
                        EngineError::Permanent(e.to_string())
                    }
                    other => other,
                };
                (None, error)
            })?;

        // Prefer the best-ranked candidate that has not failed this step
        // yet; when everyone has, start over from the top of the ranking.
        let agent = decision
            .ranked
            .iter()
            .find(|d| !failed_agents.contains(&d.id))
            .unwrap_or_else(|| decision.primary())
            .clone();

        let context = match (&self.retrieval, &step.context_query) {
            (Some(retrieval), Some(query)) => retrieval
                .build_context(query, &run.tenant_id, &[], self.context_budget)
                .await
                .ok(),
            _ => None,
        };

        if let Some(fan_out) = &step.fan_out {
            let items = self
                .fan_out_items(run, &fan_out.items_pointer)
                .map_err(|e| (Some(agent.id), e))?;

            let results: Vec<(usize, Result<serde_json::Value, EngineError>)> =
                stream::iter(items.into_iter().enumerate())
                    .map(|(index, item)| {
                        let registry = self.registry.clone();
                        let cancel = cancel.clone();
                        let context = context.clone();
                        let step_name = step.name.clone();
                        let tenant_id = run.tenant_id.clone();
                        let run_id = run.id;
                        let agent_id = agent.id;
                        async move {
                            let result = registry
                                .invoke(
                                    agent_id,
                                    InvokeArgs {
                                        run_id,
                                        step: step_name.clone(),
                                        attempt,
                                        tenant_id,
                                        idempotency_key: IdempotencyKey::derive_sub_task(
                                            run_id, &step_name, attempt, index,
                                        ),
                                        payload: item,
                                        context,
                                        timeout,
                                    },
                                    &cancel,
                                )
                                .await
                                .map(|invocation| {
                                    invocation.response.unwrap_or(serde_json::Value::Null)
                                });
                            (index, result)
                        }
                    })
                    .buffer_unordered(fan_out.max_parallelism)
                    .collect()
                    .await;

            let mut ordered = results;
            ordered.sort_by_key(|(index, _)| *index);

            let mut outputs = Vec::with_capacity(ordered.len());
            for (_, result) in ordered {
                match result {
                    Ok(output) => outputs.push(output),
                    Err(e) => return Err((Some(agent.id), e)),
                }
            }
            return Ok((agent.id, serde_json::json!({ "items": outputs })));
        }

        let invocation = self
            .registry
            .invoke(
                agent.id,
                InvokeArgs {
                    run_id: run.id,
                    step: step.name.clone(),
                    attempt,
                    tenant_id: run.tenant_id.clone(),
                    idempotency_key: IdempotencyKey::derive(run.id, &step.name, attempt),
                    payload,
                    context,
                    timeout,
                },
                cancel,
            )
            .await
            .map_err(|e| (Some(agent.id), e))?;

        Ok((
            agent.id,
            invocation.response.unwrap_or(serde_json::Value::Null),
        ))
    }

    // ========================================================================
    // Approval Gates
    // ========================================================================

    async fn await_approval(
        &self,
        run: &mut WorkflowRun,
        step: &Step,
        escalation: EscalationDefault,
        cancel: &CancellationToken,
    ) -> ApprovalResolution {
        let freshly_suspended = run.approval_deadline.is_none();
        let deadline = run
            .approval_deadline
            .unwrap_or_else(|| Utc::now() + chrono::Duration::from_std(self.approval_timeout)
                .unwrap_or_else(|_| chrono::Duration::hours(24)));
        run.approval_deadline = Some(deadline);

        // Arm the waiter before the suspended state becomes observable so a
        // prompt signal cannot race the checkpoint.
        let receiver = self.approvals.register(run.id).await;

        if run.state == RunState::Running {
            self.transition(run, RunState::AwaitingApproval).await;
        } else {
            self.checkpoint(run).await;
        }

        if freshly_suspended {
            self.publish(
                &run.tenant_id.clone(),
                DomainEvent::HilApprovalRequired {
                    run_id: run.id,
                    step: step.name.clone(),
                    deadline,
                    requested_at: Utc::now(),
                },
                Some(run.id.to_string()),
            )
            .await;
        }

        let outcome = self.approvals.wait(run.id, receiver, deadline, cancel).await;

        let resolution = match outcome {
            ApprovalOutcome::Approved { approved_by, .. } => {
                self.audit_approval(run, step, "granted", approved_by).await;
                ApprovalResolution::Proceed
            }
            ApprovalOutcome::Rejected {
                rejected_by,
                reason,
            } => {
                self.audit_approval(run, step, "rejected", rejected_by).await;
                ApprovalResolution::Reject(format!(
                    "approval rejected for step '{}': {reason}",
                    step.name
                ))
            }
            ApprovalOutcome::TimedOut => match escalation {
                EscalationDefault::AutoApprove => {
                    self.audit_approval(run, step, "auto_approved", None).await;
                    ApprovalResolution::Proceed
                }
                EscalationDefault::AutoReject => {
                    self.audit_approval(run, step, "auto_rejected", None).await;
                    ApprovalResolution::Reject(format!(
                        "approval timed out for step '{}'; auto-rejected",
                        step.name
                    ))
                }
            },
            ApprovalOutcome::Cancelled => ApprovalResolution::Cancelled,
        };

        run.approval_deadline = None;
        // Resume through the Running edge whatever the resolution was; the
        // caller decides whether the run then unwinds or proceeds.
        if run.state == RunState::AwaitingApproval {
            self.transition(run, RunState::Running).await;
        } else {
            self.checkpoint(run).await;
        }
        resolution
    }

    // ========================================================================
    // Compensation & Termination
    // ========================================================================

    /// Run the author-declared compensation chain over completed steps in
    /// reverse completion order. Compensation is best-effort: failures are
    /// audited and logged but do not stop the chain.
    async fn compensate(&self, run: &mut WorkflowRun, definition: &WorkflowDefinition) {
        if run.completed_steps.is_empty() {
            return;
        }
        if run.state != RunState::Compensating {
            self.transition(run, RunState::Compensating).await;
        }

        for step_name in run.completed_steps.clone().iter().rev() {
            let Some(comp_step) = definition.compensating_step(step_name) else {
                continue;
            };
            info!(
                run_id = %run.id,
                step = %step_name,
                compensating = %comp_step.name,
                "Running compensation"
            );
            if let Err(e) = self.run_compensation_step(run, definition, comp_step).await {
                warn!(
                    run_id = %run.id,
                    compensating = %comp_step.name,
                    error = %e,
                    "Compensation step failed; continuing chain"
                );
            }
        }
    }

    async fn run_compensation_step(
        &self,
        run: &WorkflowRun,
        definition: &WorkflowDefinition,
        comp_step: &Step,
    ) -> Result<(), EngineError> {
        let retry = definition.retry_for(comp_step).clone();
        let timeout = comp_step.timeout.unwrap_or(self.default_step_timeout);
        let payload = self.step_payload(run, comp_step);

        let mut attempt = 1;
        loop {
            let decision = self.registry.route(&comp_step.capability, &run.tenant_id).await;
            let result = match decision {
                Ok(decision) => {
                    self.registry
                        .invoke(
                            decision.primary().id,
                            InvokeArgs {
                                run_id: run.id,
                                step: comp_step.name.clone(),
                                attempt,
                                tenant_id: run.tenant_id.clone(),
                                idempotency_key: IdempotencyKey::derive_compensation(
                                    run.id,
                                    &comp_step.name,
                                    attempt,
                                ),
                                payload: payload.clone(),
                                context: None,
                                timeout,
                            },
                            &CancellationToken::new(),
                        )
                        .await
                }
                Err(e) => Err(e),
            };

            let outcome = if result.is_ok() { "succeeded" } else { "failed" };
            if let Err(e) = self
                .audit
                .append(
                    &run.tenant_id,
                    ActorId::System,
                    "compensation.attempt",
                    serde_json::json!({
                        "run_id": run.id.to_string(),
                        "step": comp_step.name.as_str(),
                        "attempt": attempt,
                        "outcome": outcome,
                    }),
                    None,
                )
                .await
            {
                error!(run_id = %run.id, error = %e, "Failed to audit compensation attempt");
            }

            match result {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    attempt += 1;
                    tokio::time::sleep(retry.delay_before_attempt(attempt)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn terminate(
        &self,
        run: &mut WorkflowRun,
        terminal: RunState,
        reason: String,
        audit_record_id: Option<Uuid>,
    ) {
        if terminal == RunState::Failed {
            run.mark_failed(reason.clone(), audit_record_id);
        }
        self.transition(run, terminal).await;

        let event = match terminal {
            RunState::Failed => {
                warn!(run_id = %run.id, reason = %reason, "Workflow run failed");
                DomainEvent::WorkflowFailed {
                    run_id: run.id,
                    reason,
                    audit_record_id,
                    failed_at: Utc::now(),
                }
            }
            RunState::Cancelled => {
                info!(run_id = %run.id, "Workflow run cancelled");
                DomainEvent::WorkflowCancelled {
                    run_id: run.id,
                    cancelled_at: Utc::now(),
                }
            }
            _ => return,
        };
        self.publish(&run.tenant_id.clone(), event, Some(run.id.to_string()))
            .await;
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Request payload for a step: the run input plus accumulated outputs.
    fn step_payload(&self, run: &WorkflowRun, _step: &Step) -> serde_json::Value {
        serde_json::json!({
            "input": run.input,
            "outputs": run.step_outputs,
        })
    }

    /// Document the policy rules evaluate against.
    fn eval_context(&self, run: &WorkflowRun, payload: &serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "payload": payload,
            "input": run.input,
            "outputs": run.step_outputs,
            "tenant": run.tenant_id.as_str(),
        })
    }

    fn fan_out_items(
        &self,
        run: &WorkflowRun,
        pointer: &str,
    ) -> Result<Vec<serde_json::Value>, EngineError> {
        let doc = serde_json::json!({
            "input": run.input,
            "outputs": run.step_outputs,
        });
        doc.pointer(pointer)
            .and_then(|v| v.as_array())
            .cloned()
            .ok_or_else(|| {
                EngineError::Permanent(format!("fan-out pointer '{pointer}' is not an array"))
            })
    }

    async fn checkpoint(&self, run: &WorkflowRun) {
        if let Err(e) = self.runs.save(run).await {
            error!(run_id = %run.id, error = %e, "Failed to persist run checkpoint");
        }
    }

    async fn transition(&self, run: &mut WorkflowRun, state: RunState) {
        if let Err(e) = run.transition_to(state) {
            error!(run_id = %run.id, error = %e, "Run state transition rejected");
            return;
        }
        self.checkpoint(run).await;
    }

    async fn publish(
        &self,
        tenant_id: &TenantId,
        event: DomainEvent,
        causation_id: Option<String>,
    ) {
        if let Err(e) = self
            .event_bus
            .publish(event.into_envelope(tenant_id.clone(), causation_id))
            .await
        {
            error!(tenant_id = %tenant_id, error = %e, "Failed to publish event");
        }
    }

    /// One audit record per executed step attempt.
    async fn audit_attempt(
        &self,
        run: &WorkflowRun,
        step: &Step,
        attempt: u32,
        agent_id: Option<AgentId>,
        outcome: &str,
        reason: Option<String>,
    ) -> Option<Uuid> {
        let actor = match agent_id {
            Some(agent_id) => ActorId::Agent { agent_id },
            None => ActorId::System,
        };
        match self
            .audit
            .append(
                &run.tenant_id,
                actor,
                "step.attempt",
                serde_json::json!({
                    "run_id": run.id.to_string(),
                    "step": step.name.as_str(),
                    "attempt": attempt,
                    "outcome": outcome,
                    "reason": reason,
                }),
                None,
            )
            .await
        {
            Ok(record) => Some(record.id.0),
            Err(e) => {
                error!(run_id = %run.id, error = %e, "Failed to audit step attempt");
                None
            }
        }
    }

    async fn audit_approval(
        &self,
        run: &WorkflowRun,
        step: &Step,
        outcome: &str,
        by: Option<String>,
    ) {
        if let Err(e) = self
            .audit
            .append(
                &run.tenant_id,
                match &by {
                    Some(user) => ActorId::User {
                        user_id: user.clone(),
                    },
                    None => ActorId::System,
                },
                "approval.resolved",
                serde_json::json!({
                    "run_id": run.id.to_string(),
                    "step": step.name.as_str(),
                    "outcome": outcome,
                }),
                None,
            )
            .await
        {
            error!(run_id = %run.id, error = %e, "Failed to audit approval resolution");
        }
    }
}
