// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Agent Registry & Router Application Service
//!
//! Maintains the capability catalogue (descriptor arena plus a capability
//! index) and selects an eligible agent for each step: capability match,
//! tenant entitlement, healthy required ports, then ranked by ascending
//! recent error rate and latency. Invocations acquire the agent's
//! concurrency semaphore (bounded wait) and pass the per-tenant-per-category
//! token bucket before the port is called. Every routing decision (chosen
//! agent plus rejected candidates with reasons) is appended to the audit
//! log for explainability.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentDescriptor, AgentId, AgentStatsSnapshot, RollingStats};
use crate::domain::audit::ActorId;
use crate::domain::context::ContextPack;
use crate::domain::error::EngineError;
use crate::domain::invocation::{IdempotencyKey, Invocation, InvocationId, InvocationOutcome};
use crate::domain::ports::{Port, PortError, PortHealth, PortRequest};
use crate::domain::repository::InvocationRepository;
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{Capability, RunId, StepName};
use crate::infrastructure::audit_log::AuditLog;

struct AgentEntry {
    descriptor: AgentDescriptor,
    stats: Mutex<RollingStats>,
    semaphore: Arc<Semaphore>,
}

/// Routing result: the top candidate plus the ranked fallback list.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    /// Eligible agents, best first
    pub ranked: Vec<AgentDescriptor>,
}

impl RouteDecision {
    pub fn primary(&self) -> &AgentDescriptor {
        &self.ranked[0]
    }

    pub fn fallbacks(&self) -> &[AgentDescriptor] {
        &self.ranked[1..]
    }
}

/// Arguments for one invocation attempt
pub struct InvokeArgs {
    pub run_id: RunId,
    pub step: StepName,
    pub attempt: u32,
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub payload: serde_json::Value,
    pub context: Option<ContextPack>,
    pub timeout: Duration,
}

type RateKey = (String, String);

pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentEntry>,

    /// capability → agent ids declaring it (the index over the arena)
    capability_index: DashMap<String, Vec<AgentId>>,

    /// port name → adapter
    ports: DashMap<String, Arc<dyn Port>>,

    /// One token bucket per (tenant, agent category)
    rate_limiter: DefaultKeyedRateLimiter<RateKey>,

    invocations: Arc<dyn InvocationRepository>,
    audit: Arc<AuditLog>,
}

impl AgentRegistry {
    pub fn new(
        invocations: Arc<dyn InvocationRepository>,
        audit: Arc<AuditLog>,
        rate_limit_per_minute: u32,
    ) -> Self {
        let per_minute =
            NonZeroU32::new(rate_limit_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        Self {
            agents: DashMap::new(),
            capability_index: DashMap::new(),
            ports: DashMap::new(),
            rate_limiter: RateLimiter::keyed(Quota::per_minute(per_minute)),
            invocations,
            audit,
        }
    }

    // ========================================================================
    // Catalogue Management
    // ========================================================================

    /// Register an agent descriptor. New agent kinds are additive rows in
    /// the catalogue.
    pub fn register(&self, descriptor: AgentDescriptor) -> AgentId {
        let id = descriptor.id;
        info!(
            agent_id = %id,
            name = %descriptor.name,
            capability = %descriptor.capability,
            "Agent registered"
        );
        self.capability_index
            .entry(descriptor.capability.as_str().to_string())
            .or_default()
            .push(id);
        let semaphore = Arc::new(Semaphore::new(descriptor.concurrency_limit));
        self.agents.insert(
            id,
            AgentEntry {
                descriptor,
                stats: Mutex::new(RollingStats::default()),
                semaphore,
            },
        );
        id
    }

    /// Soft-deactivate an agent: it stops being routable but its descriptor
    /// stays resolvable for runs that reference it.
    pub fn deactivate(&self, agent_id: AgentId) -> Result<(), EngineError> {
        let mut entry = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
        entry.descriptor.deactivate();
        info!(agent_id = %agent_id, "Agent deactivated");
        Ok(())
    }

    pub fn register_port(&self, name: impl Into<String>, port: Arc<dyn Port>) {
        self.ports.insert(name.into(), port);
    }

    pub fn descriptor(&self, agent_id: AgentId) -> Option<AgentDescriptor> {
        self.agents.get(&agent_id).map(|e| e.descriptor.clone())
    }

    pub fn stats(&self, agent_id: AgentId) -> Option<AgentStatsSnapshot> {
        self.agents.get(&agent_id).map(|e| {
            let stats = e.stats.lock();
            AgentStatsSnapshot {
                agent_id,
                error_rate: stats.error_rate(),
                avg_latency_ms: stats.avg_latency_ms(),
                sample_count: stats.sample_count(),
            }
        })
    }

    pub fn list_agents(&self) -> Vec<AgentDescriptor> {
        self.agents.iter().map(|e| e.descriptor.clone()).collect()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Select an eligible agent for a capability under tenant entitlements.
    /// The decision (including every rejected candidate and why) is audited.
    pub async fn route(
        &self,
        capability: &Capability,
        tenant_id: &TenantId,
    ) -> Result<RouteDecision, EngineError> {
        let candidate_ids: Vec<AgentId> = self
            .capability_index
            .get(capability.as_str())
            .map(|ids| ids.clone())
            .unwrap_or_default();

        let mut eligible: Vec<(AgentDescriptor, f64, f64)> = Vec::new();
        let mut rejected: Vec<(AgentId, String)> = Vec::new();

        for agent_id in candidate_ids {
            let Some(descriptor) = self.descriptor(agent_id) else {
                continue;
            };
            if !descriptor.is_active() {
                rejected.push((agent_id, "deactivated".to_string()));
                continue;
            }
            if !descriptor.entitles(tenant_id) {
                rejected.push((agent_id, "tenant not entitled".to_string()));
                continue;
            }
            if let Some(reason) = self.unhealthy_port(&descriptor).await {
                rejected.push((agent_id, reason));
                continue;
            }
            let (error_rate, latency) = {
                let entry = self
                    .agents
                    .get(&agent_id)
                    .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
                let stats = entry.stats.lock();
                (stats.error_rate(), stats.avg_latency_ms())
            };
            eligible.push((descriptor, error_rate, latency));
        }

        eligible.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal))
        });

        let ranked: Vec<AgentDescriptor> = eligible.into_iter().map(|(d, _, _)| d).collect();

        self.audit
            .append(
                tenant_id,
                ActorId::System,
                "router.route",
                serde_json::json!({
                    "capability": capability.as_str(),
                    "chosen": ranked.first().map(|d| d.id.to_string()),
                    "fallbacks": ranked.iter().skip(1).map(|d| d.id.to_string()).collect::<Vec<_>>(),
                    "rejected": rejected
                        .iter()
                        .map(|(id, reason)| serde_json::json!({"agent": id.to_string(), "reason": reason}))
                        .collect::<Vec<_>>(),
                }),
                None,
            )
            .await?;

        if ranked.is_empty() {
            warn!(
                capability = %capability,
                tenant_id = %tenant_id,
                rejected = rejected.len(),
                "No eligible agent"
            );
            return Err(EngineError::NoEligibleAgent {
                capability: capability.as_str().to_string(),
                tenant: tenant_id.as_str().to_string(),
            });
        }

        debug!(
            capability = %capability,
            chosen = %ranked[0].id,
            fallbacks = ranked.len() - 1,
            "Routed capability"
        );
        Ok(RouteDecision { ranked })
    }

    /// First unhealthy or missing required port, as a rejection reason. The
    /// executor port is always required.
    async fn unhealthy_port(&self, descriptor: &AgentDescriptor) -> Option<String> {
        let mut required: Vec<&str> = vec![descriptor.executor_port_name()];
        required.extend(descriptor.required_ports.iter().map(|s| s.as_str()));

        for name in required {
            match self.ports.get(name).map(|p| p.clone()) {
                None => return Some(format!("port '{name}' not registered")),
                Some(port) => {
                    let health = port.health().await;
                    if !health.is_routable() {
                        return Some(format!("port '{name}' is down"));
                    }
                }
            }
        }
        None
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Invoke an agent once. The attempt record is persisted whether it
    /// succeeds or fails; failures come back as classified engine errors so
    /// the orchestrator's retry policy can decide what happens next.
    pub async fn invoke(
        &self,
        agent_id: AgentId,
        args: InvokeArgs,
        cancel: &CancellationToken,
    ) -> Result<Invocation, EngineError> {
        let (descriptor, semaphore) = {
            let entry = self
                .agents
                .get(&agent_id)
                .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;
            (entry.descriptor.clone(), entry.semaphore.clone())
        };

        let rate_key = (
            args.tenant_id.as_str().to_string(),
            descriptor.category.clone(),
        );
        if self.rate_limiter.check_key(&rate_key).is_err() {
            return Err(EngineError::Transient(format!(
                "rate limit exceeded for tenant '{}' category '{}'",
                args.tenant_id, descriptor.category
            )));
        }

        // Bounded wait for a concurrency slot; saturation beyond the step
        // timeout is the step's failure, not a deadlock.
        let permit = match tokio::time::timeout(args.timeout, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(EngineError::Internal(format!(
                    "agent {agent_id} semaphore closed"
                )))
            }
            Err(_) => {
                return Err(EngineError::Timeout(format!(
                    "waiting for agent {} concurrency slot",
                    descriptor.name
                )))
            }
        };

        let port = self
            .ports
            .get(descriptor.executor_port_name())
            .map(|p| p.clone())
            .ok_or_else(|| {
                EngineError::Internal(format!(
                    "port '{}' disappeared after routing",
                    descriptor.executor_port_name()
                ))
            })?;

        let request = PortRequest {
            capability: descriptor.capability.as_str().to_string(),
            idempotency_key: args.idempotency_key.clone(),
            payload: args.payload.clone(),
            context: args.context.clone(),
        };

        let started_at = Utc::now();
        let started = std::time::Instant::now();

        let result = tokio::select! {
            result = tokio::time::timeout(args.timeout, port.invoke(request)) => result,
            _ = cancel.cancelled() => {
                drop(permit);
                self.record_attempt(&args, agent_id, None, InvocationOutcome::Failed {
                    reason: "cancelled".to_string(),
                }, started_at).await?;
                return Err(EngineError::Transient("invocation cancelled".to_string()));
            }
        };

        let latency_ms = started.elapsed().as_millis() as u64;
        drop(permit);

        match result {
            Ok(Ok(response)) => {
                self.record_stats(agent_id, true, latency_ms);
                let invocation = self
                    .record_attempt(
                        &args,
                        agent_id,
                        Some(response),
                        InvocationOutcome::Succeeded,
                        started_at,
                    )
                    .await?;
                Ok(invocation)
            }
            Ok(Err(port_error)) => {
                self.record_stats(agent_id, false, latency_ms);
                self.record_attempt(
                    &args,
                    agent_id,
                    None,
                    InvocationOutcome::Failed {
                        reason: port_error.to_string(),
                    },
                    started_at,
                )
                .await?;
                Err(classify(port_error))
            }
            Err(_) => {
                self.record_stats(agent_id, false, latency_ms);
                self.record_attempt(&args, agent_id, None, InvocationOutcome::TimedOut, started_at)
                    .await?;
                Err(EngineError::Timeout(format!(
                    "agent {} exceeded {:?}",
                    descriptor.name, args.timeout
                )))
            }
        }
    }

    fn record_stats(&self, agent_id: AgentId, ok: bool, latency_ms: u64) {
        if let Some(entry) = self.agents.get(&agent_id) {
            entry.stats.lock().record(ok, latency_ms);
        }
    }

    async fn record_attempt(
        &self,
        args: &InvokeArgs,
        agent_id: AgentId,
        response: Option<crate::domain::ports::PortResponse>,
        outcome: InvocationOutcome,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<Invocation, EngineError> {
        let (payload, confidence, citations) = match response {
            Some(r) => (Some(r.payload), r.confidence, r.citations),
            None => (None, None, Vec::new()),
        };
        let invocation = Invocation {
            id: InvocationId::new(),
            run_id: args.run_id,
            step: args.step.clone(),
            agent_id,
            attempt: args.attempt,
            idempotency_key: args.idempotency_key.clone(),
            request: args.payload.clone(),
            response: payload,
            confidence,
            citations,
            outcome,
            started_at,
            ended_at: Some(Utc::now()),
        };
        self.invocations.append(&invocation).await?;
        Ok(invocation)
    }
}

fn classify(error: PortError) -> EngineError {
    match error {
        PortError::Transient(msg) => EngineError::Transient(msg),
        PortError::Permanent(msg) => EngineError::Permanent(msg),
    }
}
