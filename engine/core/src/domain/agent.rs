// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Agent Catalogue Domain Model
//!
//! Agents are data-driven descriptor rows in an indexed registry, not types
//! in a hierarchy: a new agent kind is a new row, never new control flow.
//! Descriptors are created at registration, mutated only by the router's
//! stat-update path, and soft-deactivated rather than deleted while a run
//! may still reference them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::domain::tenant::TenantId;
use crate::domain::workflow::Capability;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a catalogue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentState {
    Active,
    /// Soft delete: excluded from routing, retained for runs that still
    /// reference it
    Deactivated,
}

/// Capability catalogue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub name: String,

    /// Coarse grouping used for per-tenant rate limiting (e.g., "content",
    /// "analytics")
    pub category: String,

    pub capability: Capability,

    /// Declared input field names (documentation for callers)
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Declared output field names
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Port this agent executes through; defaults to the port named by the
    /// capability
    #[serde(default)]
    pub executor_port: Option<String>,

    /// Names of external ports this agent needs healthy to run
    #[serde(default)]
    pub required_ports: Vec<String>,

    /// Tenant entitlement tags; "*" entitles every tenant
    #[serde(default)]
    pub entitlements: Vec<String>,

    /// Maximum concurrent invocations
    pub concurrency_limit: usize,

    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentDescriptor {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        capability: Capability,
        entitlements: Vec<String>,
        required_ports: Vec<String>,
        concurrency_limit: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            category: category.into(),
            capability,
            inputs: Vec::new(),
            outputs: Vec::new(),
            executor_port: None,
            required_ports,
            entitlements,
            concurrency_limit: concurrency_limit.max(1),
            state: AgentState::Active,
            registered_at: now,
            updated_at: now,
        }
    }

    pub fn with_executor_port(mut self, port: impl Into<String>) -> Self {
        self.executor_port = Some(port.into());
        self
    }

    pub fn is_active(&self) -> bool {
        self.state == AgentState::Active
    }

    /// Name of the port invocations are executed through
    pub fn executor_port_name(&self) -> &str {
        self.executor_port
            .as_deref()
            .unwrap_or(self.capability.as_str())
    }

    /// Whether the tenant is entitled to this agent
    pub fn entitles(&self, tenant: &TenantId) -> bool {
        self.entitlements
            .iter()
            .any(|tag| tag == "*" || tag == tenant.as_str())
    }

    pub fn deactivate(&mut self) {
        self.state = AgentState::Deactivated;
        self.updated_at = Utc::now();
    }
}

// ============================================================================
// Rolling Statistics
// ============================================================================

/// Rolling window over recent invocation outcomes, used by the router to
/// rank candidates by (error rate, latency).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingStats {
    window: VecDeque<InvocationSample>,
    window_size: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct InvocationSample {
    ok: bool,
    latency_ms: u64,
}

impl RollingStats {
    pub const DEFAULT_WINDOW: usize = 50;

    pub fn new(window_size: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    pub fn record(&mut self, ok: bool, latency_ms: u64) {
        if self.window.len() == self.window_size {
            self.window.pop_front();
        }
        self.window.push_back(InvocationSample { ok, latency_ms });
    }

    /// Fraction of failed invocations in the window; 0.0 when empty so fresh
    /// agents are routable
    pub fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|s| !s.ok).count();
        failures as f64 / self.window.len() as f64
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let total: u64 = self.window.iter().map(|s| s.latency_ms).sum();
        total as f64 / self.window.len() as f64
    }

    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

impl Default for RollingStats {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

/// Point-in-time view of an agent's health, exposed by the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatsSnapshot {
    pub agent_id: AgentId,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub sample_count: usize,
}
