// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Outbound Port Contract
//!
//! A port is the narrow interface an external-system adapter (CMS, CRM,
//! commerce, analytics, ...) implements. The orchestrator and router depend
//! only on this trait, never on a concrete adapter. Ports must honor the
//! idempotency key carried in every request: two invokes with the same key
//! produce one side effect.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::context::{Citation, ContextPack};
use crate::domain::invocation::IdempotencyKey;

/// Port health as reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortHealth {
    Up,
    Degraded,
    Down,
}

impl PortHealth {
    /// Degraded ports stay routable; only Down excludes an agent
    pub fn is_routable(&self) -> bool {
        !matches!(self, Self::Down)
    }
}

/// Request delivered to a port by the router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRequest {
    pub capability: String,
    pub idempotency_key: IdempotencyKey,
    pub payload: serde_json::Value,

    /// Optional cited context pack so the adapter/agent can ground its
    /// decision
    pub context: Option<ContextPack>,
}

/// Response returned by a port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortResponse {
    pub payload: serde_json::Value,
    pub confidence: Option<f64>,

    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Port failure taxonomy; the orchestrator's retry logic keys off
/// `is_transient`.
#[derive(Debug, Clone, Error)]
pub enum PortError {
    #[error("Transient port failure: {0}")]
    Transient(String),

    #[error("Permanent port failure: {0}")]
    Permanent(String),
}

impl PortError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Abstract capability interface implemented by external-system adapters.
#[async_trait]
pub trait Port: Send + Sync {
    /// Capability this port serves (e.g., "cms.publish")
    fn capability(&self) -> &str;

    async fn invoke(&self, request: PortRequest) -> Result<PortResponse, PortError>;

    async fn health(&self) -> PortHealth;
}
