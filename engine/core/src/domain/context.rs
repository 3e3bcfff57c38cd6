// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Context Pack Domain Model
//!
//! Bounded, cited context assembled for an agent invocation. Every included
//! passage carries citation provenance; a pack that could not be filled from
//! permissioned sources is explicitly empty with a warning flag; the
//! retrieval service never fabricates context.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;

/// Identifier of an indexed source document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId(pub String);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Provenance attached to every passage included in a pack
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: SourceId,
    pub score: f64,
    pub timestamp: DateTime<Utc>,
}

/// A passage included in a context pack, with its citation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPassage {
    pub text: String,
    pub citation: Citation,
}

/// Token/size budget for a pack. Token counts are estimated at roughly four
/// characters per token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ContextBudget {
    pub max_tokens: usize,
}

impl ContextBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn estimate_tokens(text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Bounded, cited context pack handed to the router's invoke path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPack {
    pub query: String,
    pub tenant_id: TenantId,
    pub passages: Vec<ContextPassage>,
    pub total_tokens: usize,

    /// Set when no permissioned source qualified; the pack is empty by
    /// construction, not by accident
    pub empty_warning: bool,

    pub built_at: DateTime<Utc>,
}

impl ContextPack {
    pub fn citations(&self) -> Vec<Citation> {
        self.passages.iter().map(|p| p.citation.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

// ============================================================================
// Source Index Port
// ============================================================================

/// A candidate passage returned by an index search, before budget fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPassage {
    pub source_id: SourceId,
    pub text: String,
    pub relevance: f64,
    pub recorded_at: DateTime<Utc>,
    /// Permission scopes that may read this passage
    pub scopes: Vec<String>,
}

/// Tenant-scoped, permission-filtered source index consulted by the
/// retrieval service. Implemented by infrastructure (or an external search
/// adapter); the engine depends only on this trait.
#[async_trait]
pub trait SourceIndex: Send + Sync {
    /// Return candidate passages for the query, already restricted to the
    /// tenant. Scope filtering is re-checked by the retrieval service.
    async fn search(
        &self,
        query: &str,
        tenant_id: &TenantId,
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPassage>>;
}
