// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Context Retrieval Application Service
//!
//! Builds bounded, cited context packs for agent invocations from a
//! tenant-scoped, permission-filtered source index. Candidates are ranked
//! by (relevance, recency) and greedily packed up to the token budget; each
//! included passage carries its citation. When no permissioned source
//! qualifies the service returns an explicitly empty pack with a warning
//! flag; it never fabricates context. Retrieval provenance is audited.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::audit::ActorId;
use crate::domain::context::{
    Citation, ContextBudget, ContextPack, ContextPassage, ScoredPassage, SourceIndex,
};
use crate::domain::error::EngineError;
use crate::domain::tenant::TenantId;
use crate::infrastructure::audit_log::AuditLog;

/// How many candidates to pull from the index before budget packing
const CANDIDATE_LIMIT: usize = 64;

pub struct ContextRetrievalService {
    index: Arc<dyn SourceIndex>,
    audit: Arc<AuditLog>,
}

impl ContextRetrievalService {
    pub fn new(index: Arc<dyn SourceIndex>, audit: Arc<AuditLog>) -> Self {
        Self { index, audit }
    }

    pub async fn build_context(
        &self,
        query: &str,
        tenant_id: &TenantId,
        permission_scope: &[String],
        budget: ContextBudget,
    ) -> Result<ContextPack, EngineError> {
        let candidates = self
            .index
            .search(query, tenant_id, CANDIDATE_LIMIT)
            .await
            .map_err(|e| EngineError::Internal(format!("source index error: {e}")))?;

        let mut permitted: Vec<ScoredPassage> = candidates
            .into_iter()
            .filter(|p| is_permitted(p, permission_scope))
            .collect();

        permitted.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.recorded_at.cmp(&a.recorded_at))
        });

        // Greedy fill: keep scanning after a miss so smaller passages can
        // still use the remaining budget.
        let mut passages = Vec::new();
        let mut total_tokens = 0usize;
        for candidate in permitted {
            let tokens = ContextBudget::estimate_tokens(&candidate.text);
            if total_tokens + tokens > budget.max_tokens {
                continue;
            }
            total_tokens += tokens;
            passages.push(ContextPassage {
                text: candidate.text,
                citation: Citation {
                    source_id: candidate.source_id,
                    score: candidate.relevance,
                    timestamp: candidate.recorded_at,
                },
            });
        }

        let empty_warning = passages.is_empty();
        if empty_warning {
            warn!(
                query = %query,
                tenant_id = %tenant_id,
                "No permissioned sources qualified; returning empty context pack"
            );
        } else {
            debug!(
                query = %query,
                passages = passages.len(),
                total_tokens,
                "Context pack built"
            );
        }

        let pack = ContextPack {
            query: query.to_string(),
            tenant_id: tenant_id.clone(),
            passages,
            total_tokens,
            empty_warning,
            built_at: Utc::now(),
        };

        self.audit
            .append(
                tenant_id,
                ActorId::System,
                "retrieval.build_context",
                serde_json::json!({
                    "query": query,
                    "sources": pack
                        .passages
                        .iter()
                        .map(|p| p.citation.source_id.0.clone())
                        .collect::<Vec<_>>(),
                    "total_tokens": pack.total_tokens,
                    "empty": pack.empty_warning,
                }),
                None,
            )
            .await?;

        Ok(pack)
    }
}

/// A passage with no scopes is public within its tenant; otherwise the
/// caller's permission scope must intersect the passage's scopes.
fn is_permitted(passage: &ScoredPassage, permission_scope: &[String]) -> bool {
    passage.scopes.is_empty()
        || passage
            .scopes
            .iter()
            .any(|scope| permission_scope.contains(scope))
}
