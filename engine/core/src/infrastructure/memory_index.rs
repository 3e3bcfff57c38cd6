// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! In-Memory Source Index
//!
//! Reference implementation of the [`SourceIndex`] port for development and
//! testing: documents are registered programmatically, scoped to a tenant
//! and permission scopes, and scored by term overlap with the query.
//! Production deployments plug a search adapter in behind the same trait.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::context::{ScoredPassage, SourceId, SourceIndex};
use crate::domain::tenant::TenantId;

#[derive(Debug, Clone)]
struct IndexedDocument {
    source_id: SourceId,
    text: String,
    scopes: Vec<String>,
    recorded_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemorySourceIndex {
    documents: RwLock<HashMap<String, Vec<IndexedDocument>>>,
}

impl InMemorySourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_document(
        &self,
        tenant_id: &TenantId,
        source_id: impl Into<String>,
        text: impl Into<String>,
        scopes: Vec<String>,
        recorded_at: DateTime<Utc>,
    ) {
        let mut documents = self.documents.write().await;
        documents
            .entry(tenant_id.as_str().to_string())
            .or_default()
            .push(IndexedDocument {
                source_id: SourceId(source_id.into()),
                text: text.into(),
                scopes,
                recorded_at,
            });
    }
}

/// Term-overlap score in [0, 1]: fraction of distinct query terms present
/// in the document.
fn overlap_score(query: &str, text: &str) -> f64 {
    let query_terms: Vec<String> = query
        .to_lowercase()
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect();
    if query_terms.is_empty() {
        return 0.0;
    }
    let text_lower = text.to_lowercase();
    let hits = query_terms
        .iter()
        .filter(|term| text_lower.contains(term.as_str()))
        .count();
    hits as f64 / query_terms.len() as f64
}

#[async_trait]
impl SourceIndex for InMemorySourceIndex {
    async fn search(
        &self,
        query: &str,
        tenant_id: &TenantId,
        limit: usize,
    ) -> anyhow::Result<Vec<ScoredPassage>> {
        let documents = self.documents.read().await;
        let mut passages: Vec<ScoredPassage> = documents
            .get(tenant_id.as_str())
            .map(|docs| {
                docs.iter()
                    .map(|doc| ScoredPassage {
                        source_id: doc.source_id.clone(),
                        text: doc.text.clone(),
                        relevance: overlap_score(query, &doc.text),
                        recorded_at: doc.recorded_at,
                        scopes: doc.scopes.clone(),
                    })
                    .filter(|p| p.relevance > 0.0)
                    .collect()
            })
            .unwrap_or_default();

        passages.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.recorded_at.cmp(&a.recorded_at))
        });
        passages.truncate(limit);
        Ok(passages)
    }
}
