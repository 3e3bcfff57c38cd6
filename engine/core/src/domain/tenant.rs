// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};

/// Tenant identifier. All durable state in the engine is partitioned by
/// tenant: audit chains, event streams, policy sets, and rate limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
