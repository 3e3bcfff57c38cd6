// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Engine Configuration
//!
//! Engine-wide settings loaded from a YAML file at startup. Storage backend
//! selection follows the repository pattern: in-memory for development and
//! tests, sled for durable single-node deployments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Storage backend for repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    InMemory,
    Sled { path: PathBuf },
}

impl Default for StorageBackend {
    fn default() -> Self {
        Self::InMemory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageBackend,

    /// Broadcast buffer size for live event subscribers
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Deadline for approval waits when no policy overrides it
    #[serde(default = "default_approval_timeout")]
    #[serde(with = "humantime_serde")]
    pub approval_timeout: Duration,

    /// Per-attempt invocation timeout when the step declares none
    #[serde(default = "default_step_timeout")]
    #[serde(with = "humantime_serde")]
    pub default_step_timeout: Duration,

    /// Token-bucket refill per (tenant, agent category)
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    /// Token budget for context packs built for steps with a context query
    #[serde(default = "default_context_budget")]
    pub context_budget_tokens: usize,

    /// Key for signing exported evidence bundles
    #[serde(default = "default_signing_key")]
    pub audit_signing_key: String,
}

fn default_event_capacity() -> usize {
    1024
}

fn default_approval_timeout() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_rate_limit() -> u32 {
    120
}

fn default_context_budget() -> usize {
    1024
}

fn default_signing_key() -> String {
    "synapse-dev-evidence-key".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage: StorageBackend::default(),
            event_capacity: default_event_capacity(),
            approval_timeout: default_approval_timeout(),
            default_step_timeout: default_step_timeout(),
            rate_limit_per_minute: default_rate_limit(),
            context_budget_tokens: default_context_budget(),
            audit_signing_key: default_signing_key(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse engine config YAML")
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read engine config {}", path.as_ref().display())
        })?;
        Self::from_yaml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.storage, StorageBackend::InMemory);
        assert_eq!(config.rate_limit_per_minute, 120);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
storage:
  backend: sled
  path: /var/lib/synapse
approval_timeout: 2h
default_step_timeout: 30s
rate_limit_per_minute: 60
"#;
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.storage,
            StorageBackend::Sled {
                path: PathBuf::from("/var/lib/synapse")
            }
        );
        assert_eq!(config.approval_timeout, Duration::from_secs(7200));
        assert_eq!(config.default_step_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limit_per_minute, 60);
        // Unspecified fields fall back
        assert_eq!(config.event_capacity, 1024);
    }
}
