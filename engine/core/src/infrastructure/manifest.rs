// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Manifest Parsers
//!
//! Parses external YAML manifests into domain objects with validation.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Parse external YAML → Domain objects
//! - **Anti-Corruption:** Translates the manifest schema to the domain model
//!
//! # Manifest Formats
//!
//! ```yaml
//! apiVersion: synapse.dev/v1
//! kind: Workflow
//! metadata:
//!   name: publish-content
//!   version: 1
//! spec:
//!   steps:
//!     - name: governance-check
//!       capability: governance.check
//!     - name: publish
//!       capability: cms.publish
//!       requires_approval: true
//!   compensation_steps:
//!     - name: unpublish
//!       capability: cms.unpublish
//!   compensation:
//!     publish: unpublish
//! ```
//!
//! ```yaml
//! apiVersion: synapse.dev/v1
//! kind: PolicySet
//! metadata:
//!   tenant: t1          # omit for a global set
//!   version: 3
//! spec:
//!   policies:
//!     - name: require-consent
//!       action_pattern: step.governance-check.pre
//!       rule: { op: not, rule: ... }
//!       outcome: { kind: block, reason: missing consent }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::policy::{
    EscalationDefault, Policy, PolicyId, PolicyOutcome, PolicyScope, PolicySet, RuleExpr,
};
use crate::domain::tenant::TenantId;
use crate::domain::workflow::{RetryPolicy, Step, StepName, WorkflowDefinition};

pub const API_VERSION: &str = "synapse.dev/v1";

// ============================================================================
// Workflow Manifests
// ============================================================================

/// External YAML representation of a workflow manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkflowMetadataYaml,
    pub spec: WorkflowSpecYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadataYaml {
    pub name: String,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpecYaml {
    pub steps: Vec<Step>,

    #[serde(default)]
    pub compensation_steps: Vec<Step>,

    #[serde(default)]
    pub compensation: HashMap<StepName, StepName>,

    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub global_timeout: Option<Duration>,

    #[serde(default)]
    pub default_retry: Option<RetryPolicy>,
}

/// Parser for workflow definition manifests
pub struct WorkflowParser;

impl WorkflowParser {
    pub fn parse_yaml(yaml: &str) -> Result<WorkflowDefinition> {
        let manifest: WorkflowManifest =
            serde_yaml::from_str(yaml).context("Failed to parse workflow manifest YAML")?;

        if manifest.api_version != API_VERSION {
            bail!(
                "Invalid apiVersion: expected '{}', got '{}'",
                API_VERSION,
                manifest.api_version
            );
        }
        if manifest.kind != "Workflow" {
            bail!("Invalid kind: expected 'Workflow', got '{}'", manifest.kind);
        }

        let definition = WorkflowDefinition::new(
            manifest.metadata.name,
            manifest.metadata.version,
            manifest.spec.steps,
            manifest.spec.compensation_steps,
            manifest.spec.compensation,
            manifest.spec.global_timeout,
            manifest.spec.default_retry.unwrap_or_default(),
        )?;
        Ok(definition)
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read workflow manifest {}", path.as_ref().display())
        })?;
        Self::parse_yaml(&content)
    }
}

// ============================================================================
// Policy Set Manifests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySetManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: PolicySetMetadataYaml,
    pub spec: PolicySetSpecYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySetMetadataYaml {
    /// Tenant the set applies to; omit for a global set
    #[serde(default)]
    pub tenant: Option<String>,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySetSpecYaml {
    pub policies: Vec<PolicyYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyYaml {
    pub name: String,
    pub action_pattern: String,
    pub rule: RuleExpr,
    pub outcome: PolicyOutcome,
    #[serde(default)]
    pub escalation: EscalationDefault,
}

/// Parser for policy set manifests
pub struct PolicySetParser;

impl PolicySetParser {
    /// Returns the tenant scope (None for global) and the parsed set.
    pub fn parse_yaml(yaml: &str) -> Result<(Option<TenantId>, PolicySet)> {
        let manifest: PolicySetManifest =
            serde_yaml::from_str(yaml).context("Failed to parse policy set manifest YAML")?;

        if manifest.api_version != API_VERSION {
            bail!(
                "Invalid apiVersion: expected '{}', got '{}'",
                API_VERSION,
                manifest.api_version
            );
        }
        if manifest.kind != "PolicySet" {
            bail!("Invalid kind: expected 'PolicySet', got '{}'", manifest.kind);
        }

        let tenant = manifest.metadata.tenant.map(TenantId::new);
        let scope = match &tenant {
            Some(tenant_id) => PolicyScope::Tenant {
                tenant_id: tenant_id.clone(),
            },
            None => PolicyScope::Global,
        };

        let policies = manifest
            .spec
            .policies
            .into_iter()
            .map(|p| Policy {
                id: PolicyId::new(),
                name: p.name,
                scope: scope.clone(),
                action_pattern: p.action_pattern,
                rule: p.rule,
                outcome: p.outcome,
                escalation: p.escalation,
            })
            .collect();

        Ok((
            tenant,
            PolicySet {
                version: manifest.metadata.version,
                policies,
            },
        ))
    }

    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<(Option<TenantId>, PolicySet)> {
        let content = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("Failed to read policy set manifest {}", path.as_ref().display())
        })?;
        Self::parse_yaml(&content)
    }
}
