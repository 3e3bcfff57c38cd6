// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Synapse Core
//!
//! Agent orchestration and governance engine: durable workflow runs,
//! capability routing, declarative policy gating, hash-chained audit, and
//! per-tenant event streaming.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services, and infrastructure
//!   adapters for the orchestration control plane

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
