// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod facade;
pub mod governance;
pub mod orchestrator;
pub mod retrieval;
pub mod router;

pub use facade::Engine;
pub use governance::{PolicyDecision, PolicyEngine, ProposedAction};
pub use orchestrator::Orchestrator;
pub use retrieval::ContextRetrievalService;
pub use router::{AgentRegistry, RouteDecision};
