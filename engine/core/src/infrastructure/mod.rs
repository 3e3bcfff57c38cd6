// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

pub mod approval;
pub mod audit_log;
pub mod config;
pub mod event_bus;
pub mod manifest;
pub mod memory_index;
pub mod repositories;

pub use approval::{ApprovalOutcome, ApprovalService};
pub use audit_log::AuditLog;
pub use event_bus::{EventBus, EventBusError, EventSubscription};
