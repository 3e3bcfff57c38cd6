// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Repository Implementations
//!
//! In-memory implementations back development and tests; sled-backed
//! implementations provide durable single-node storage. Both sit behind the
//! traits in [`crate::domain::repository`] and are selected at startup from
//! [`crate::infrastructure::config::StorageBackend`].

mod in_memory;
mod sled_store;

pub use in_memory::{
    InMemoryAuditStore, InMemoryDefinitionRepository, InMemoryEventJournal,
    InMemoryInvocationRepository, InMemoryRunRepository,
};
pub use sled_store::{
    SledAuditStore, SledDefinitionRepository, SledEventJournal, SledInvocationRepository,
    SledRunRepository,
};
