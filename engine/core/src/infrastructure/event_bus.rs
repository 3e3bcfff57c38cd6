// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
// Event Bus: durable per-tenant publish/subscribe log.
//
// Publish appends to the durable journal first and only then fans out over
// a tokio broadcast channel, so an acknowledged publish is never lost.
// Delivery to live subscribers is at-least-once: a lagged subscriber can
// re-read missed events from the journal via `replay`, and handlers must
// deduplicate by event id.
//
// The bus is notification-only. Orchestrator-to-agent control flow stays
// direct and synchronous.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::events::Event;
use crate::domain::policy::matches_pattern;
use crate::domain::repository::{EventJournal, RepositoryError};
use crate::domain::tenant::TenantId;

/// Event bus for publishing and subscribing to engine events
#[derive(Clone)]
pub struct EventBus {
    journal: Arc<dyn EventJournal>,
    sender: Arc<broadcast::Sender<Event>>,

    /// Serializes append+fan-out so live delivery order matches journal
    /// sequence order
    publish_lock: Arc<tokio::sync::Mutex<()>>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(journal: Arc<dyn EventJournal>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            journal,
            sender: Arc::new(sender),
            publish_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn with_default_capacity(journal: Arc<dyn EventJournal>) -> Self {
        Self::new(journal, Self::DEFAULT_CAPACITY)
    }

    /// Publish an event. Returns the per-tenant sequence only after the
    /// journal write is durable.
    pub async fn publish(&self, event: Event) -> Result<u64, EventBusError> {
        let _guard = self.publish_lock.lock().await;
        let sequence = self.journal.append(&event).await?;
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            sequence,
            "Event published"
        );

        // send() only errors when no subscriber is listening, which is fine
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to event");
        }
        Ok(sequence)
    }

    /// Subscribe to events of a tenant whose type matches the wildcard
    /// pattern (e.g., "workflow.*", "*").
    pub fn subscribe(
        &self,
        type_pattern: impl Into<String>,
        tenant_id: TenantId,
    ) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
            type_pattern: type_pattern.into(),
            tenant_id,
        }
    }

    /// Re-read the tenant's journal from a sequence, for catch-up after a
    /// lag or restart.
    pub async fn replay(
        &self,
        tenant_id: &TenantId,
        from_sequence: u64,
    ) -> Result<Vec<(u64, Event)>, EventBusError> {
        Ok(self.journal.replay(tenant_id, from_sequence).await?)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Filtered receiver for one tenant + type pattern.
///
/// Handlers behind a subscription must be idempotent: re-delivery (via
/// `replay` after a lag) is expected, and `Event::id` is the dedup key.
pub struct EventSubscription {
    receiver: broadcast::Receiver<Event>,
    type_pattern: String,
    tenant_id: TenantId,
}

impl EventSubscription {
    /// Receive the next matching event (blocks until one is available)
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("Event subscriber lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// Try to receive a matching event without blocking
    pub fn try_recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                broadcast::error::TryRecvError::Empty => EventBusError::Empty,
                broadcast::error::TryRecvError::Closed => EventBusError::Closed,
                broadcast::error::TryRecvError::Lagged(n) => {
                    warn!("Event subscriber lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;

            if self.matches(&event) {
                return Ok(event);
            }
        }
    }

    fn matches(&self, event: &Event) -> bool {
        event.tenant_id == self.tenant_id && matches_pattern(&self.type_pattern, &event.event_type)
    }
}

/// Errors that can occur when publishing or receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Subscriber lagged by {0} events (re-read them via replay)")]
    Lagged(u64),

    #[error("Event journal error: {0}")]
    Journal(#[from] RepositoryError),
}
