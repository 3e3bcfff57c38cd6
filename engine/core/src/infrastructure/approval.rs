// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Approval Service - infrastructure for human-in-the-loop gates
//!
//! Delivers external approval/rejection signals to suspended runs and
//! bounds the wait with a deadline. The deadline itself is durable (it is
//! checkpointed on the run before the wait starts), so a restarted process
//! re-arms the timer from the stored deadline instead of a fresh one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::workflow::RunId;

/// Result of an approval wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved {
        approved_by: Option<String>,
        feedback: Option<String>,
    },
    Rejected {
        rejected_by: Option<String>,
        reason: String,
    },
    /// Deadline elapsed without a signal; escalation policy decides what
    /// happens next
    TimedOut,
    /// The run was cancelled while suspended
    Cancelled,
}

/// Signal delivered by `Orchestrator::signal`
#[derive(Debug, Clone)]
pub enum ApprovalSignal {
    Approve {
        approved_by: Option<String>,
        feedback: Option<String>,
    },
    Reject {
        rejected_by: Option<String>,
        reason: String,
    },
}

/// Approval gate service: one pending wait per suspended run.
pub struct ApprovalService {
    pending: Arc<RwLock<HashMap<RunId, oneshot::Sender<ApprovalSignal>>>>,
}

impl ApprovalService {
    pub fn new() -> Self {
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Arm the waiter for a run. Callers register *before* checkpointing
    /// the suspended state, so a signal can never observe a suspended run
    /// without a waiter. Exactly one waiter per run; a second registration
    /// replaces the first (the stale sender is dropped).
    pub async fn register(&self, run_id: RunId) -> oneshot::Receiver<ApprovalSignal> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.write().await;
        if pending.insert(run_id, tx).is_some() {
            warn!(run_id = %run_id, "Replacing stale approval waiter");
        }
        rx
    }

    /// Wait on a registered receiver until `deadline`, observing
    /// cancellation.
    pub async fn wait(
        &self,
        run_id: RunId,
        rx: oneshot::Receiver<ApprovalSignal>,
        deadline: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> ApprovalOutcome {
        info!(run_id = %run_id, deadline = %deadline, "Awaiting approval signal");

        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let outcome = tokio::select! {
            signal = rx => match signal {
                Ok(ApprovalSignal::Approve { approved_by, feedback }) => {
                    ApprovalOutcome::Approved { approved_by, feedback }
                }
                Ok(ApprovalSignal::Reject { rejected_by, reason }) => {
                    ApprovalOutcome::Rejected { rejected_by, reason }
                }
                // Sender dropped without a signal (waiter replaced)
                Err(_) => ApprovalOutcome::TimedOut,
            },
            _ = tokio::time::sleep(remaining) => ApprovalOutcome::TimedOut,
            _ = cancel.cancelled() => ApprovalOutcome::Cancelled,
        };

        self.pending.write().await.remove(&run_id);
        debug!(run_id = %run_id, outcome = ?outcome, "Approval wait resolved");
        outcome
    }

    /// Deliver a signal to a suspended run. Returns false when no waiter is
    /// registered (run not suspended, or signal raced the deadline).
    pub async fn deliver(&self, run_id: RunId, signal: ApprovalSignal) -> bool {
        let sender = self.pending.write().await.remove(&run_id);
        match sender {
            Some(tx) => {
                info!(run_id = %run_id, "Delivering approval signal");
                tx.send(signal).is_ok()
            }
            None => false,
        }
    }

    /// Runs currently waiting on a signal
    pub async fn pending_runs(&self) -> Vec<RunId> {
        self.pending.read().await.keys().copied().collect()
    }
}

impl Default for ApprovalService {
    fn default() -> Self {
        Self::new()
    }
}
