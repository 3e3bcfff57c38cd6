// Copyright (c) 2026 Synapse Contributors
// SPDX-License-Identifier: AGPL-3.0
// Shared test support: counting/failing/hanging mock ports and polling
// helpers for the scenario tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use synapse_core::domain::ports::{Port, PortError, PortHealth, PortRequest, PortResponse};
use synapse_core::domain::workflow::{RunId, RunState, RunSnapshot};
use synapse_core::application::Engine;

/// Mock port that applies one side effect per idempotency key and counts
/// both raw calls and distinct side effects. Optionally hangs after the
/// first side effect is applied (simulating a crash window) or fails a
/// fixed number of leading calls.
pub struct MockPort {
    capability: String,
    pub calls: AtomicUsize,
    pub side_effects: AtomicUsize,
    applied: Mutex<HashMap<String, serde_json::Value>>,
    hang_after_first_apply: AtomicBool,
    transient_failures_remaining: AtomicUsize,
    delay: Option<Duration>,
}

impl MockPort {
    pub fn up(capability: &str) -> Arc<Self> {
        Arc::new(Self {
            capability: capability.to_string(),
            calls: AtomicUsize::new(0),
            side_effects: AtomicUsize::new(0),
            applied: Mutex::new(HashMap::new()),
            hang_after_first_apply: AtomicBool::new(false),
            transient_failures_remaining: AtomicUsize::new(0),
            delay: None,
        })
    }

    /// Every call sleeps this long before answering (for timeout tests)
    pub fn slow(capability: &str, delay: Duration) -> Arc<Self> {
        let mut port = Self {
            capability: capability.to_string(),
            calls: AtomicUsize::new(0),
            side_effects: AtomicUsize::new(0),
            applied: Mutex::new(HashMap::new()),
            hang_after_first_apply: AtomicBool::new(false),
            transient_failures_remaining: AtomicUsize::new(0),
            delay: None,
        };
        port.delay = Some(delay);
        Arc::new(port)
    }

    /// First `n` calls fail with a transient error
    pub fn flaky(capability: &str, n: usize) -> Arc<Self> {
        let port = Self {
            capability: capability.to_string(),
            calls: AtomicUsize::new(0),
            side_effects: AtomicUsize::new(0),
            applied: Mutex::new(HashMap::new()),
            hang_after_first_apply: AtomicBool::new(false),
            transient_failures_remaining: AtomicUsize::new(n),
            delay: None,
        };
        Arc::new(port)
    }

    /// Applies the side effect for the first key, then hangs until the
    /// process "crashes" (the test drops the runtime)
    pub fn crashy(capability: &str) -> Arc<Self> {
        let port = Self {
            capability: capability.to_string(),
            calls: AtomicUsize::new(0),
            side_effects: AtomicUsize::new(0),
            applied: Mutex::new(HashMap::new()),
            hang_after_first_apply: AtomicBool::new(true),
            transient_failures_remaining: AtomicUsize::new(0),
            delay: None,
        };
        Arc::new(port)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn side_effect_count(&self) -> usize {
        self.side_effects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Port for MockPort {
    fn capability(&self) -> &str {
        &self.capability
    }

    async fn invoke(&self, request: PortRequest) -> Result<PortResponse, PortError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self
            .transient_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PortError::Transient("simulated transient failure".into()));
        }

        let key = request.idempotency_key.as_str().to_string();
        let response = serde_json::json!({"ok": true, "echo": request.payload});

        // Idempotency contract: a re-delivered key returns the committed
        // result without a second side effect.
        {
            let mut applied = self.applied.lock().unwrap();
            if let Some(cached) = applied.get(&key) {
                return Ok(PortResponse {
                    payload: cached.clone(),
                    confidence: Some(1.0),
                    citations: vec![],
                });
            }
            applied.insert(key, response.clone());
        }
        self.side_effects.fetch_add(1, Ordering::SeqCst);

        if self.hang_after_first_apply.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }

        Ok(PortResponse {
            payload: response,
            confidence: Some(1.0),
            citations: vec![],
        })
    }

    async fn health(&self) -> PortHealth {
        PortHealth::Up
    }
}

/// Poll the run until it reaches a terminal state (panics after 10s).
pub async fn wait_for_terminal(engine: &Engine, run_id: RunId) -> RunSnapshot {
    for _ in 0..500 {
        let snapshot = engine.query(run_id).await.expect("run should exist");
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} did not reach a terminal state in time");
}

/// Poll the run until it suspends in AwaitingApproval (panics after 10s).
pub async fn wait_for_suspended(engine: &Engine, run_id: RunId) -> RunSnapshot {
    for _ in 0..500 {
        let snapshot = engine.query(run_id).await.expect("run should exist");
        if snapshot.state == RunState::AwaitingApproval {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {run_id} did not suspend in time");
}
