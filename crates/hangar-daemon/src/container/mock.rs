// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock container adapter for testing.
//!
//! Containers live only in memory. The factory records every start and stop
//! with a timestamp and tracks how many containers of each handle are live at
//! once, so tests can check ordering and mutual exclusion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::*;

/// What happened to a mock container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockEventKind {
    /// Start succeeded.
    Started,
    /// Start was configured to fail.
    StartFailed,
    /// Stop was called.
    Stopped,
    /// The container died on its own (see [`MockContainerFactory::crash`]).
    Crashed,
}

/// A recorded mock container event.
#[derive(Debug, Clone)]
pub struct MockEvent {
    /// Handle the container belongs to.
    pub handle_id: String,
    /// Event kind.
    pub kind: MockEventKind,
    /// When it happened (tokio clock, so paused-time tests see virtual time).
    pub at: Instant,
}

#[derive(Default)]
struct MockShared {
    events: Mutex<Vec<MockEvent>>,
    live: Mutex<HashMap<String, usize>>,
    max_live: Mutex<HashMap<String, usize>>,
    containers: Mutex<Vec<Arc<MockContainer>>>,
    specs: Mutex<Vec<ContainerSpec>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockShared {
    fn record(&self, handle_id: &str, kind: MockEventKind) {
        lock(&self.events).push(MockEvent {
            handle_id: handle_id.to_string(),
            kind,
            at: Instant::now(),
        });
    }

    fn went_live(&self, handle_id: &str) {
        let mut live = lock(&self.live);
        let count = live.entry(handle_id.to_string()).or_insert(0);
        *count += 1;
        let mut max_live = lock(&self.max_live);
        let max = max_live.entry(handle_id.to_string()).or_insert(0);
        *max = (*max).max(*count);
    }

    fn went_down(&self, handle_id: &str) {
        if let Some(count) = lock(&self.live).get_mut(handle_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Factory for in-memory containers.
pub struct MockContainerFactory {
    container_ids: Vec<String>,
    start_delay: Duration,
    shared: Arc<MockShared>,
}

impl Default for MockContainerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockContainerFactory {
    /// Create a factory serving the container id `mock`.
    pub fn new() -> Self {
        Self::with_container_ids(vec!["mock".to_string()])
    }

    /// Create a factory serving the given container ids.
    pub fn with_container_ids(container_ids: Vec<String>) -> Self {
        Self {
            container_ids,
            start_delay: Duration::ZERO,
            shared: Arc::new(MockShared::default()),
        }
    }

    /// Make every start take `delay` before completing.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Make subsequent starts fail.
    pub fn set_fail_start(&self, fail: bool) {
        self.shared.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent stops fail.
    pub fn set_fail_stop(&self, fail: bool) {
        self.shared.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<MockEvent> {
        lock(&self.shared.events).clone()
    }

    /// Events recorded for one handle.
    pub fn events_for(&self, handle_id: &str) -> Vec<MockEvent> {
        lock(&self.shared.events)
            .iter()
            .filter(|event| event.handle_id == handle_id)
            .cloned()
            .collect()
    }

    /// Number of events of `kind` for one handle.
    pub fn count(&self, handle_id: &str, kind: MockEventKind) -> usize {
        lock(&self.shared.events)
            .iter()
            .filter(|event| event.handle_id == handle_id && event.kind == kind)
            .count()
    }

    /// Containers of `handle_id` currently live.
    pub fn live_count(&self, handle_id: &str) -> usize {
        lock(&self.shared.live).get(handle_id).copied().unwrap_or(0)
    }

    /// Largest number of containers of `handle_id` ever live at once.
    pub fn max_live(&self, handle_id: &str) -> usize {
        lock(&self.shared.max_live)
            .get(handle_id)
            .copied()
            .unwrap_or(0)
    }

    /// Spec of the most recent container created for `handle_id`.
    pub fn last_spec(&self, handle_id: &str) -> Option<ContainerSpec> {
        lock(&self.shared.specs)
            .iter()
            .rev()
            .find(|spec| spec.handle_id == handle_id)
            .cloned()
    }

    /// Number of containers created for `handle_id`.
    pub fn created_count(&self, handle_id: &str) -> usize {
        lock(&self.shared.specs)
            .iter()
            .filter(|spec| spec.handle_id == handle_id)
            .count()
    }

    /// Simulate the live container of `handle_id` dying on its own.
    ///
    /// Returns false when no container of that handle was running.
    pub fn crash(&self, handle_id: &str) -> bool {
        let container = lock(&self.shared.containers)
            .iter()
            .rev()
            .find(|c| c.handle_id == handle_id && c.state() == ContainerState::Started)
            .cloned();
        match container {
            Some(container) => {
                *lock(&container.state) = ContainerState::Stopped;
                self.shared.went_down(handle_id);
                self.shared.record(handle_id, MockEventKind::Crashed);
                true
            }
            None => false,
        }
    }
}

impl ContainerFactory for MockContainerFactory {
    fn container_ids(&self) -> Vec<String> {
        self.container_ids.clone()
    }

    fn create_container(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>> {
        if !self.supports(&spec.container_id) {
            return Err(ContainerError::UnknownContainer(spec.container_id));
        }
        let container = Arc::new(MockContainer {
            id: spec.container_id.clone(),
            handle_id: spec.handle_id.clone(),
            state: Mutex::new(ContainerState::Stopped),
            start_delay: self.start_delay,
            shared: self.shared.clone(),
        });
        lock(&self.shared.specs).push(spec);
        lock(&self.shared.containers).push(container.clone());
        Ok(container)
    }
}

/// In-memory container created by [`MockContainerFactory`].
pub struct MockContainer {
    id: String,
    handle_id: String,
    state: Mutex<ContainerState>,
    start_delay: Duration,
    shared: Arc<MockShared>,
}

#[async_trait]
impl Container for MockContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        *lock(&self.state) = ContainerState::Starting;
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }

        if self.shared.fail_start.load(Ordering::SeqCst) {
            *lock(&self.state) = ContainerState::Stopped;
            self.shared.record(&self.handle_id, MockEventKind::StartFailed);
            return Err(ContainerError::StartFailed(format!(
                "mock container for {} refused to start",
                self.handle_id
            )));
        }

        *lock(&self.state) = ContainerState::Started;
        self.shared.went_live(&self.handle_id);
        self.shared.record(&self.handle_id, MockEventKind::Started);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.shared.fail_stop.load(Ordering::SeqCst) {
            return Err(ContainerError::StopFailed(format!(
                "mock container for {} refused to stop",
                self.handle_id
            )));
        }

        let was_live = {
            let mut state = lock(&self.state);
            let was_live = *state == ContainerState::Started;
            *state = ContainerState::Stopped;
            was_live
        };
        if was_live {
            self.shared.went_down(&self.handle_id);
        }
        self.shared.record(&self.handle_id, MockEventKind::Stopped);
        Ok(())
    }

    fn state(&self) -> ContainerState {
        *lock(&self.state)
    }
}
