// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Autostart reconciliation.
//!
//! Periodically restarts handles that have autostart set, were not stopped
//! on request, and whose container is found stopped (crashed, killed, or
//! never started since the daemon came up).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::lifecycle::LifecycleManager;

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Delay before the first pass
    pub initial_delay: Duration,
    /// Time between passes
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(3),
            interval: Duration::from_secs(20),
        }
    }
}

/// Reconciler that runs as a background task.
pub struct Reconciler {
    manager: Arc<LifecycleManager>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(manager: Arc<LifecycleManager>, config: ReconcilerConfig) -> Self {
        Self {
            manager,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    ///
    /// A pass that overruns the interval delays the next one instead of
    /// queueing extra passes.
    pub async fn run(self) {
        info!(
            initial_delay_ms = self.config.initial_delay.as_millis() as u64,
            interval_secs = self.config.interval.as_secs(),
            "Reconciler started"
        );

        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.initial_delay,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Reconciler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let restarted = self.manager.reconcile().await;
                    if restarted > 0 {
                        info!(restarted, "Reconciliation pass restarted handles");
                    } else {
                        debug!("Reconciliation pass found nothing to do");
                    }
                }
            }
        }
    }
}
