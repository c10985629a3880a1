// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handles.
//!
//! A [`Handle`] is the daemon's record of one managed container: its durable
//! start parameters plus whatever is running for it right now. Lifecycle
//! operations on a handle hold its [`lock`](Handle::lock) for their whole
//! duration; status reads do not.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::container::{Configuration, Container, ContainerState};
use crate::properties::PropertyTable;

/// Property key holding the autostart flag.
pub const AUTOSTART_PROPERTY: &str = "autostart";

/// The live part of a handle: the container of its current run.
#[derive(Clone)]
pub struct Deployment {
    /// Container of the current run.
    pub container: Arc<dyn Container>,
    /// Configuration it was started with.
    pub configuration: Configuration,
    /// Container stdout/stderr capture file.
    pub output_path: PathBuf,
    /// Adapter log file.
    pub log_path: PathBuf,
}

/// One managed container.
pub struct Handle {
    id: String,
    lifecycle: Arc<Mutex<()>>,
    properties: RwLock<PropertyTable>,
    deployment: RwLock<Option<Deployment>>,
    force_stop: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl Handle {
    /// Create a handle with no properties.
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_properties(id, PropertyTable::new())
    }

    /// Create a handle from persisted properties.
    pub fn with_properties(id: impl Into<String>, properties: PropertyTable) -> Self {
        Self {
            id: id.into(),
            lifecycle: Arc::new(Mutex::new(())),
            properties: RwLock::new(properties),
            deployment: RwLock::new(None),
            force_stop: AtomicBool::new(false),
        }
    }

    /// Handle id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Acquire the per-handle lifecycle lock.
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.lifecycle.clone().lock_owned().await
    }

    /// Snapshot of the persisted properties.
    pub fn properties(&self) -> PropertyTable {
        read(&self.properties).clone()
    }

    /// Merge `properties` into the persisted ones.
    pub fn merge_properties(&self, properties: &PropertyTable) {
        write(&self.properties).merge(properties);
    }

    /// Whether the reconciler should keep this handle running.
    pub fn is_autostart(&self) -> bool {
        read(&self.properties).get_bool(AUTOSTART_PROPERTY)
    }

    /// Set the autostart flag.
    pub fn set_autostart(&self, autostart: bool) {
        write(&self.properties).insert(AUTOSTART_PROPERTY, autostart.to_string());
    }

    /// Whether the handle was stopped on request.
    pub fn is_force_stop(&self) -> bool {
        self.force_stop.load(Ordering::SeqCst)
    }

    /// Set or clear the stopped-on-request flag.
    pub fn set_force_stop(&self, force_stop: bool) {
        self.force_stop.store(force_stop, Ordering::SeqCst);
    }

    /// Current deployment, if any.
    pub fn deployment(&self) -> Option<Deployment> {
        read(&self.deployment).clone()
    }

    /// Install a new deployment, returning the previous one.
    pub fn replace_deployment(&self, deployment: Option<Deployment>) -> Option<Deployment> {
        std::mem::replace(&mut *write(&self.deployment), deployment)
    }

    /// Take the current deployment out of the handle.
    pub fn take_deployment(&self) -> Option<Deployment> {
        write(&self.deployment).take()
    }

    /// Live container state; `stopped` when nothing was ever deployed.
    pub fn status(&self) -> ContainerState {
        match self.deployment() {
            Some(deployment) => deployment.container.state(),
            None => ContainerState::Stopped,
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("autostart", &self.is_autostart())
            .field("force_stop", &self.is_force_stop())
            .finish()
    }
}
