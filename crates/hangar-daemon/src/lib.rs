// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Daemon - Application Server Lifecycle Management
//!
//! This crate runs a daemon that installs, configures, starts, stops and
//! supervises application-server containers on behalf of remote clients.
//! Each managed container is tracked as a *handle*: a caller-chosen id, the
//! parameters it was started with, and the container of its current run.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       HTTP clients / browser                      │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    hangar-daemon (This Crate)                     │
//! │                           Port 18000                              │
//! │  ┌────────────┐  ┌────────────┐  ┌────────────┐  ┌────────────┐  │
//! │  │   Server   │─▶│ Lifecycle  │◀─│ Reconciler │  │  Installer │  │
//! │  │   (axum)   │  │  Manager   │  └────────────┘  └────────────┘  │
//! │  └────────────┘  └─────┬──────┘                                  │
//! │                        │                                         │
//! │           ┌────────────┼────────────┐                            │
//! │           ▼            ▼            ▼                            │
//! │   ┌──────────────┐ ┌────────┐ ┌────────────┐                     │
//! │   │HandleDatabase│ │ Files  │ │ Container  │                     │
//! │   └──────────────┘ └────────┘ │  adapters  │                     │
//! │                               └────────────┘                     │
//! └──────────────────────────────────────────────────────────────────┘
//!                                 │ spawn
//!                                 ▼
//!                    ┌──────────────────────────┐
//!                    │  Application servers     │
//!                    └──────────────────────────┘
//! ```
//!
//! # HTTP Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `start` | Start a handle from parameters and uploads, replacing any running container |
//! | `restart` | Start a handle again from its persisted parameters |
//! | `stop` | Stop a handle, optionally deleting it |
//! | `getHandles` | Live status of every handle |
//! | `viewlog` / `viewcargolog` | Resumable reads of the output and adapter logs |
//! | `installed` | Whether a file was uploaded to the shared workspace |
//!
//! # Handle States
//!
//! ```text
//!   (absent) ──start──▶ STARTING ──▶ STARTED ──stop──▶ STOPPING ──▶ STOPPED
//!                           ▲                                          │
//!                           └──────── start / reconciler ──────────────┘
//! ```
//!
//! Handles with `autostart=true` are restarted by the reconciler whenever
//! they are found stopped, unless they were stopped on request.
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HANGAR_HOME` | `$HOME/.hangar` | Daemon home directory |
//! | `HANGAR_BIND_ADDR` | `0.0.0.0:18000` | HTTP listen address |
//! | `HANGAR_STOP_START_DELAY_MS` | `5000` | Pause between stopping and restarting a container |
//! | `HANGAR_RECONCILE_INITIAL_DELAY_SECS` | `3` | Delay before the first reconciliation pass |
//! | `HANGAR_RECONCILE_INTERVAL_SECS` | `20` | Reconciliation interval |
//! | `HANGAR_MAX_UPLOAD_BYTES` | `536870912` | Largest accepted request body |
//! | `HANGAR_FLUSH_ON_SHUTDOWN` | `true` | Write the handle database on shutdown |
//! | `HANGAR_STOP_ON_SHUTDOWN` | `true` | Stop live containers on shutdown |
//! | `HANGAR_PROCESS_CONTAINER_IDS` | `process` | Container ids served by the process adapter |
//!
//! # Modules
//!
//! - [`config`]: Daemon configuration from environment variables
//! - [`error`]: Error types for daemon operations
//! - [`properties`]: Property tables and the `.properties` codec
//! - [`handle`]: Handle state
//! - [`handle_database`]: Concurrent handle registry and its persistence
//! - [`file_manager`]: Daemon home layout and workspace files
//! - [`container`]: Container adapter contract and adapters
//! - [`installer`]: ZIP distribution installer
//! - [`request`]: Start request parsing and validation
//! - [`log_tail`]: Resumable log reads
//! - [`lifecycle`]: Start, stop and reconciliation of handles
//! - [`reconciler`]: Background autostart loop
//! - [`server`]: HTTP command surface
//! - [`runtime`]: Embeddable daemon runtime

#![deny(missing_docs)]

/// Daemon configuration loaded from environment variables.
pub mod config;

/// Error types for daemon operations.
pub mod error;

/// Property tables and the `.properties` codec.
pub mod properties;

/// Handle state.
pub mod handle;

/// Concurrent handle registry and its persistence.
pub mod handle_database;

/// Daemon home layout and workspace files.
pub mod file_manager;

/// Container adapter contract and adapters (process, mock).
pub mod container;

/// ZIP distribution installer.
pub mod installer;

/// Start request parsing and validation.
pub mod request;

/// Resumable log reads.
pub mod log_tail;

/// Start, stop and reconciliation of handles.
pub mod lifecycle;

/// Background autostart loop.
pub mod reconciler;

/// HTTP command surface.
pub mod server;

/// Embeddable daemon runtime.
pub mod runtime;

pub use config::Config;
pub use error::Error;
