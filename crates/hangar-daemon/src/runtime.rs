// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for hangar-daemon.
//!
//! [`DaemonRuntime`] wires the handle database, the lifecycle manager, the
//! reconciler and the HTTP server together, so the daemon can run inside an
//! existing tokio application (and inside tests).
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hangar_daemon::container::ProcessContainerFactory;
//! use hangar_daemon::runtime::DaemonRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = DaemonRuntime::builder()
//!         .home("/var/lib/hangar")
//!         .container_factory(Arc::new(ProcessContainerFactory::new(vec!["process".into()])))
//!         .bind_addr("0.0.0.0:18000".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::container::ContainerFactory;
use crate::file_manager::FileManager;
use crate::handle_database::HandleDatabase;
use crate::installer::{Installer, ZipInstaller};
use crate::lifecycle::{DEFAULT_STOP_START_DELAY, LifecycleManager};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::server;

/// Builder for creating a [`DaemonRuntime`].
pub struct DaemonRuntimeBuilder {
    home: PathBuf,
    bind_addr: SocketAddr,
    container_factory: Option<Arc<dyn ContainerFactory>>,
    installer: Option<Arc<dyn Installer>>,
    stop_start_delay: Duration,
    reconcile_initial_delay: Duration,
    reconcile_interval: Duration,
    max_upload_bytes: usize,
    flush_on_shutdown: bool,
    stop_on_shutdown: bool,
}

impl Default for DaemonRuntimeBuilder {
    fn default() -> Self {
        let reconciler = ReconcilerConfig::default();
        Self {
            home: PathBuf::from(".hangar"),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 18000)),
            container_factory: None,
            installer: None,
            stop_start_delay: DEFAULT_STOP_START_DELAY,
            reconcile_initial_delay: reconciler.initial_delay,
            reconcile_interval: reconciler.interval,
            max_upload_bytes: 512 * 1024 * 1024,
            flush_on_shutdown: true,
            stop_on_shutdown: true,
        }
    }
}

impl DaemonRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder from loaded configuration. The container factory
    /// still has to be set.
    pub fn from_config(config: &Config) -> Self {
        Self {
            home: config.home.clone(),
            bind_addr: config.bind_addr,
            container_factory: None,
            installer: None,
            stop_start_delay: config.stop_start_delay,
            reconcile_initial_delay: config.reconcile_initial_delay,
            reconcile_interval: config.reconcile_interval,
            max_upload_bytes: config.max_upload_bytes,
            flush_on_shutdown: config.flush_on_shutdown,
            stop_on_shutdown: config.stop_on_shutdown,
        }
    }

    /// Set the daemon home directory.
    ///
    /// Default: `.hangar`
    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    /// Set the HTTP bind address. Port 0 picks a free port; see
    /// [`DaemonRuntime::local_addr`].
    ///
    /// Default: `0.0.0.0:18000`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the container factory (required).
    pub fn container_factory(mut self, factory: Arc<dyn ContainerFactory>) -> Self {
        self.container_factory = Some(factory);
        self
    }

    /// Set the installer.
    ///
    /// Default: [`ZipInstaller`] over `<home>/installs`
    pub fn installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Set the pause between stopping a container and starting its
    /// replacement.
    ///
    /// Default: 5 seconds
    pub fn stop_start_delay(mut self, delay: Duration) -> Self {
        self.stop_start_delay = delay;
        self
    }

    /// Set the delay before the first reconciliation pass.
    ///
    /// Default: 3 seconds
    pub fn reconcile_initial_delay(mut self, delay: Duration) -> Self {
        self.reconcile_initial_delay = delay;
        self
    }

    /// Set the reconciliation interval.
    ///
    /// Default: 20 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Set the largest accepted request body.
    ///
    /// Default: 512 MiB
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    /// Write the handle database once more on shutdown.
    ///
    /// Default: `true`
    pub fn flush_on_shutdown(mut self, flush: bool) -> Self {
        self.flush_on_shutdown = flush;
        self
    }

    /// Stop live containers on shutdown.
    ///
    /// Default: `true`
    pub fn stop_on_shutdown(mut self, stop: bool) -> Self {
        self.stop_on_shutdown = stop;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<DaemonRuntimeConfig> {
        let container_factory = self
            .container_factory
            .ok_or_else(|| anyhow::anyhow!("container_factory is required"))?;
        if self.reconcile_interval.is_zero() {
            anyhow::bail!("reconcile_interval must be greater than zero");
        }

        Ok(DaemonRuntimeConfig {
            home: self.home,
            bind_addr: self.bind_addr,
            container_factory,
            installer: self.installer,
            stop_start_delay: self.stop_start_delay,
            reconciler: ReconcilerConfig {
                initial_delay: self.reconcile_initial_delay,
                interval: self.reconcile_interval,
            },
            max_upload_bytes: self.max_upload_bytes,
            flush_on_shutdown: self.flush_on_shutdown,
            stop_on_shutdown: self.stop_on_shutdown,
        })
    }
}

/// Configuration for a [`DaemonRuntime`].
pub struct DaemonRuntimeConfig {
    home: PathBuf,
    bind_addr: SocketAddr,
    container_factory: Arc<dyn ContainerFactory>,
    installer: Option<Arc<dyn Installer>>,
    stop_start_delay: Duration,
    reconciler: ReconcilerConfig,
    max_upload_bytes: usize,
    flush_on_shutdown: bool,
    stop_on_shutdown: bool,
}

impl DaemonRuntimeConfig {
    /// Start the runtime: load the handle database, spawn the reconciler and
    /// the HTTP server.
    pub async fn start(self) -> Result<DaemonRuntime> {
        let files = Arc::new(FileManager::new(&self.home));
        files.init().await?;

        // An unreadable database is not fatal.
        let handles = match files.load_handle_database().await {
            Ok(db) => db,
            Err(e) => {
                warn!(
                    path = %files.handle_database_file().display(),
                    error = %e,
                    "Failed to load handle database; starting empty"
                );
                HandleDatabase::new()
            }
        };

        let installer: Arc<dyn Installer> = match self.installer {
            Some(installer) => installer,
            None => Arc::new(ZipInstaller::new(files.install_dir())?),
        };

        let manager = Arc::new(
            LifecycleManager::new(
                Arc::new(handles),
                files.clone(),
                self.container_factory,
                installer,
            )
            .with_stop_start_delay(self.stop_start_delay),
        );

        let reconciler = Reconciler::new(manager.clone(), self.reconciler);
        let reconciler_shutdown = reconciler.shutdown_handle();
        let reconciler_handle = tokio::spawn(async move {
            reconciler.run().await;
        });

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (server_shutdown_tx, server_shutdown_rx) = watch::channel(false);
        let router = server::router(manager.clone(), self.max_upload_bytes);
        let server_handle = tokio::spawn(server::serve(listener, router, server_shutdown_rx));

        info!(
            bind_addr = %local_addr,
            home = %self.home.display(),
            handles = manager.handles().len(),
            "DaemonRuntime started"
        );

        Ok(DaemonRuntime {
            server_handle,
            reconciler_handle,
            server_shutdown_tx,
            reconciler_shutdown,
            manager,
            local_addr,
            flush_on_shutdown: self.flush_on_shutdown,
            stop_on_shutdown: self.stop_on_shutdown,
        })
    }
}

/// A running hangar daemon.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct DaemonRuntime {
    server_handle: JoinHandle<Result<()>>,
    reconciler_handle: JoinHandle<()>,
    server_shutdown_tx: watch::Sender<bool>,
    reconciler_shutdown: Arc<Notify>,
    manager: Arc<LifecycleManager>,
    local_addr: SocketAddr,
    flush_on_shutdown: bool,
    stop_on_shutdown: bool,
}

impl DaemonRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> DaemonRuntimeBuilder {
        DaemonRuntimeBuilder::new()
    }

    /// Address the HTTP server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The lifecycle manager, for in-process callers.
    pub fn manager(&self) -> &Arc<LifecycleManager> {
        &self.manager
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the reconciler, then drains the HTTP server, then stops live
    /// containers and writes the database (when configured). Containers
    /// started by requests that were in flight are stopped as well.
    pub async fn shutdown(self) -> Result<()> {
        info!("DaemonRuntime shutting down...");

        self.reconciler_shutdown.notify_one();
        if let Err(e) = self.reconciler_handle.await {
            error!("Reconciler task panicked: {}", e);
        }

        let _ = self.server_shutdown_tx.send(true);
        let server_result = match self.server_handle.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!("DaemonRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("DaemonRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        };

        if self.stop_on_shutdown {
            self.manager.stop_all().await;
        }
        if self.flush_on_shutdown
            && let Err(e) = self.manager.persist().await
        {
            error!(error = %e, "Failed to write handle database on shutdown");
        }

        if server_result.is_ok() {
            info!("DaemonRuntime shutdown complete");
        }
        server_result
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished() && !self.reconciler_handle.is_finished()
    }
}
