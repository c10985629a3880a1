// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hangar Daemon - Application Server Lifecycle Management Server
//!
//! An HTTP server responsible for:
//! - Handle lifecycle (start, restart, stop, status)
//! - Container installation from ZIP distributions
//! - Log tailing for container output and adapter logs
//! - Autostart reconciliation of crashed containers

use std::sync::Arc;
use tracing::{info, warn};

use hangar_daemon::config::Config;
use hangar_daemon::container::ProcessContainerFactory;
use hangar_daemon::runtime::DaemonRuntimeBuilder;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hangar_daemon=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        bind_addr = %config.bind_addr,
        home = %config.home.display(),
        container_ids = ?config.process_container_ids,
        "Starting Hangar daemon"
    );

    let factory = Arc::new(ProcessContainerFactory::new(
        config.process_container_ids.clone(),
    ));

    let runtime = DaemonRuntimeBuilder::from_config(&config)
        .container_factory(factory)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.local_addr(), "Hangar daemon ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Hangar daemon shut down");

    Ok(())
}
