// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for hangar-daemon integration tests.
//!
//! Provides TestContext for running a daemon over a temporary home with the
//! mock container adapter, plus an HTTP client pointed at it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hangar_daemon::container::MockContainerFactory;
use hangar_daemon::lifecycle::LifecycleManager;
use hangar_daemon::runtime::DaemonRuntime;

/// Daemon settings for a test.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub stop_start_delay: Duration,
    pub reconcile_initial_delay: Duration,
    pub reconcile_interval: Duration,
    pub max_upload_bytes: usize,
    pub mock_start_delay: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            stop_start_delay: Duration::from_millis(50),
            // Effectively off unless a test asks for it.
            reconcile_initial_delay: Duration::from_secs(3600),
            reconcile_interval: Duration::from_secs(3600),
            max_upload_bytes: 16 * 1024 * 1024,
            mock_start_delay: Duration::ZERO,
        }
    }
}

/// Test context that manages a daemon, its home directory and a client.
pub struct TestContext {
    pub factory: Arc<MockContainerFactory>,
    pub client: reqwest::Client,
    pub home: PathBuf,
    pub options: TestOptions,
    runtime: Option<DaemonRuntime>,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context with default options.
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    /// Create a context with the given options.
    pub async fn with_options(options: TestOptions) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let home = temp_dir.path().join("hangar");
        let factory =
            Arc::new(MockContainerFactory::new().with_start_delay(options.mock_start_delay));
        let runtime = start_runtime(&home, factory.clone(), &options).await;

        Self {
            factory,
            client: reqwest::Client::new(),
            home,
            options,
            runtime: Some(runtime),
            _temp_dir: temp_dir,
        }
    }

    fn runtime(&self) -> &DaemonRuntime {
        self.runtime.as_ref().expect("daemon is not running")
    }

    /// The lifecycle manager of the running daemon.
    pub fn manager(&self) -> &Arc<LifecycleManager> {
        self.runtime().manager()
    }

    /// URL of `path` on the running daemon.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.runtime().local_addr(), path)
    }

    /// Shut the daemon down and start a fresh one over the same home, as
    /// after a process restart.
    pub async fn restart_daemon(&mut self) {
        self.shutdown().await;
        let runtime = start_runtime(&self.home, self.factory.clone(), &self.options).await;
        self.runtime = Some(runtime);
    }

    /// Take the running daemon out of the context, e.g. to shut it down
    /// from another task.
    pub fn take_runtime(&mut self) -> DaemonRuntime {
        self.runtime.take().expect("daemon is not running")
    }

    /// Shut the daemon down.
    pub async fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await.expect("Failed to shut down daemon");
        }
    }

    /// POST a urlencoded start request.
    pub async fn start(&self, params: &[(&str, &str)]) -> reqwest::Response {
        self.client
            .post(self.url("/start"))
            .form(params)
            .send()
            .await
            .expect("start request failed")
    }

    /// GET `path` with query parameters.
    pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .expect("request failed")
    }

    /// Current `getHandles` result.
    pub async fn handles(&self) -> BTreeMap<String, String> {
        let body = self.get("/getHandles", &[]).await.text().await.unwrap();
        serde_json::from_str(&body).expect("getHandles did not return a JSON map")
    }

    /// Poll `getHandles` until `handle_id` reports `status` or `timeout`
    /// passes.
    pub async fn wait_for_status(&self, handle_id: &str, status: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.handles().await.get(handle_id).map(String::as_str) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// The persisted handle database file.
    pub fn database_file(&self) -> PathBuf {
        self.home.join("handle.properties")
    }
}

async fn start_runtime(
    home: &std::path::Path,
    factory: Arc<MockContainerFactory>,
    options: &TestOptions,
) -> DaemonRuntime {
    DaemonRuntime::builder()
        .home(home)
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .container_factory(factory)
        .stop_start_delay(options.stop_start_delay)
        .reconcile_initial_delay(options.reconcile_initial_delay)
        .reconcile_interval(options.reconcile_interval)
        .max_upload_bytes(options.max_upload_bytes)
        .build()
        .expect("Failed to build daemon runtime")
        .start()
        .await
        .expect("Failed to start daemon runtime")
}

/// Minimal start parameters for a mock container.
pub fn start_params(handle_id: &str) -> Vec<(&str, &str)> {
    vec![
        ("handleId", handle_id),
        ("containerId", "mock"),
        ("configurationType", "standalone"),
    ]
}
