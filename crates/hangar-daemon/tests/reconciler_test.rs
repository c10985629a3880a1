// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconciliation tests: autostart handles come back after crashes and
//! daemon restarts, stopped or non-autostart handles stay down.

mod common;

use std::time::Duration;

use common::{TestContext, TestOptions, start_params};
use hangar_daemon::container::MockEventKind;

fn fast_reconcile() -> TestOptions {
    TestOptions {
        stop_start_delay: Duration::from_millis(10),
        reconcile_initial_delay: Duration::from_millis(50),
        reconcile_interval: Duration::from_millis(100),
        ..TestOptions::default()
    }
}

fn autostart_params(handle_id: &str) -> Vec<(&str, &str)> {
    let mut params = start_params(handle_id);
    params.push(("autostart", "true"));
    params
}

#[tokio::test]
async fn test_crashed_autostart_handle_is_restarted() {
    let ctx = TestContext::with_options(fast_reconcile()).await;
    ctx.start(&autostart_params("h1")).await;

    assert!(ctx.factory.crash("h1"));
    assert!(
        ctx.wait_for_status("h1", "started", Duration::from_secs(5))
            .await
    );
    assert_eq!(ctx.factory.count("h1", MockEventKind::Started), 2);
    assert_eq!(ctx.factory.max_live("h1"), 1);
}

#[tokio::test]
async fn test_stopped_handle_is_not_restarted() {
    let ctx = TestContext::with_options(fast_reconcile()).await;
    ctx.start(&autostart_params("h1")).await;

    let response = ctx.get("/stop", &[("handleId", "h1")]).await;
    assert_eq!(response.text().await.unwrap(), "OK - STOPPED");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        ctx.handles().await.get("h1").map(String::as_str),
        Some("stopped")
    );
    assert_eq!(ctx.factory.count("h1", MockEventKind::Started), 1);
}

#[tokio::test]
async fn test_handle_without_autostart_is_not_restarted() {
    let ctx = TestContext::with_options(fast_reconcile()).await;
    ctx.start(&start_params("h1")).await;

    assert!(ctx.factory.crash("h1"));
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        ctx.handles().await.get("h1").map(String::as_str),
        Some("stopped")
    );
    assert_eq!(ctx.factory.count("h1", MockEventKind::Started), 1);
}

#[tokio::test]
async fn test_autostart_handle_comes_back_after_daemon_restart() {
    let mut ctx = TestContext::with_options(fast_reconcile()).await;
    ctx.start(&autostart_params("h1")).await;
    ctx.start(&start_params("h2")).await;

    ctx.restart_daemon().await;

    assert!(
        ctx.wait_for_status("h1", "started", Duration::from_secs(5))
            .await
    );
    assert_eq!(
        ctx.handles().await.get("h2").map(String::as_str),
        Some("stopped")
    );
}

#[tokio::test]
async fn test_explicit_start_clears_stop_request() {
    let ctx = TestContext::new().await;
    let manager = ctx.manager();
    ctx.start(&autostart_params("h1")).await;
    ctx.get("/stop", &[("handleId", "h1")]).await;
    assert_eq!(manager.reconcile().await, 0);

    // A replayed start clears the stop request, so a later crash is healed.
    let response = ctx.start(&[("handleId", "h1")]).await;
    assert_eq!(response.text().await.unwrap(), "OK - STARTED");
    assert!(ctx.factory.crash("h1"));
    assert_eq!(manager.reconcile().await, 1);
    assert_eq!(ctx.factory.live_count("h1"), 1);
}

#[tokio::test]
async fn test_failed_restart_is_retried() {
    let ctx = TestContext::new().await;
    let manager = ctx.manager();
    ctx.start(&autostart_params("h1")).await;
    assert!(ctx.factory.crash("h1"));

    ctx.factory.set_fail_start(true);
    assert_eq!(manager.reconcile().await, 0);
    assert_eq!(ctx.factory.count("h1", MockEventKind::StartFailed), 1);

    ctx.factory.set_fail_start(false);
    assert_eq!(manager.reconcile().await, 1);
    assert_eq!(
        ctx.handles().await.get("h1").map(String::as_str),
        Some("started")
    );
}
