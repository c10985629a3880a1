// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle tests: replacement ordering, mutual exclusion and persistence
//! across daemon restarts.

mod common;

use std::time::Duration;

use common::{TestContext, TestOptions, start_params};
use hangar_daemon::container::{ContainerState, MockEventKind};
use hangar_daemon::request::StartRequest;

fn start_request(handle_id: &str) -> StartRequest {
    let mut request = StartRequest::new();
    for (name, value) in start_params(handle_id) {
        request.insert_parameter(name, value).unwrap();
    }
    request
}

#[tokio::test]
async fn test_second_start_stops_before_starting() {
    let ctx = TestContext::with_options(TestOptions {
        stop_start_delay: Duration::from_millis(300),
        ..TestOptions::default()
    })
    .await;

    ctx.start(&start_params("h1")).await;
    let other_home = ctx.home.join("other-conf");
    let mut params = start_params("h1");
    params.push(("configurationHome", other_home.to_str().unwrap()));
    let response = ctx.start(&params).await;
    assert_eq!(response.text().await.unwrap(), "OK - STARTED");

    let events = ctx.factory.events_for("h1");
    let kinds: Vec<MockEventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MockEventKind::Started,
            MockEventKind::Stopped,
            MockEventKind::Started
        ]
    );
    let gap = events[2].at.duration_since(events[1].at);
    assert!(gap >= Duration::from_millis(300), "gap was {:?}", gap);

    let handles = ctx.handles().await;
    assert_eq!(handles.len(), 1);
    assert_eq!(handles.get("h1").map(String::as_str), Some("started"));
    assert_eq!(
        ctx.factory.last_spec("h1").unwrap().configuration.home,
        other_home
    );
    assert_eq!(ctx.factory.max_live("h1"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_and_stops_never_overlap() {
    let ctx = TestContext::with_options(TestOptions {
        stop_start_delay: Duration::from_millis(5),
        ..TestOptions::default()
    })
    .await;
    let manager = ctx.manager().clone();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            if i % 3 == 2 {
                manager.stop("h1", false).await.map(|_| ())
            } else {
                manager.start(start_request("h1")).await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(ctx.factory.max_live("h1"), 1);
    assert!(ctx.factory.live_count("h1") <= 1);
    assert_eq!(manager.handles().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_different_handles_start_in_parallel() {
    let ctx = TestContext::new().await;
    let manager = ctx.manager().clone();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.start(start_request(&format!("h{}", i))).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let statuses = manager.statuses();
    assert_eq!(statuses.len(), 8);
    assert!(statuses.values().all(|s| *s == ContainerState::Started));
}

#[tokio::test]
async fn test_parameters_survive_daemon_restart() {
    let mut ctx = TestContext::new().await;

    let mut params = start_params("h1");
    params.extend([
        ("autostart", "true"),
        ("containerProperties", r#"{"cargo.servlet.port": "8080"}"#),
        ("deployableFiles", r#"[{"filename": "app.war", "context": "/a=b"}]"#),
        ("extraClasspath", r#"["lib/a.jar", "lib/b.jar"]"#),
        ("jvmArgs", "-Dgreeting=\"héllo wörld\""),
    ]);
    // The deployable has to exist for the start to succeed.
    tokio::fs::create_dir_all(ctx.home.join("workspace/h1"))
        .await
        .unwrap();
    tokio::fs::write(ctx.home.join("workspace/h1/app.war"), b"war")
        .await
        .unwrap();
    assert_eq!(ctx.start(&params).await.text().await.unwrap(), "OK - STARTED");
    let before = ctx.manager().handles().get("h1").unwrap().properties();

    ctx.restart_daemon().await;

    let after = ctx.manager().handles().get("h1").unwrap().properties();
    assert_eq!(before, after);
    assert_eq!(after.get("jvmArgs"), Some("-Dgreeting=\"héllo wörld\""));
    assert_eq!(after.get_list("extraClasspath"), vec!["lib/a.jar", "lib/b.jar"]);
    assert_eq!(
        after
            .get_table("containerProperties")
            .and_then(|t| t.get("cargo.servlet.port")),
        Some("8080")
    );
    // Live containers are not persisted.
    assert_eq!(
        ctx.handles().await.get("h1").map(String::as_str),
        Some("stopped")
    );
}

#[tokio::test]
async fn test_delete_survives_daemon_restart() {
    let mut ctx = TestContext::new().await;
    ctx.start(&start_params("h1")).await;
    ctx.start(&start_params("h2")).await;

    let response = ctx
        .get("/stop", &[("handleId", "h1"), ("deleteContainer", "true")])
        .await;
    assert_eq!(response.text().await.unwrap(), "OK - STOPPED");
    assert!(ctx.handles().await.get("h1").is_none());

    ctx.restart_daemon().await;
    let handles = ctx.handles().await;
    assert!(handles.get("h1").is_none());
    assert!(handles.contains_key("h2"));
}

#[tokio::test]
async fn test_corrupt_database_record_loads_empty() {
    let mut ctx = TestContext::new().await;
    ctx.shutdown().await;

    tokio::fs::write(
        ctx.database_file(),
        "#hangar handle database\nbroken=not json\n",
    )
    .await
    .unwrap();
    ctx.restart_daemon().await;

    let handle = ctx.manager().handles().get("broken").unwrap();
    assert!(handle.properties().is_empty());
    assert!(!handle.is_autostart());
}

#[tokio::test]
async fn test_unreadable_database_starts_empty() {
    let mut ctx = TestContext::new().await;
    ctx.shutdown().await;

    tokio::fs::write(ctx.database_file(), "h1=\\uZZZZ\n")
        .await
        .unwrap();
    ctx.restart_daemon().await;
    assert!(ctx.manager().handles().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_live_containers() {
    let mut ctx = TestContext::new().await;
    ctx.start(&start_params("h1")).await;
    assert_eq!(ctx.factory.live_count("h1"), 1);

    ctx.shutdown().await;
    assert_eq!(ctx.factory.live_count("h1"), 0);
    assert_eq!(ctx.factory.count("h1", MockEventKind::Stopped), 1);
}

#[tokio::test]
async fn test_starts_during_shutdown_do_not_outlive_daemon() {
    let mut ctx = TestContext::with_options(TestOptions {
        mock_start_delay: Duration::from_millis(400),
        ..TestOptions::default()
    })
    .await;
    let url = ctx.url("/start");

    let client = ctx.client.clone();
    let in_flight_url = url.clone();
    let in_flight = tokio::spawn(async move {
        client
            .post(in_flight_url)
            .form(&start_params("h1"))
            .send()
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let shutdown = tokio::spawn(ctx.take_runtime().shutdown());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Refused or answered, either way nothing may be left running.
    let _ = reqwest::Client::new()
        .post(&url)
        .form(&start_params("h2"))
        .timeout(Duration::from_secs(5))
        .send()
        .await;

    shutdown.await.unwrap().unwrap();
    let _ = in_flight.await.unwrap();
    assert_eq!(ctx.factory.live_count("h1"), 0);
    assert_eq!(ctx.factory.live_count("h2"), 0);
}
