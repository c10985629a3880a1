// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP command surface.
//!
//! | Path | Method | Parameters | Response |
//! |------|--------|------------|----------|
//! | `/start` | POST | start parameters, upload parts | `OK - STARTED` |
//! | `/restart` | GET/POST | `handleId` | `OK - STARTED` |
//! | `/stop` | GET/POST | `handleId`, `deleteContainer` | `OK - STOPPED` |
//! | `/getHandles` | GET | | JSON map of handle id to status |
//! | `/viewlog` | GET | `handleId`, `offset` | container output chunk |
//! | `/viewcargolog` | GET | `handleId`, `offset` | adapter log chunk |
//! | `/installed` | GET | `file` | `OK - INSTALLED` / `OK - NOTEXIST` |
//! | `/`, `/index.html` | GET | | status page |
//!
//! Parameters are accepted from the query string, a urlencoded form body,
//! or (for `/start`) a multipart body. Every failure is a 500 whose body is
//! the error text.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::container::ContainerState;
use crate::error::{Error, Result};
use crate::lifecycle::{LifecycleManager, LogKind};
use crate::log_tail;
use crate::request::{StartRequest, parts};

/// Response header (`X-Text-Size`) carrying the offset to resume a log read
/// from.
pub const TEXT_SIZE_HEADER: &str = "x-text-size";

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        error!(error = %self, "Request failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Build the router over `manager`.
pub fn router(manager: Arc<LifecycleManager>, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/index.html", get(index))
        .route("/start", post(start))
        .route("/restart", get(restart).post(restart))
        .route("/stop", get(stop).post(stop))
        .route("/getHandles", get(get_handles))
        .route("/viewlog", get(view_log))
        .route("/viewcargolog", get(view_cargo_log))
        .route("/installed", get(installed))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(manager)
}

/// Serve `router` on `listener` until `shutdown_rx` turns true.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "HTTP server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
            info!("HTTP server received shutdown signal");
        })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

async fn index(State(manager): State<Arc<LifecycleManager>>) -> Html<String> {
    Html(manager.index_page())
}

async fn start(
    State(manager): State<Arc<LifecycleManager>>,
    request: Request,
) -> Result<&'static str> {
    let start = if is_multipart(&request) {
        multipart_request(request).await?
    } else {
        let mut start = StartRequest::new();
        for (name, value) in form_pairs(request).await? {
            start.insert_parameter(&name, &value)?;
        }
        start
    };
    manager.start(start).await?;
    Ok("OK - STARTED")
}

async fn restart(
    State(manager): State<Arc<LifecycleManager>>,
    request: Request,
) -> Result<&'static str> {
    let params = form_map(request).await?;
    let handle_id = required(&params, "handleId")?;
    manager.restart(handle_id).await?;
    Ok("OK - STARTED")
}

async fn stop(
    State(manager): State<Arc<LifecycleManager>>,
    request: Request,
) -> Result<&'static str> {
    let params = form_map(request).await?;
    let handle_id = required(&params, "handleId")?;
    let delete = params
        .get("deleteContainer")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
    manager.stop(handle_id, delete).await?;
    Ok("OK - STOPPED")
}

async fn get_handles(
    State(manager): State<Arc<LifecycleManager>>,
) -> Json<BTreeMap<String, ContainerState>> {
    Json(manager.statuses())
}

async fn view_log(
    State(manager): State<Arc<LifecycleManager>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    log_response(&manager, &params, LogKind::Output).await
}

async fn view_cargo_log(
    State(manager): State<Arc<LifecycleManager>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response> {
    log_response(&manager, &params, LogKind::Adapter).await
}

async fn installed(
    State(manager): State<Arc<LifecycleManager>>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<&'static str> {
    let file = required(&params, "file")?;
    Ok(if manager.is_installed(file).await {
        "OK - INSTALLED"
    } else {
        "OK - NOTEXIST"
    })
}

async fn log_response(
    manager: &LifecycleManager,
    params: &BTreeMap<String, String>,
    kind: LogKind,
) -> Result<Response> {
    let handle_id = required(params, "handleId")?;
    let offset = match params.get("offset").map(|v| v.trim()).filter(|v| !v.is_empty()) {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| Error::invalid("offset", format!("'{}' is not a byte offset", raw)))?,
        ),
        None => None,
    };

    let chunk = manager.tail_log(handle_id, kind, offset).await?;
    let mut body = Vec::with_capacity(chunk.data.len() + log_tail::LOG_HEADER_MIN_BYTES);
    if offset.is_none() {
        body.extend_from_slice(log_tail::log_header(handle_id, Utc::now()).as_bytes());
    }
    body.extend_from_slice(&chunk.data);

    let mut response = Response::new(Body::from(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(TEXT_SIZE_HEADER, HeaderValue::from(chunk.next_offset));
    Ok(response)
}

fn is_multipart(request: &Request) -> bool {
    request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

fn is_upload_part(name: &str) -> bool {
    name == parts::INSTALLER_ZIP
        || [
            parts::CONFIGURATION_FILE,
            parts::DEPLOYABLE_FILE,
            parts::EXTRA_FILE,
            parts::SHARED_FILE,
        ]
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

async fn multipart_request(request: Request) -> Result<StartRequest> {
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| Error::Other(format!("Malformed multipart request: {}", e)))?;

    let mut start = StartRequest::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Other(format!("Malformed multipart request: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if is_upload_part(&name) {
            let data = field
                .bytes()
                .await
                .map_err(|e| Error::Other(format!("Failed to read part {}: {}", name, e)))?;
            start.insert_file(name, data);
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| Error::Other(format!("Failed to read part {}: {}", name, e)))?;
            start.insert_parameter(&name, &value)?;
        }
    }
    Ok(start)
}

/// Parameters from the query string followed by a urlencoded body.
async fn form_pairs(request: Request) -> Result<Vec<(String, String)>> {
    let Query(mut pairs) = Query::<Vec<(String, String)>>::try_from_uri(request.uri())
        .map_err(|e| Error::Other(format!("Malformed query string: {}", e)))?;

    let urlencoded = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    if request.method() != Method::GET && urlencoded {
        let Form(body) = Form::<Vec<(String, String)>>::from_request(request, &())
            .await
            .map_err(|e| Error::Other(format!("Malformed form body: {}", e)))?;
        pairs.extend(body);
    }
    Ok(pairs)
}

async fn form_map(request: Request) -> Result<BTreeMap<String, String>> {
    Ok(form_pairs(request).await?.into_iter().collect())
}

fn required<'a>(params: &'a BTreeMap<String, String>, name: &str) -> Result<&'a str> {
    params
        .get(name)
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::MissingParameter(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_parts() {
        assert!(is_upload_part("installerZipFileData"));
        assert!(is_upload_part("deployableFileData_0"));
        assert!(is_upload_part("sharedFileData_12"));
        assert!(!is_upload_part("deployableFiles"));
        assert!(!is_upload_part("handleId"));
    }

    #[test]
    fn test_required() {
        let mut params = BTreeMap::new();
        params.insert("handleId".to_string(), String::new());
        assert_eq!(
            required(&params, "handleId").unwrap_err().to_string(),
            "Parameter handleId is required."
        );
        params.insert("handleId".to_string(), "h1".to_string());
        assert_eq!(required(&params, "handleId").unwrap(), "h1");
    }

    #[test]
    fn test_error_is_plain_500() {
        let response = Error::HandleNotFound("h1".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }
}
