//! HTTP listener
//!
//! A single fallback route forwards every method and path. Header hygiene
//! happens here: hop-by-hop request headers and `host` stay local, and the
//! framing headers of the remote response are replaced by our own since the
//! executor returns the decoded body.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use jt_protocol::HttpResponse;

use super::{ForwardedRequest, HttpGateway, RequestFailure};

/// Request headers never forwarded to the executor
const DROPPED_REQUEST_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Response headers never copied back to the client
const DROPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "content-length",
    "transfer-encoding",
    "connection",
];

/// Build the router for the HTTP listener
pub fn router(gateway: Arc<HttpGateway>) -> Router {
    let limit = gateway.max_body_size();
    Router::new()
        .fallback(forward)
        .layer(DefaultBodyLimit::max(limit))
        .with_state(gateway)
}

/// Serve HTTP until `cancel` fires
pub async fn serve_http(listener: TcpListener, gateway: Arc<HttpGateway>, cancel: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!("HTTP listener on {}", addr),
        Err(e) => tracing::warn!("HTTP listener address unavailable: {}", e),
    }

    let shutdown = async move { cancel.cancelled().await };
    if let Err(e) = axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!("HTTP listener failed: {}", e);
    }
    tracing::info!("HTTP listener shutting down");
}

async fn forward(
    State(gateway): State<Arc<HttpGateway>>,
    method: Method,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = ForwardedRequest {
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        headers: forwarded_headers(&headers),
        body,
        query,
    };

    match gateway.exchange(request).await {
        Ok(response) => client_response(response),
        Err(failure) => failure_response(&failure),
    }
}

/// Flatten request headers, dropping the ones that stay local
fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut forwarded: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if DROPPED_REQUEST_HEADERS.contains(&name) {
            continue;
        }
        let Ok(value) = value.to_str() else {
            tracing::debug!("Skipping non-text request header {}", name);
            continue;
        };
        forwarded
            .entry(name.to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }
    forwarded
}

/// Turn an executor response into the client response
fn client_response(response: HttpResponse) -> Response {
    let Ok(status) = StatusCode::from_u16(response.status_code) else {
        tracing::warn!("Executor returned invalid status {}", response.status_code);
        return json_error(
            StatusCode::BAD_GATEWAY,
            "Executor returned an invalid response",
            "INVALID_RESPONSE",
        );
    };

    let mut builder = axum::http::Response::builder().status(status);
    for (name, value) in &response.headers {
        if DROPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => tracing::debug!("Skipping invalid response header {}", name),
        }
    }

    builder.body(Body::from(response.body)).unwrap_or_else(|e| {
        tracing::warn!("Failed to build response: {}", e);
        json_error(
            StatusCode::BAD_GATEWAY,
            "Executor returned an invalid response",
            "INVALID_RESPONSE",
        )
    })
}

fn failure_response(failure: &RequestFailure) -> Response {
    json_error(failure.status(), failure.message(), failure.code())
}

fn json_error(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({ "error": message, "code": code }))).into_response()
}
