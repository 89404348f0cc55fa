//! HTTP router tests
//!
//! Exercises the request router in-process with `tower::ServiceExt::oneshot`,
//! answering forwarded calls directly through the gateway.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use tower::ServiceExt;

use jt_core::memory::{memory_channel, ExecutorEndpoint};
use jt_gateway::channel::{ChannelAdapter, ChannelEvents};
use jt_gateway::http::{router, HttpGateway};
use jt_protocol::{ExecutorCommand, HttpCall, HttpResponse};

struct Harness {
    gateway: Arc<HttpGateway>,
    executor: Option<ExecutorEndpoint>,
    _events: ChannelEvents,
}

async fn harness(max_body_size: usize) -> Harness {
    let (factory, executor) = memory_channel();
    let (channel, events) = ChannelAdapter::open(&factory, 16).await.unwrap();
    let gateway = Arc::new(HttpGateway::new(
        channel,
        Duration::from_secs(5),
        max_body_size,
    ));
    Harness {
        gateway,
        executor: Some(executor),
        _events: events,
    }
}

/// Answer the next forwarded call with `respond` and return the call
fn answer_next(
    harness: &mut Harness,
    respond: impl FnOnce(&HttpCall) -> HttpResponse + Send + 'static,
) -> tokio::task::JoinHandle<HttpCall> {
    let gateway = harness.gateway.clone();
    let mut executor = harness.executor.take().expect("executor already answering");
    tokio::spawn(async move {
        let call = match executor.next_command().await {
            Some(ExecutorCommand::HttpCall(call)) => call,
            other => panic!("Expected httpCall, got {:?}", other),
        };
        assert!(gateway.resolve(call.id, respond(&call)));
        call
    })
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_query_and_headers_forwarded() {
    let mut harness = harness(1024).await;
    let executor = answer_next(&mut harness, |_| HttpResponse {
        status_code: 200,
        headers: BTreeMap::from([("X-Remote".to_string(), "yes".to_string())]),
        body: Bytes::from_static(b"done"),
    });

    let request = Request::builder()
        .method("PUT")
        .uri("/items/7?b=2&a=1&b=3")
        .header("x-tag", "one")
        .header("x-tag", "two")
        .header("connection", "keep-alive")
        .body(Body::from("payload"))
        .unwrap();
    let response = router(harness.gateway.clone())
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-remote"], "yes");
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"done");

    let call = executor.await.unwrap();
    assert_eq!(call.method, "PUT");
    assert_eq!(call.path, "/items/7");
    assert_eq!(
        call.query,
        vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "3".to_string()),
        ]
    );
    assert_eq!(call.headers.get("x-tag").map(String::as_str), Some("one, two"));
    assert!(!call.headers.contains_key("connection"));
    assert_eq!(call.body, Bytes::from_static(b"payload"));
    assert_eq!(harness.gateway.pending_requests(), 0);
}

#[tokio::test]
async fn test_oversized_body_rejected_locally() {
    let mut harness = harness(16).await;

    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let response = router(harness.gateway.clone())
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let executor = harness.executor.as_mut().unwrap();
    assert!(executor.try_recv_raw().is_none());
    assert_eq!(harness.gateway.pending_requests(), 0);
}

#[tokio::test]
async fn test_invalid_remote_status_is_bad_gateway() {
    let mut harness = harness(1024).await;
    let _executor = answer_next(&mut harness, |_| HttpResponse {
        status_code: 1000,
        headers: BTreeMap::new(),
        body: Bytes::new(),
    });

    let request = Request::builder().uri("/").body(Body::empty()).unwrap();
    let response = router(harness.gateway.clone())
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(response).await["code"], "INVALID_RESPONSE");
}

#[tokio::test]
async fn test_requests_after_shutdown_get_503() {
    let harness = harness(1024).await;
    assert_eq!(harness.gateway.shutdown(), 0);

    let request = Request::builder().uri("/late").body(Body::empty()).unwrap();
    let response = router(harness.gateway.clone())
        .oneshot(request)
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["code"], "SHUTTING_DOWN");
    assert!(body["error"].is_string());
}
