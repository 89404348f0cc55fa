//! Pending HTTP exchanges

use std::time::Duration;

use axum::http::StatusCode;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use jt_protocol::HttpResponse;

/// Why an exchange ended without a remote response
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestFailure {
    /// No response before the deadline
    #[error("executor did not respond in time")]
    Timeout,

    /// The executor reported an error while the request was pending
    #[error("executor fault: {0}")]
    ExecutorFault(String),

    /// The executor channel is gone
    #[error("executor channel closed: {0}")]
    ChannelLost(String),

    /// The gateway is shutting down
    #[error("gateway shutting down")]
    ShuttingDown,
}

impl RequestFailure {
    /// Status returned to the local client
    pub fn status(&self) -> StatusCode {
        match self {
            RequestFailure::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RequestFailure::ExecutorFault(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RequestFailure::ChannelLost(_) => StatusCode::BAD_GATEWAY,
            RequestFailure::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Machine-readable code for the JSON error body
    pub fn code(&self) -> &'static str {
        match self {
            RequestFailure::Timeout => "TIMEOUT",
            RequestFailure::ExecutorFault(_) => "EXECUTOR_FAULT",
            RequestFailure::ChannelLost(_) => "CHANNEL_CLOSED",
            RequestFailure::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// Client-facing message; carries nothing reported by the remote side
    pub fn message(&self) -> &'static str {
        match self {
            RequestFailure::Timeout => "Executor did not respond in time",
            RequestFailure::ExecutorFault(_) => "Executor reported an error",
            RequestFailure::ChannelLost(_) => "Executor channel closed",
            RequestFailure::ShuttingDown => "Gateway is shutting down",
        }
    }
}

/// How an exchange resolved
pub type Resolution = Result<HttpResponse, RequestFailure>;

/// An HTTP exchange waiting for its `Response` frame
#[derive(Debug)]
pub struct PendingRequest {
    responder: oneshot::Sender<Resolution>,
    deadline: Instant,
}

impl PendingRequest {
    /// Create a pending request expiring `timeout` from now
    pub fn new(timeout: Duration) -> (Self, oneshot::Receiver<Resolution>) {
        let (responder, rx) = oneshot::channel();
        let pending = Self {
            responder,
            deadline: Instant::now() + timeout,
        };
        (pending, rx)
    }

    /// When the exchange times out
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Deliver the resolution; consumes the request so it happens once
    pub fn resolve(self, resolution: Resolution) -> bool {
        self.responder.send(resolution).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::collections::BTreeMap;

    #[test]
    fn test_failure_statuses() {
        assert_eq!(RequestFailure::Timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            RequestFailure::ExecutorFault("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            RequestFailure::ChannelLost("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RequestFailure::ShuttingDown.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_message_hides_remote_details() {
        let failure = RequestFailure::ExecutorFault("Traceback: secret path".into());
        assert!(!failure.message().contains("secret"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_from_timeout() {
        let start = Instant::now();
        let (pending, _rx) = PendingRequest::new(Duration::from_secs(5));
        assert_eq!(pending.deadline() - start, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let (pending, rx) = PendingRequest::new(Duration::from_secs(5));
        let response = HttpResponse {
            status_code: 200,
            headers: BTreeMap::new(),
            body: Bytes::from_static(b"ok"),
        };
        assert!(pending.resolve(Ok(response.clone())));
        assert_eq!(rx.await.unwrap(), Ok(response));
    }

    #[tokio::test]
    async fn test_resolve_after_receiver_dropped() {
        let (pending, rx) = PendingRequest::new(Duration::from_secs(5));
        drop(rx);
        assert!(!pending.resolve(Err(RequestFailure::Timeout)));
    }
}
