//! Request correlation gateway
//!
//! Every local HTTP exchange becomes exactly one `httpCall` on the executor
//! channel, correlated with its `Response` frame by a fresh identifier. An
//! exchange resolves exactly once: with the response, or with a failure on
//! deadline, executor fault, channel loss or shutdown.

mod pending;
mod server;

pub use pending::{PendingRequest, RequestFailure, Resolution};
pub use server::{router, serve_http};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;

use jt_protocol::{ExecutorCommand, HttpCall, HttpResponse, TunnelId};

use crate::channel::ChannelAdapter;
use crate::registry::ConnectionRegistry;

/// A local HTTP request, ready to be forwarded
#[derive(Debug, Clone, Default)]
pub struct ForwardedRequest {
    /// Request method
    pub method: String,
    /// Path without the query string
    pub path: String,
    /// Headers to pass on
    pub headers: BTreeMap<String, String>,
    /// Raw request body
    pub body: Bytes,
    /// Decoded query parameters in order
    pub query: Vec<(String, String)>,
}

/// Correlates local HTTP exchanges with executor responses
pub struct HttpGateway {
    pending: ConnectionRegistry<PendingRequest>,
    channel: ChannelAdapter,
    request_timeout: Duration,
    max_body_size: usize,
    closed: AtomicBool,
}

/// Removes a pending entry when its exchange ends for any reason,
/// including the client going away mid-flight
struct PendingGuard<'a> {
    pending: &'a ConnectionRegistry<PendingRequest>,
    id: TunnelId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.unregister(self.id);
    }
}

impl HttpGateway {
    /// Create a gateway sending through `channel`
    pub fn new(channel: ChannelAdapter, request_timeout: Duration, max_body_size: usize) -> Self {
        Self {
            pending: ConnectionRegistry::new(),
            channel,
            request_timeout,
            max_body_size,
            closed: AtomicBool::new(false),
        }
    }

    /// Forward one request and wait for its resolution
    pub async fn exchange(&self, request: ForwardedRequest) -> Resolution {
        let (id, deadline, mut rx) = loop {
            let id = TunnelId::generate();
            let (pending, rx) = PendingRequest::new(self.request_timeout);
            let deadline = pending.deadline();
            match self.pending.register(id, pending) {
                Ok(()) => break (id, deadline, rx),
                Err(e) => tracing::warn!("{}; allocating another id", e),
            }
        };
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        if self.closed.load(Ordering::Acquire) {
            return Err(RequestFailure::ShuttingDown);
        }

        tracing::debug!("Request {} {} {}", id, request.method, request.path);
        let call = HttpCall {
            id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
            query: request.query,
        };
        if let Err(e) = self.channel.send(&ExecutorCommand::HttpCall(call)).await {
            return Err(RequestFailure::ChannelLost(e.to_string()));
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(RequestFailure::ChannelLost("request abandoned".into())),
            Err(_) => {
                if self.pending.take(id).is_some() {
                    tracing::warn!("Request {} timed out", id);
                    Err(RequestFailure::Timeout)
                } else {
                    // A resolver claimed the entry at the deadline
                    rx.await.unwrap_or(Err(RequestFailure::Timeout))
                }
            }
        }
    }

    /// Deliver a `Response` frame
    ///
    /// Returns `false` when no request with `id` is pending.
    pub fn resolve(&self, id: TunnelId, response: HttpResponse) -> bool {
        match self.pending.take(id) {
            Some(pending) => {
                tracing::debug!("Request {} answered with {}", id, response.status_code);
                pending.resolve(Ok(response));
                true
            }
            None => {
                tracing::debug!("Dropping response for unknown request {}", id);
                false
            }
        }
    }

    /// Fail every pending request with `failure`
    pub fn fail_all(&self, failure: RequestFailure) -> usize {
        let drained = self.pending.drain();
        let count = drained.len();
        for (_, pending) in drained {
            pending.resolve(Err(failure.clone()));
        }
        if count > 0 {
            tracing::info!("Failed {} pending requests: {}", count, failure);
        }
        count
    }

    /// Stop accepting exchanges and fail the pending ones with 503
    pub fn shutdown(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        self.fail_all(RequestFailure::ShuttingDown)
    }

    /// Number of requests awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Drop every pending entry
    pub fn clear(&self) {
        self.pending.clear();
    }

    /// Largest accepted request body
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }
}
