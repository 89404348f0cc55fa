//! Inbound dispatcher
//!
//! The single consumer of the channel's event stream. Decodes each raw
//! message and routes every frame to the gateway owning its identifier, in
//! arrival order. Frames for unknown identifiers are dropped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use jt_protocol::{CodecOptions, Decoded, Frame, FrameCodec};

use crate::channel::{ChannelEvent, ChannelEvents};
use crate::http::{HttpGateway, RequestFailure};
use crate::stream::StreamGateway;

/// Routes decoded frames to the stream and HTTP gateways
pub struct Dispatcher {
    codec: FrameCodec,
    streams: Arc<StreamGateway>,
    requests: Arc<HttpGateway>,
    log_diagnostics: bool,
}

impl Dispatcher {
    /// Create a dispatcher
    pub fn new(
        options: CodecOptions,
        streams: Arc<StreamGateway>,
        requests: Arc<HttpGateway>,
        log_diagnostics: bool,
    ) -> Self {
        Self {
            codec: FrameCodec::with_options(options),
            streams,
            requests,
            log_diagnostics,
        }
    }

    /// Consume channel events until the channel closes or `cancel` fires
    pub async fn run(mut self, mut events: ChannelEvents, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(ChannelEvent::Message(raw)) => self.handle_message(&raw),
                Some(ChannelEvent::Closed(reason)) => {
                    self.handle_channel_closed(&reason);
                    break;
                }
                None => {
                    self.handle_channel_closed("event stream ended");
                    break;
                }
            }
        }
        tracing::debug!("Dispatcher stopped");
    }

    /// Decode and route one raw channel message
    pub fn handle_message(&mut self, raw: &str) {
        for decoded in self.codec.decode(raw) {
            match decoded {
                Decoded::Frame(frame) => self.route(frame),
                Decoded::Diagnostic(text) => {
                    if self.log_diagnostics {
                        tracing::info!(target: "jt_gateway::executor", "{}", text);
                    } else {
                        tracing::debug!(target: "jt_gateway::executor", "{}", text);
                    }
                }
            }
        }
    }

    /// Fail everything in flight after the channel is gone
    pub fn handle_channel_closed(&self, reason: &str) {
        let connections = self.streams.fail_all(reason);
        let requests = self
            .requests
            .fail_all(RequestFailure::ChannelLost(reason.to_string()));
        if connections > 0 || requests > 0 {
            tracing::warn!(
                "Channel lost ({}): failed {} connections and {} requests",
                reason,
                connections,
                requests
            );
        }
    }

    fn route(&self, frame: Frame) {
        tracing::trace!("Routing {} frame", frame.kind());
        match frame {
            Frame::Connected { id } => self.streams.on_connected(id),
            Frame::Data { id, data } => self.streams.on_data(id, data),
            Frame::Closed { id } => self.streams.on_remote_closed(id),
            Frame::ConnectError { id, reason } => self.streams.on_connect_error(id, reason),
            Frame::Response { id, response } => {
                self.requests.resolve(id, response);
            }
            Frame::ExecutorFault { description } => {
                tracing::warn!("Executor fault: {}", description);
                self.requests
                    .fail_all(RequestFailure::ExecutorFault(description));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use bytes::Bytes;
    use jt_core::memory::{memory_channel, ExecutorEndpoint};
    use jt_protocol::{ExecutorCommand, HttpResponse, TunnelId, DEFAULT_SENTINEL};

    use crate::channel::ChannelAdapter;
    use crate::http::ForwardedRequest;

    struct Harness {
        dispatcher: Dispatcher,
        requests: Arc<HttpGateway>,
        endpoint: ExecutorEndpoint,
    }

    async fn harness() -> Harness {
        let (factory, endpoint) = memory_channel();
        let (channel, _events) = ChannelAdapter::open(&factory, 16).await.unwrap();
        let streams = Arc::new(StreamGateway::new(channel.clone(), 1024, 1024 * 1024));
        let requests = Arc::new(HttpGateway::new(
            channel,
            Duration::from_secs(30),
            1024,
        ));
        let dispatcher = Dispatcher::new(
            CodecOptions::default(),
            streams,
            requests.clone(),
            false,
        );
        Harness {
            dispatcher,
            requests,
            endpoint,
        }
    }

    fn line(frame: &Frame) -> String {
        format!("{}\n", frame.to_line(DEFAULT_SENTINEL))
    }

    #[tokio::test]
    async fn test_unknown_ids_cause_no_state_change() {
        let mut h = harness().await;
        let id = TunnelId::generate();

        h.dispatcher.handle_message(&line(&Frame::Data {
            id,
            data: Bytes::from_static(b"x"),
        }));
        h.dispatcher.handle_message(&line(&Frame::Closed { id }));
        h.dispatcher.handle_message(&line(&Frame::Response {
            id,
            response: HttpResponse {
                status_code: 200,
                headers: BTreeMap::new(),
                body: Bytes::new(),
            },
        }));

        assert_eq!(h.dispatcher.streams.open_connections(), 0);
        assert_eq!(h.requests.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_response_resolves_pending_request() {
        let mut h = harness().await;

        let requests = h.requests.clone();
        let exchange = tokio::spawn(async move {
            requests
                .exchange(ForwardedRequest {
                    method: "GET".into(),
                    path: "/x".into(),
                    ..ForwardedRequest::default()
                })
                .await
        });

        let Some(ExecutorCommand::HttpCall(call)) = h.endpoint.next_command().await else {
            panic!("Expected httpCall");
        };
        assert_eq!(call.path, "/x");

        h.dispatcher.handle_message(&line(&Frame::Response {
            id: call.id,
            response: HttpResponse {
                status_code: 200,
                headers: BTreeMap::new(),
                body: Bytes::from_static(b"ok"),
            },
        }));

        let response = exchange.await.unwrap().unwrap();
        assert_eq!(response.body, Bytes::from_static(b"ok"));
        assert_eq!(h.requests.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_executor_fault_fails_pending_requests() {
        let mut h = harness().await;

        let requests = h.requests.clone();
        let exchange = tokio::spawn(async move {
            requests.exchange(ForwardedRequest::default()).await
        });
        assert!(h.endpoint.next_command().await.is_some());

        h.dispatcher.handle_message(
            r#"{"msg_type":"error","content":{"ename":"NameError","evalue":"x"}}"#,
        );

        let result = exchange.await.unwrap();
        assert!(matches!(result, Err(RequestFailure::ExecutorFault(_))));
    }

    #[tokio::test]
    async fn test_channel_closed_fails_requests() {
        let mut h = harness().await;

        let requests = h.requests.clone();
        let exchange = tokio::spawn(async move {
            requests.exchange(ForwardedRequest::default()).await
        });
        assert!(h.endpoint.next_command().await.is_some());

        h.dispatcher.handle_channel_closed("test");
        let result = exchange.await.unwrap();
        assert_eq!(result, Err(RequestFailure::ChannelLost("test".into())));
    }
}
