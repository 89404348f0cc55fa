//! Global gateway state

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use jt_core::config::GatewayConfig;
use jt_core::traits::ChannelFactory;
use jt_core::GatewayError;

use crate::bootstrap;
use crate::channel::ChannelAdapter;
use crate::dispatch::Dispatcher;
use crate::http::{self, HttpGateway};
use crate::stream::{self, StreamGateway};

/// Global state for the gateway daemon
pub struct GatewayState {
    /// Configuration
    pub config: GatewayConfig,
    /// Executor channel
    pub channel: ChannelAdapter,
    /// Stream multiplexing gateway
    pub streams: Arc<StreamGateway>,
    /// Request correlation gateway
    pub requests: Arc<HttpGateway>,
    /// Stops both listeners
    listeners: CancellationToken,
    listener_tasks: TaskTracker,
    /// Stops the dispatcher
    dispatch: CancellationToken,
}

/// Point-in-time view of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GatewaySnapshot {
    /// Stream connections still registered
    pub open_connections: usize,
    /// HTTP exchanges awaiting a response
    pub pending_requests: usize,
    /// Whether the executor channel is usable
    pub channel_open: bool,
}

impl fmt::Display for GatewaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} open connections, {} pending requests, channel {}",
            self.open_connections,
            self.pending_requests,
            if self.channel_open { "open" } else { "closed" }
        )
    }
}

impl GatewayState {
    /// Open the executor channel, prepare the executor and start dispatching
    pub async fn start(
        config: GatewayConfig,
        factory: &dyn ChannelFactory,
    ) -> Result<Arc<Self>, GatewayError> {
        let (channel, events) =
            ChannelAdapter::open(factory, config.gateway.command_queue).await?;

        bootstrap::prepare_executor(&channel, &config).await?;

        let streams = Arc::new(StreamGateway::new(
            channel.clone(),
            config.gateway.read_chunk_size,
            config.gateway.max_peer_buffer,
        ));
        let requests = Arc::new(HttpGateway::new(
            channel.clone(),
            config.gateway.request_timeout,
            config.gateway.max_body_size,
        ));

        let dispatch = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            config.codec.to_options(),
            Arc::clone(&streams),
            Arc::clone(&requests),
            config.codec.log_diagnostics,
        );
        tokio::spawn(dispatcher.run(events, dispatch.clone()));

        Ok(Arc::new(Self {
            config,
            channel,
            streams,
            requests,
            listeners: CancellationToken::new(),
            listener_tasks: TaskTracker::new(),
            dispatch,
        }))
    }

    /// Serve local TCP peers from `listener`
    pub fn serve_streams(&self, listener: TcpListener) {
        self.listener_tasks.spawn(stream::serve_streams(
            listener,
            Arc::clone(&self.streams),
            self.listeners.clone(),
        ));
    }

    /// Serve local HTTP clients from `listener`
    pub fn serve_http(&self, listener: TcpListener) {
        self.listener_tasks.spawn(http::serve_http(
            listener,
            Arc::clone(&self.requests),
            self.listeners.clone(),
        ));
    }

    /// Current counts
    pub fn snapshot(&self) -> GatewaySnapshot {
        GatewaySnapshot {
            open_connections: self.streams.open_connections(),
            pending_requests: self.requests.pending_requests(),
            channel_open: !self.channel.is_closed(),
        }
    }

    /// Stop accepting local peers
    pub(crate) fn stop_listeners(&self) {
        self.listeners.cancel();
    }

    /// Wait for both listeners to finish
    pub(crate) async fn wait_listeners(&self) {
        self.listener_tasks.close();
        self.listener_tasks.wait().await;
    }

    /// Stop routing inbound frames
    pub(crate) fn stop_dispatcher(&self) {
        self.dispatch.cancel();
    }
}
