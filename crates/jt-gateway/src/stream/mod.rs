//! Stream multiplexing gateway
//!
//! Each accepted local TCP peer becomes one logical connection on the
//! executor channel:
//!
//! ```text
//! accept            -> startConnection(id)         OPEN
//! local bytes       -> forwardData(id, bytes)      OPEN
//! local EOF/error   -> closeConnection(id)         CLOSING -> CLOSED
//! Data frame        -> bytes written to the peer   OPEN
//! Closed frame      -> peer closed                 CLOSING -> CLOSED
//! ConnectError      -> peer closed                 CLOSING -> CLOSED
//! ```
//!
//! Whoever moves a connection out of `OPEN` first owns its teardown, so
//! `closeConnection` is sent at most once per id and never after the remote
//! side already reported closure.
//!
//! Remote bytes waiting for a slow peer are capped at
//! `gateway.max_peer_buffer`; a peer that falls further behind is dropped
//! through the local close path.

mod connection;
mod listener;

pub use connection::{PeerCommand, PeerHandle};
pub use listener::serve_streams;

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use jt_protocol::{ExecutorCommand, TunnelId};

use crate::channel::ChannelAdapter;
use crate::registry::ConnectionRegistry;

/// Bridges local TCP peers and executor-side connections
pub struct StreamGateway {
    registry: ConnectionRegistry<PeerHandle>,
    channel: ChannelAdapter,
    read_chunk_size: usize,
    /// Most remote bytes queued for one peer before it is dropped
    max_peer_buffer: usize,
    /// Releases every local peer still being served
    release: CancellationToken,
    tasks: TaskTracker,
}

impl StreamGateway {
    /// Create a gateway sending through `channel`
    pub fn new(channel: ChannelAdapter, read_chunk_size: usize, max_peer_buffer: usize) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            channel,
            read_chunk_size: read_chunk_size.max(1),
            max_peer_buffer: max_peer_buffer.max(1),
            release: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    /// Start serving an accepted local peer
    pub fn accept(self: &Arc<Self>, socket: TcpStream) {
        let gateway = Arc::clone(self);
        self.tasks.spawn(async move {
            connection::serve(gateway, socket).await;
        });
    }

    /// Number of connections still registered
    pub fn open_connections(&self) -> usize {
        self.registry.len()
    }

    /// Identifiers of the registered connections
    pub fn connection_ids(&self) -> Vec<TunnelId> {
        self.registry.ids()
    }

    /// Route a `Data` frame to its local peer
    pub fn on_data(&self, id: TunnelId, data: Bytes) {
        match self.registry.lookup(id) {
            Some(handle) if handle.is_open() => {
                tracing::trace!("Delivering {} bytes to {}", data.len(), id);
                if !handle.deliver_data(data, self.max_peer_buffer) {
                    tracing::debug!("Dropping data for {}: peer gone or too far behind", id);
                }
            }
            Some(_) => tracing::trace!("Dropping data for closing connection {}", id),
            None => tracing::debug!("Dropping data for unknown connection {}", id),
        }
    }

    /// Executor confirmed the remote side of `id`
    pub fn on_connected(&self, id: TunnelId) {
        if self.registry.contains(id) {
            tracing::debug!("Remote side of {} connected", id);
        } else {
            tracing::debug!("Connect confirmation for unknown connection {}", id);
        }
    }

    /// Remote side closed `id`
    pub fn on_remote_closed(&self, id: TunnelId) {
        self.remote_teardown(id, PeerCommand::RemoteClosed, "close");
    }

    /// Executor could not open the remote side of `id`
    pub fn on_connect_error(&self, id: TunnelId, reason: String) {
        tracing::warn!("Remote connect failed for {}: {}", id, reason);
        self.remote_teardown(id, PeerCommand::ConnectFailed(reason), "connect_error");
    }

    fn remote_teardown(&self, id: TunnelId, command: PeerCommand, kind: &str) {
        let Some(handle) = self.registry.take(id) else {
            tracing::debug!("Dropping {} for unknown connection {}", kind, id);
            return;
        };
        if handle.begin_closing() {
            handle.deliver(command);
        }
    }

    /// Fail every connection after the channel is lost
    ///
    /// No close commands are sent; the channel is already gone.
    pub fn fail_all(&self, reason: &str) -> usize {
        let mut failed = 0;
        for (_, handle) in self.registry.drain() {
            if handle.begin_closing() {
                handle.deliver(PeerCommand::ChannelLost(reason.to_string()));
                failed += 1;
            }
        }
        failed
    }

    /// Send `closeConnection` for every connection still open
    ///
    /// Peers are told to release their sockets without sending anything
    /// further.
    pub async fn close_all(&self) -> usize {
        let mut closed = 0;
        for (id, handle) in self.registry.drain() {
            if !handle.begin_closing() {
                continue;
            }
            if let Err(e) = self.channel.send(&ExecutorCommand::CloseConnection { id }).await {
                tracing::debug!("Failed to send close for {} during shutdown: {}", id, e);
            }
            handle.deliver(PeerCommand::Release);
            closed += 1;
        }
        closed
    }

    /// Tell every connection task to let go of its peer, without waiting
    pub fn release(&self) {
        self.release.cancel();
    }

    /// Release every local peer and wait for their tasks
    pub async fn release_all(&self) {
        self.release();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Drop every registry entry
    pub fn clear(&self) {
        self.registry.clear();
    }

    pub(crate) fn registry(&self) -> &ConnectionRegistry<PeerHandle> {
        &self.registry
    }

    pub(crate) fn channel(&self) -> &ChannelAdapter {
        &self.channel
    }

    pub(crate) fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    pub(crate) fn release_token(&self) -> &CancellationToken {
        &self.release
    }
}
