//! Per-connection task

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use jt_core::{ConnectionState, StateCell};
use jt_protocol::{ExecutorCommand, TunnelId};

use super::StreamGateway;

/// Instruction delivered to a connection task from outside
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCommand {
    /// Bytes from the remote destination, to be written to the peer
    Data(Bytes),
    /// Remote side closed
    RemoteClosed,
    /// Remote side could not be opened
    ConnectFailed(String),
    /// Executor channel is gone
    ChannelLost(String),
    /// Gateway is shutting down
    Release,
}

/// Non-owning delivery handle stored in the registry
#[derive(Clone)]
pub struct PeerHandle {
    tx: mpsc::UnboundedSender<PeerCommand>,
    state: Arc<StateCell>,
    /// Bytes queued for the peer but not yet written
    buffered: Arc<AtomicUsize>,
    /// Fired when the peer falls too far behind
    overflow: CancellationToken,
}

impl PeerHandle {
    fn new(tx: mpsc::UnboundedSender<PeerCommand>, state: Arc<StateCell>) -> Self {
        Self {
            tx,
            state,
            buffered: Arc::new(AtomicUsize::new(0)),
            overflow: CancellationToken::new(),
        }
    }

    /// Queue a command for the connection task
    ///
    /// Returns `false` once the task has finished.
    pub fn deliver(&self, command: PeerCommand) -> bool {
        self.tx.send(command).is_ok()
    }

    /// Queue remote bytes unless the peer already has `limit` bytes pending
    ///
    /// Going over the limit fires the overflow signal instead; the
    /// connection task then tears the connection down.
    pub fn deliver_data(&self, data: Bytes, limit: usize) -> bool {
        if self.overflow.is_cancelled() {
            return false;
        }
        let len = data.len();
        let pending = self.buffered.fetch_add(len, Ordering::AcqRel) + len;
        if pending > limit {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            self.overflow.cancel();
            return false;
        }
        if self.deliver(PeerCommand::Data(data)) {
            true
        } else {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            false
        }
    }

    /// Bytes queued for the peer but not yet written
    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Whether the peer fell too far behind
    pub fn is_overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Whether the connection still accepts bytes
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// Claim the teardown of this connection
    pub fn begin_closing(&self) -> bool {
        self.state.begin_closing()
    }
}

/// Why the connection loop ended
#[derive(Debug)]
enum Exit {
    LocalClosed,
    LocalError(io::Error),
    Overflowed,
    RemoteClosed,
    ConnectFailed(String),
    ChannelLost(String),
    Released,
}

/// Serve one local peer until either side closes
pub(super) async fn serve(gateway: Arc<StreamGateway>, socket: TcpStream) {
    let peer = socket
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown peer".to_string());
    let id = TunnelId::generate();
    let state = Arc::new(StateCell::new());
    let (tx, mut rx) = mpsc::unbounded_channel();

    let handle = PeerHandle::new(tx, Arc::clone(&state));
    let buffered = Arc::clone(&handle.buffered);
    let overflow = handle.overflow.clone();
    if let Err(e) = gateway.registry().register(id, handle) {
        tracing::warn!("Rejecting connection from {}: {}", peer, e);
        return;
    }

    if let Err(e) = gateway
        .channel()
        .send(&ExecutorCommand::StartConnection { id })
        .await
    {
        tracing::warn!("Failed to start connection {} for {}: {}", id, peer, e);
        gateway.registry().unregister(id);
        state.finish();
        return;
    }
    tracing::debug!("Connection {} opened for {}", id, peer);

    let (mut reader, mut writer) = socket.into_split();
    let mut buf = vec![0u8; gateway.read_chunk_size()];
    let release = gateway.release_token().clone();

    // Every await in the loop also watches `release`
    let exit = 'serve: loop {
        tokio::select! {
            _ = release.cancelled() => break Exit::Released,
            _ = overflow.cancelled() => break Exit::Overflowed,

            read = reader.read(&mut buf) => match read {
                Ok(0) => break Exit::LocalClosed,
                Ok(n) => {
                    if !state.is_open() {
                        // Teardown already claimed elsewhere; its command is queued
                        continue;
                    }
                    tracing::trace!("Forwarding {} bytes for {}", n, id);
                    let command = ExecutorCommand::ForwardData {
                        id,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    let sent = tokio::select! {
                        _ = release.cancelled() => break 'serve Exit::Released,
                        sent = gateway.channel().send(&command) => sent,
                    };
                    if let Err(e) = sent {
                        break Exit::ChannelLost(e.to_string());
                    }
                }
                Err(e) => break Exit::LocalError(e),
            },

            command = rx.recv() => match command {
                Some(PeerCommand::Data(data)) => {
                    let written = tokio::select! {
                        _ = release.cancelled() => break 'serve Exit::Released,
                        _ = overflow.cancelled() => break 'serve Exit::Overflowed,
                        written = writer.write_all(&data) => written,
                    };
                    buffered.fetch_sub(data.len(), Ordering::AcqRel);
                    if let Err(e) = written {
                        break Exit::LocalError(e);
                    }
                }
                Some(PeerCommand::RemoteClosed) => break Exit::RemoteClosed,
                Some(PeerCommand::ConnectFailed(reason)) => break Exit::ConnectFailed(reason),
                Some(PeerCommand::ChannelLost(reason)) => break Exit::ChannelLost(reason),
                Some(PeerCommand::Release) | None => break Exit::Released,
            },
        }
    };

    match &exit {
        Exit::LocalClosed | Exit::LocalError(_) | Exit::Overflowed | Exit::Released => {
            match &exit {
                Exit::LocalError(e) => tracing::debug!("Local I/O error on {}: {}", id, e),
                Exit::Overflowed => tracing::warn!(
                    "Peer of {} stopped reading; dropping connection with {} bytes queued",
                    id,
                    buffered.load(Ordering::Acquire)
                ),
                _ => {}
            }
            if state.begin_closing() {
                // Unregister first so late frames for this id are dropped
                gateway.registry().unregister(id);
                let close = ExecutorCommand::CloseConnection { id };
                let sent = if release.is_cancelled() {
                    // Shutdown is draining; do not wait behind a stalled channel
                    gateway.channel().try_send(&close)
                } else {
                    gateway.channel().send(&close).await
                };
                if let Err(e) = sent {
                    tracing::debug!("Failed to send close for {}: {}", id, e);
                }
            }
        }
        Exit::ChannelLost(reason) => {
            state.begin_closing();
            tracing::debug!("Connection {} lost with the channel: {}", id, reason);
        }
        Exit::RemoteClosed => tracing::debug!("Remote side closed {}", id),
        Exit::ConnectFailed(reason) => {
            tracing::debug!("Connection {} failed remotely: {}", id, reason);
        }
    }

    gateway.registry().unregister(id);
    if let Err(e) = writer.shutdown().await {
        tracing::trace!("Shutdown of {} peer socket failed: {}", id, e);
    }
    state.finish();
    tracing::debug!("Connection {} closed ({:?})", id, exit);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (PeerHandle, mpsc::UnboundedReceiver<PeerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PeerHandle::new(tx, Arc::new(StateCell::new())), rx)
    }

    #[test]
    fn test_deliver_data_counts_buffered_bytes() {
        let (handle, mut rx) = handle();

        assert!(handle.deliver_data(Bytes::from_static(b"abcd"), 8));
        assert!(handle.deliver_data(Bytes::from_static(b"efgh"), 8));
        assert_eq!(handle.buffered(), 8);
        assert!(!handle.is_overflowed());

        assert_eq!(
            rx.try_recv().unwrap(),
            PeerCommand::Data(Bytes::from_static(b"abcd"))
        );
    }

    #[test]
    fn test_deliver_data_over_limit_fires_overflow() {
        let (handle, mut rx) = handle();

        assert!(handle.deliver_data(Bytes::from_static(b"abcd"), 6));
        assert!(!handle.deliver_data(Bytes::from_static(b"efgh"), 6));
        assert!(handle.is_overflowed());
        assert_eq!(handle.buffered(), 4);

        // Nothing more is queued once the peer is marked as overflowed
        assert!(!handle.deliver_data(Bytes::from_static(b"i"), 6));
        rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deliver_data_after_task_exit() {
        let (handle, rx) = handle();
        drop(rx);

        assert!(!handle.deliver_data(Bytes::from_static(b"abcd"), 8));
        assert_eq!(handle.buffered(), 0);
    }
}
