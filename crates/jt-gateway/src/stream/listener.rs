//! Local TCP listener
//!
//! Accepts local peers and hands each one to the stream gateway.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::StreamGateway;

/// Accept local peers until `cancel` fires
pub async fn serve_streams(
    listener: TcpListener,
    gateway: Arc<StreamGateway>,
    cancel: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => tracing::info!("Stream listener on {}", addr),
        Err(e) => tracing::warn!("Stream listener address unavailable: {}", e),
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Stream listener shutting down");
                break;
            }

            result = listener.accept() => {
                match result {
                    Ok((socket, peer_addr)) => {
                        tracing::debug!("Accepted stream peer {}", peer_addr);
                        if let Err(e) = socket.set_nodelay(true) {
                            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }
                        gateway.accept(socket);
                    }
                    Err(e) => {
                        tracing::error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}
