//! Shutdown coordinator
//!
//! Runs once, on SIGINT/SIGTERM. Each step is best-effort:
//!
//! 1. stop both listeners
//! 2. send `closeConnection` for every open connection and answer every
//!    pending request with 503
//! 3. release every local peer
//! 4. clear the registries
//! 5. terminate the executor
//!
//! Steps 1 to 4 are bounded by `gateway.shutdown_grace`. If the grace
//! period runs out, every connection task is told to drop its peer at once
//! and the registries are cleared anyway. Step 5 always runs, under its own
//! bound of the same length.

use std::sync::Arc;

use serde::Serialize;

use jt_core::traits::ExecutorLifecycle;

use crate::state::GatewayState;

/// What the shutdown sequence accomplished
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Connections that received a `closeConnection`
    pub connections_closed: usize,
    /// Pending requests answered with 503
    pub requests_failed: usize,
    /// Whether the executor accepted the termination request
    pub executor_terminated: bool,
    /// Whether the grace period ran out
    pub timed_out: bool,
}

/// Drains both gateways and releases remote and local state
pub struct ShutdownCoordinator {
    state: Arc<GatewayState>,
    lifecycle: Arc<dyn ExecutorLifecycle>,
}

impl ShutdownCoordinator {
    /// Create a coordinator
    pub fn new(state: Arc<GatewayState>, lifecycle: Arc<dyn ExecutorLifecycle>) -> Self {
        Self { state, lifecycle }
    }

    /// Run the shutdown sequence
    pub async fn run(&self) -> ShutdownReport {
        let state = &self.state;
        let grace = state.config.gateway.shutdown_grace;
        tracing::info!("Shutting down ({})", state.snapshot());

        let mut report = ShutdownReport::default();
        if tokio::time::timeout(grace, self.drain(&mut report))
            .await
            .is_err()
        {
            tracing::warn!(
                "Shutdown did not finish within {:?}; abandoning remaining steps",
                grace
            );
            report.timed_out = true;
            state.stop_listeners();
            state.streams.release();
            report.requests_failed += state.requests.shutdown();
            state.streams.clear();
            state.requests.clear();
        }

        report.executor_terminated = match tokio::time::timeout(grace, self.lifecycle.terminate())
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::warn!("Failed to terminate executor: {}", e);
                false
            }
            Err(_) => {
                tracing::warn!("Executor did not terminate within {:?}", grace);
                false
            }
        };

        state.stop_dispatcher();
        state.channel.close();

        tracing::info!(
            "Shutdown complete: {} connections closed, {} requests failed, executor terminated: {}",
            report.connections_closed,
            report.requests_failed,
            report.executor_terminated
        );
        report
    }

    /// Steps 1 to 4
    async fn drain(&self, report: &mut ShutdownReport) {
        let state = &self.state;

        state.stop_listeners();

        report.connections_closed = state.streams.close_all().await;
        report.requests_failed = state.requests.shutdown();
        if let Err(e) = state.channel.flush().await {
            tracing::debug!("Could not flush close commands: {}", e);
        }

        state.streams.release_all().await;
        state.wait_listeners().await;

        state.streams.clear();
        state.requests.clear();
    }
}
