//! Executor lifecycle hook

use async_trait::async_trait;

use crate::error::ChannelError;

/// Control over the remote executor's lifetime
///
/// Used once, at the end of shutdown, to release the executor.
#[async_trait]
pub trait ExecutorLifecycle: Send + Sync {
    /// Terminate the remote executor
    async fn terminate(&self) -> Result<(), ChannelError>;
}

/// Lifecycle for executors the gateway does not own
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedExecutor;

#[async_trait]
impl ExecutorLifecycle for DetachedExecutor {
    async fn terminate(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
