//! Executor channel abstraction

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};

use crate::error::ChannelError;

/// Outbound half of a channel: accepts one text message per command
pub type ChannelSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;

/// Inbound half of a channel: yields raw executor messages in order
///
/// The stream ending (or yielding an error) means the channel is closed.
pub type ChannelStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// A freshly opened executor channel
pub struct OpenedChannel {
    /// Outbound half
    pub sink: ChannelSink,
    /// Inbound half
    pub stream: ChannelStream,
    /// Human-readable description for logs (e.g. the kernel id)
    pub label: String,
}

impl std::fmt::Debug for OpenedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedChannel")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// Produces the single ordered text channel to the remote executor
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Open the channel
    ///
    /// Called once per gateway run.
    async fn open(&self) -> Result<OpenedChannel, ChannelError>;
}
