//! Core trait definitions

mod channel;
mod lifecycle;

pub use channel::{ChannelFactory, ChannelSink, ChannelStream, OpenedChannel};
pub use lifecycle::{DetachedExecutor, ExecutorLifecycle};
