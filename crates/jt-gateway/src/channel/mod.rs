//! Executor channel: adapter plus the Jupyter-backed factory

mod adapter;
mod jupyter;

pub use adapter::{ChannelAdapter, ChannelEvent, ChannelEvents};
pub use jupyter::{JupyterChannelFactory, PROTOCOL_VERSION};
