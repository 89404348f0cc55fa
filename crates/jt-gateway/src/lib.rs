//! jt-gateway: Local daemon tunneling TCP and HTTP through a remote executor
//!
//! The gateway accepts local TCP peers and HTTP clients and multiplexes them
//! over a single text channel to a remote executor (a Jupyter kernel), which
//! performs the actual network I/O and reports results as tagged output
//! lines on the same channel.

pub mod bootstrap;
pub mod channel;
pub mod dispatch;
pub mod http;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod stream;

pub use channel::{ChannelAdapter, ChannelEvent, JupyterChannelFactory};
pub use registry::ConnectionRegistry;
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use state::{GatewaySnapshot, GatewayState};
