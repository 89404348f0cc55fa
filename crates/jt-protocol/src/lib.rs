//! jt-protocol: Wire protocol for jtunnel executor-channel multiplexing
//!
//! This crate defines the text protocol spoken between the gateway and the
//! remote executor over one shared, order-preserving message channel:
//! commands going out as binary-safe invocations, frames coming back as
//! sentinel-tagged JSON lines mixed in with ordinary executor output.

pub mod codec;
pub mod command;
pub mod error;
pub mod frame;
pub mod id;

pub use codec::{CodecOptions, Decoded, FrameCodec, ARGS_HELPER};
pub use command::{ExecutorCommand, HttpCall, Operation};
pub use error::ProtocolError;
pub use frame::{Frame, HttpResponse, DEFAULT_SENTINEL};
pub use id::TunnelId;
