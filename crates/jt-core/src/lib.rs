//! jt-core: Core abstractions and configuration for jtunnel
//!
//! This crate provides the error types, configuration structures, executor
//! channel traits and connection state shared by the gateway and its tests.

pub mod config;
pub mod error;
pub mod memory;
pub mod traits;
pub mod types;

pub use error::{ChannelError, ConfigError, GatewayError, RegistryError};
pub use types::{ConnectionState, StateCell};
