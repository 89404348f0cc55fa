//! Core error types for jtunnel

use jt_protocol::{ProtocolError, TunnelId};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the jtunnel ecosystem
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Channel error
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executor channel errors
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// The factory could not produce a channel
    #[error("Failed to open channel: {0}")]
    Open(String),

    /// The channel is gone; no further sends are possible
    #[error("Channel closed: {0}")]
    Closed(String),

    /// The transport reported an error on an open channel
    #[error("Transport error: {0}")]
    Transport(String),

    /// The executor lifecycle request failed
    #[error("Executor lifecycle error: {0}")]
    Lifecycle(String),
}

/// Connection registry errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// Identifier is already bound to a live entry
    #[error("Identifier already registered: {0}")]
    AlreadyRegistered(TunnelId),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
