//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Tagged line did not contain a valid frame object
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    /// Byte payload was not valid base64
    #[error("Invalid base64 payload: {0}")]
    InvalidBase64(#[from] base64::DecodeError),

    /// Frame referenced an identifier that is not a valid UUID
    #[error("Invalid identifier: {0}")]
    InvalidId(#[from] uuid::Error),

    /// Invocation text did not match `op(*__jt_args("..."))`
    #[error("Malformed invocation: {0}")]
    MalformedInvocation(String),

    /// Invocation named an operation the executor does not expose
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Decoded argument list had the wrong shape for its operation
    #[error("Invalid arguments for {op}: {reason}")]
    InvalidArguments { op: &'static str, reason: String },
}
