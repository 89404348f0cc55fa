//! Commands sent from the gateway to the executor
//!
//! The executor exposes a fixed set of operations. Every command names one of
//! them and carries its arguments as a JSON array; the codec is responsible
//! for turning that array into transport text without ever splicing
//! caller-provided bytes into invocation syntax.
//!
//! # Command Flow
//!
//! Typical sequence for a tunneled byte stream:
//!
//! 1. `startConnection(id)` when a local peer is accepted
//! 2. `forwardData(id, base64)` once per chunk read from the local peer
//! 3. `closeConnection(id)` when the local peer goes away
//!
//! A request/response exchange is a single
//! `httpCall(method, url, headers, base64Body, queryParams, requestId)`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::error::ProtocolError;
use crate::id::TunnelId;

/// Executor operation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Open the remote side of a stream connection
    StartConnection,
    /// Write bytes to the remote side of a stream connection
    ForwardData,
    /// Close the remote side of a stream connection
    CloseConnection,
    /// Perform one HTTP exchange against the remote base URL
    HttpCall,
}

impl Operation {
    /// Function name exposed by the executor
    pub fn name(&self) -> &'static str {
        match self {
            Operation::StartConnection => "startConnection",
            Operation::ForwardData => "forwardData",
            Operation::CloseConnection => "closeConnection",
            Operation::HttpCall => "httpCall",
        }
    }

    /// Look up an operation by its executor function name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "startConnection" => Some(Self::StartConnection),
            "forwardData" => Some(Self::ForwardData),
            "closeConnection" => Some(Self::CloseConnection),
            "httpCall" => Some(Self::HttpCall),
            _ => None,
        }
    }
}

/// One correlated HTTP exchange to be performed by the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpCall {
    /// Correlation identifier echoed back in the `response` frame
    pub id: TunnelId,
    /// Request method (e.g., "GET")
    pub method: String,
    /// Request path relative to the remote base URL, without query string
    pub path: String,
    /// Request headers (duplicate names already folded)
    pub headers: BTreeMap<String, String>,
    /// Raw request body
    pub body: Bytes,
    /// Query parameters in arrival order, repeats preserved
    pub query: Vec<(String, String)>,
}

/// Commands understood by the executor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorCommand {
    /// Open the remote counterpart of a local stream peer
    StartConnection { id: TunnelId },

    /// Forward bytes read from a local stream peer
    ForwardData { id: TunnelId, data: Bytes },

    /// Release the remote counterpart of a stream connection
    CloseConnection { id: TunnelId },

    /// Perform a single HTTP exchange
    HttpCall(HttpCall),
}

impl ExecutorCommand {
    /// Get the operation this command invokes
    pub fn operation(&self) -> Operation {
        match self {
            ExecutorCommand::StartConnection { .. } => Operation::StartConnection,
            ExecutorCommand::ForwardData { .. } => Operation::ForwardData,
            ExecutorCommand::CloseConnection { .. } => Operation::CloseConnection,
            ExecutorCommand::HttpCall(_) => Operation::HttpCall,
        }
    }

    /// Identifier this command refers to
    pub fn id(&self) -> TunnelId {
        match self {
            ExecutorCommand::StartConnection { id }
            | ExecutorCommand::ForwardData { id, .. }
            | ExecutorCommand::CloseConnection { id } => *id,
            ExecutorCommand::HttpCall(call) => call.id,
        }
    }

    /// Positional argument list, matching the executor function signature
    pub fn arguments(&self) -> Value {
        match self {
            ExecutorCommand::StartConnection { id } | ExecutorCommand::CloseConnection { id } => {
                json!([id])
            }
            ExecutorCommand::ForwardData { id, data } => json!([id, STANDARD.encode(data)]),
            ExecutorCommand::HttpCall(call) => json!([
                call.method,
                call.path,
                call.headers,
                STANDARD.encode(&call.body),
                call.query,
                call.id,
            ]),
        }
    }

    /// Rebuild a command from its operation and positional arguments
    pub fn from_arguments(op: Operation, args: Value) -> Result<Self, ProtocolError> {
        let Value::Array(args) = args else {
            return Err(invalid_arguments(op, "expected an argument array"));
        };

        match op {
            Operation::StartConnection => Ok(Self::StartConnection {
                id: id_arg(op, &args, 0)?,
            }),
            Operation::CloseConnection => Ok(Self::CloseConnection {
                id: id_arg(op, &args, 0)?,
            }),
            Operation::ForwardData => Ok(Self::ForwardData {
                id: id_arg(op, &args, 0)?,
                data: Bytes::from(STANDARD.decode(str_arg(op, &args, 1)?)?),
            }),
            Operation::HttpCall => {
                let headers = args
                    .get(2)
                    .cloned()
                    .ok_or_else(|| invalid_arguments(op, "missing headers"))?;
                let query = args
                    .get(4)
                    .cloned()
                    .ok_or_else(|| invalid_arguments(op, "missing query parameters"))?;
                Ok(Self::HttpCall(HttpCall {
                    id: id_arg(op, &args, 5)?,
                    method: str_arg(op, &args, 0)?.to_string(),
                    path: str_arg(op, &args, 1)?.to_string(),
                    headers: serde_json::from_value(headers)?,
                    body: Bytes::from(STANDARD.decode(str_arg(op, &args, 3)?)?),
                    query: serde_json::from_value(query)?,
                }))
            }
        }
    }
}

fn invalid_arguments(op: Operation, reason: &str) -> ProtocolError {
    ProtocolError::InvalidArguments {
        op: op.name(),
        reason: reason.to_string(),
    }
}

fn str_arg(op: Operation, args: &[Value], index: usize) -> Result<&str, ProtocolError> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| invalid_arguments(op, &format!("argument {index} must be a string")))
}

fn id_arg(op: Operation, args: &[Value], index: usize) -> Result<TunnelId, ProtocolError> {
    Ok(str_arg(op, args, index)?.parse()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_name_roundtrip() {
        for op in [
            Operation::StartConnection,
            Operation::ForwardData,
            Operation::CloseConnection,
            Operation::HttpCall,
        ] {
            assert_eq!(Operation::from_name(op.name()), Some(op));
        }
        assert_eq!(Operation::from_name("__import__"), None);
    }

    #[test]
    fn test_forward_data_arguments_are_base64() {
        let id = TunnelId::generate();
        let cmd = ExecutorCommand::ForwardData {
            id,
            data: Bytes::from_static(b"\x00\"); os.system('x')#"),
        };

        let args = cmd.arguments();
        assert_eq!(args[0], json!(id.to_string()));
        assert_eq!(args[1], json!("ACIpOyBvcy5zeXN0ZW0oJ3gnKSM="));
    }

    #[test]
    fn test_http_call_argument_order() {
        let id = TunnelId::generate();
        let mut headers = BTreeMap::new();
        headers.insert("accept".to_string(), "*/*".to_string());
        let cmd = ExecutorCommand::HttpCall(HttpCall {
            id,
            method: "POST".to_string(),
            path: "/submit".to_string(),
            headers,
            body: Bytes::from_static(b"{}"),
            query: vec![("a".to_string(), "1".to_string()), ("a".to_string(), "2".to_string())],
        });

        let args = cmd.arguments();
        assert_eq!(args[0], "POST");
        assert_eq!(args[1], "/submit");
        assert_eq!(args[2], json!({"accept": "*/*"}));
        assert_eq!(args[3], "e30=");
        assert_eq!(args[4], json!([["a", "1"], ["a", "2"]]));
        assert_eq!(args[5], json!(id.to_string()));

        let rebuilt = ExecutorCommand::from_arguments(Operation::HttpCall, args).unwrap();
        assert_eq!(rebuilt, cmd);
    }

    #[test]
    fn test_from_arguments_rejects_missing_id() {
        let result = ExecutorCommand::from_arguments(Operation::CloseConnection, json!([]));
        assert!(matches!(
            result,
            Err(ProtocolError::InvalidArguments { op: "closeConnection", .. })
        ));
    }
}
