//! Frames reported by the executor
//!
//! Every tunnel-relevant executor output line has the form
//! `<sentinel>{json}` where the JSON object carries a `type` tag:
//!
//! | type              | fields                                   |
//! |-------------------|------------------------------------------|
//! | `connect_success` | `id`                                     |
//! | `data`            | `id`, `data` (base64)                    |
//! | `close`           | `id`                                     |
//! | `connect_error`   | `id`, `reason`                           |
//! | `response`        | `id`, `status_code`, `headers`, `body` (base64) |
//! | `fault`           | `description`                            |
//!
//! `conn_id`/`request_id` are accepted as aliases for `id` and `error` for
//! `reason`, so executors written against the older field names still work.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::id::TunnelId;

/// Default prefix marking a tunnel frame line
pub const DEFAULT_SENTINEL: &str = "TUNNEL_FRAME:";

/// Terminal result of an `httpCall`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code returned by the remote server
    pub status_code: u16,
    /// Response headers as reported by the executor
    pub headers: BTreeMap<String, String>,
    /// Decoded response body
    pub body: Bytes,
}

/// A decoded unit of tunnel protocol information
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Executor opened the remote side of `id`
    Connected { id: TunnelId },

    /// Payload from the remote destination for connection `id`
    Data { id: TunnelId, data: Bytes },

    /// Remote side closed connection `id`
    Closed { id: TunnelId },

    /// Executor failed to establish the remote side for `id`
    ConnectError { id: TunnelId, reason: String },

    /// Terminal result for request `id`
    Response { id: TunnelId, response: HttpResponse },

    /// Executor-level error not tied to any identifier
    ExecutorFault { description: String },
}

impl Frame {
    /// Identifier this frame is addressed to, if any
    pub fn id(&self) -> Option<TunnelId> {
        match self {
            Frame::Connected { id }
            | Frame::Data { id, .. }
            | Frame::Closed { id }
            | Frame::ConnectError { id, .. }
            | Frame::Response { id, .. } => Some(*id),
            Frame::ExecutorFault { .. } => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Connected { .. } => "connect_success",
            Frame::Data { .. } => "data",
            Frame::Closed { .. } => "close",
            Frame::ConnectError { .. } => "connect_error",
            Frame::Response { .. } => "response",
            Frame::ExecutorFault { .. } => "fault",
        }
    }

    /// Parse the JSON object that follows the sentinel
    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        let wire: WireFrame = serde_json::from_str(json)?;
        Ok(wire.into())
    }

    /// Render this frame as a complete tagged output line (without newline)
    pub fn to_line(&self, sentinel: &str) -> String {
        let wire = WireFrame::from(self.clone());
        // WireFrame only holds strings, integers and string maps
        let json = serde_json::to_string(&wire).unwrap_or_default();
        format!("{sentinel}{json}")
    }
}

/// Serialized shape of a frame
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    ConnectSuccess {
        #[serde(alias = "conn_id")]
        id: TunnelId,
    },
    Data {
        #[serde(alias = "conn_id")]
        id: TunnelId,
        #[serde(with = "base64_bytes")]
        data: Bytes,
    },
    #[serde(alias = "closed")]
    Close {
        #[serde(alias = "conn_id")]
        id: TunnelId,
    },
    ConnectError {
        #[serde(alias = "conn_id")]
        id: TunnelId,
        #[serde(alias = "error", default)]
        reason: String,
    },
    Response {
        #[serde(alias = "request_id")]
        id: TunnelId,
        status_code: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(with = "base64_bytes", default)]
        body: Bytes,
    },
    Fault {
        #[serde(default)]
        description: String,
    },
}

impl From<WireFrame> for Frame {
    fn from(wire: WireFrame) -> Self {
        match wire {
            WireFrame::ConnectSuccess { id } => Frame::Connected { id },
            WireFrame::Data { id, data } => Frame::Data { id, data },
            WireFrame::Close { id } => Frame::Closed { id },
            WireFrame::ConnectError { id, reason } => Frame::ConnectError { id, reason },
            WireFrame::Response {
                id,
                status_code,
                headers,
                body,
            } => Frame::Response {
                id,
                response: HttpResponse {
                    status_code,
                    headers,
                    body,
                },
            },
            WireFrame::Fault { description } => Frame::ExecutorFault { description },
        }
    }
}

impl From<Frame> for WireFrame {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Connected { id } => WireFrame::ConnectSuccess { id },
            Frame::Data { id, data } => WireFrame::Data { id, data },
            Frame::Closed { id } => WireFrame::Close { id },
            Frame::ConnectError { id, reason } => WireFrame::ConnectError { id, reason },
            Frame::Response { id, response } => WireFrame::Response {
                id,
                status_code: response.status_code,
                headers: response.headers,
                body: response.body,
            },
            Frame::ExecutorFault { description } => WireFrame::Fault { description },
        }
    }
}

/// Serde helper storing `Bytes` as a base64 string
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.trim())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
