//! Codec between executor commands/frames and channel text
//!
//! # Outbound
//!
//! A command becomes one line of executor source:
//!
//! ```text
//! forwardData(*__jt_args("WyI2ZjFjMmE4ZS0uLi4iLCJjR2x1Wnc9PSJd"))
//! ```
//!
//! The operation name comes from a closed set and the only other text is a
//! base64 literal, whose alphabet cannot terminate the string. The helper
//! `__jt_args` is defined once by [`FrameCodec::prelude`].
//!
//! # Inbound
//!
//! Raw channel messages are Jupyter-shaped JSON envelopes. stdout stream text
//! is split into lines and every line starting with the sentinel is parsed as
//! a [`Frame`]; other lines, stderr text and (optionally) kernel errors are
//! passed through as diagnostics. A line that fails to parse is logged and
//! dropped without affecting its neighbours.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value;

use crate::command::{ExecutorCommand, Operation};
use crate::error::ProtocolError;
use crate::frame::{Frame, DEFAULT_SENTINEL};

/// Name of the argument-decoding helper defined in the executor
pub const ARGS_HELPER: &str = "__jt_args";

/// Default upper bound for a buffered partial stdout line (16MB)
pub const DEFAULT_MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// One item produced by decoding a channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A tunnel frame
    Frame(Frame),
    /// Untagged executor output, kept for logging only
    Diagnostic(String),
}

/// Decoding options
#[derive(Debug, Clone)]
pub struct CodecOptions {
    /// Prefix marking tunnel frame lines
    pub sentinel: String,
    /// Turn kernel `error` messages into [`Frame::ExecutorFault`]
    pub surface_executor_errors: bool,
    /// Longest partial stdout line kept between messages
    pub max_line_length: usize,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            surface_executor_errors: true,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Jupyter message envelope (only the fields the codec looks at)
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    header: Option<EnvelopeHeader>,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct EnvelopeHeader {
    msg_type: String,
}

/// Codec for encoding executor commands and decoding executor output
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Decoding options
    options: CodecOptions,
    /// Unterminated tail of the last stdout chunk
    partial: String,
}

impl FrameCodec {
    /// Create a codec with default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec with custom options
    pub fn with_options(options: CodecOptions) -> Self {
        Self {
            options,
            partial: String::new(),
        }
    }

    /// Get the decoding options
    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Executor source defining the argument helper used by [`encode`](Self::encode)
    pub fn prelude() -> String {
        format!(
            "import base64 as _jt_b64, json as _jt_json\n\
             def {ARGS_HELPER}(encoded):\n    \
                 return _jt_json.loads(_jt_b64.b64decode(encoded).decode('utf-8'))\n"
        )
    }

    /// Encode a command as a single executor invocation
    pub fn encode(command: &ExecutorCommand) -> String {
        let op = command.operation();
        format!(
            "{}(*{ARGS_HELPER}(\"{}\"))",
            op.name(),
            encode_value(&command.arguments())
        )
    }

    /// Encode `name = <value>` where the value travels as base64 JSON
    ///
    /// `name` must be a fixed identifier chosen by the caller, never input data.
    pub fn encode_assignment(name: &str, value: &Value) -> String {
        format!("{name} = {ARGS_HELPER}(\"{}\")", encode_value(value))
    }

    /// Parse an invocation produced by [`encode`](Self::encode)
    pub fn parse_invocation(text: &str) -> Result<ExecutorCommand, ProtocolError> {
        let text = text.trim();
        let malformed = || ProtocolError::MalformedInvocation(truncate(text, 64));

        let (name, rest) = text.split_once('(').ok_or_else(malformed)?;
        let op = Operation::from_name(name.trim())
            .ok_or_else(|| ProtocolError::UnknownOperation(name.trim().to_string()))?;

        let encoded = rest
            .strip_prefix('*')
            .and_then(|r| r.strip_prefix(ARGS_HELPER))
            .and_then(|r| r.strip_prefix("(\""))
            .and_then(|r| r.strip_suffix("\"))"))
            .ok_or_else(malformed)?;

        let json = STANDARD.decode(encoded)?;
        let args: Value = serde_json::from_slice(&json)?;
        ExecutorCommand::from_arguments(op, args)
    }

    /// Parse a single output line
    ///
    /// Returns `None` when the line does not carry the sentinel.
    pub fn decode_line(&self, line: &str) -> Option<Result<Frame, ProtocolError>> {
        let payload = line.trim().strip_prefix(self.options.sentinel.as_str())?;
        Some(Frame::from_json(payload))
    }

    /// Decode one raw channel message into frames and diagnostics
    pub fn decode(&mut self, raw: &str) -> Vec<Decoded> {
        let mut out = Vec::new();

        let envelope = serde_json::from_str::<Envelope>(raw).ok().and_then(|env| {
            let msg_type = env.msg_type.or(env.header.map(|h| h.msg_type))?;
            Some((msg_type, env.content))
        });

        let Some((msg_type, content)) = envelope else {
            // Plain-text channel: each message is complete on its own
            self.decode_text(raw, true, &mut out);
            return out;
        };

        match msg_type.as_str() {
            "stream" => {
                let text = content["text"].as_str().unwrap_or_default();
                match content["name"].as_str() {
                    Some("stderr") => push_diagnostic(text, &mut out),
                    _ => self.decode_text(text, false, &mut out),
                }
            }
            "error" => {
                let ename = content["ename"].as_str().unwrap_or("Error");
                let evalue = content["evalue"].as_str().unwrap_or_default();
                let description = format!("{ename}: {evalue}");
                if self.options.surface_executor_errors {
                    out.push(Decoded::Frame(Frame::ExecutorFault { description }));
                } else {
                    out.push(Decoded::Diagnostic(description));
                }
            }
            other => {
                tracing::trace!("Ignoring channel message of type {}", other);
            }
        }

        out
    }

    /// Split text into lines, decoding each one independently
    fn decode_text(&mut self, text: &str, complete: bool, out: &mut Vec<Decoded>) {
        let mut buffered = std::mem::take(&mut self.partial);
        buffered.push_str(text);

        let mut rest = buffered.as_str();
        while let Some(pos) = rest.find('\n') {
            self.decode_into(&rest[..pos], out);
            rest = &rest[pos + 1..];
        }

        if rest.is_empty() {
            return;
        }

        if complete {
            self.decode_into(rest, out);
        } else if rest.len() > self.options.max_line_length {
            tracing::warn!(
                "Dropping unterminated executor line of {} bytes (limit {})",
                rest.len(),
                self.options.max_line_length
            );
        } else {
            self.partial = rest.to_string();
        }
    }

    fn decode_into(&self, line: &str, out: &mut Vec<Decoded>) {
        match self.decode_line(line) {
            Some(Ok(frame)) => out.push(Decoded::Frame(frame)),
            Some(Err(e)) => {
                tracing::warn!("Dropping malformed frame: {} ({})", e, truncate(line, 120));
            }
            None => {
                let line = line.trim();
                if !line.is_empty() {
                    out.push(Decoded::Diagnostic(line.to_string()));
                }
            }
        }
    }
}

fn encode_value(value: &Value) -> String {
    // Serializing a Value cannot fail
    STANDARD.encode(serde_json::to_vec(value).unwrap_or_default())
}

fn push_diagnostic(text: &str, out: &mut Vec<Decoded>) {
    let text = text.trim();
    if !text.is_empty() {
        out.push(Decoded::Diagnostic(text.to_string()));
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
