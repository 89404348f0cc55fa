//! In-process executor channel
//!
//! [`memory_channel`] returns a [`ChannelFactory`] for the gateway and the
//! [`ExecutorEndpoint`] standing where the remote executor would be. The
//! endpoint sees every command text the gateway sends and can emit raw
//! messages, Jupyter-shaped stdout/stderr/error envelopes, or tagged frames.

use async_trait::async_trait;
use jt_protocol::{ExecutorCommand, Frame, FrameCodec, ProtocolError};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::error::ChannelError;
use crate::traits::{ChannelFactory, OpenedChannel};

type GatewaySide = (
    mpsc::UnboundedSender<String>,
    mpsc::UnboundedReceiver<String>,
);

/// Factory handing out one in-memory channel
pub struct MemoryChannelFactory {
    side: Mutex<Option<GatewaySide>>,
    label: String,
}

/// Executor side of an in-memory channel
pub struct ExecutorEndpoint {
    commands: mpsc::UnboundedReceiver<String>,
    output: Option<mpsc::UnboundedSender<String>>,
    sentinel: String,
}

/// Create a connected factory/endpoint pair
pub fn memory_channel() -> (MemoryChannelFactory, ExecutorEndpoint) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (output_tx, output_rx) = mpsc::unbounded_channel();

    let factory = MemoryChannelFactory {
        side: Mutex::new(Some((command_tx, output_rx))),
        label: "memory".to_string(),
    };
    let endpoint = ExecutorEndpoint {
        commands: command_rx,
        output: Some(output_tx),
        sentinel: jt_protocol::DEFAULT_SENTINEL.to_string(),
    };

    (factory, endpoint)
}

#[async_trait]
impl ChannelFactory for MemoryChannelFactory {
    async fn open(&self) -> Result<OpenedChannel, ChannelError> {
        let (command_tx, output_rx) = self
            .side
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::Open("memory channel already opened".into()))?;

        let sink = futures::sink::unfold(command_tx, |tx, text: String| async move {
            tx.send(text)
                .map_err(|_| ChannelError::Closed("executor endpoint dropped".into()))?;
            Ok::<_, ChannelError>(tx)
        });

        let stream = futures::stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|text| (Ok(text), rx))
        });

        Ok(OpenedChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            label: self.label.clone(),
        })
    }
}

impl ExecutorEndpoint {
    /// Use a different sentinel for [`emit_frame`](Self::emit_frame)
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    /// Next raw command text, or `None` once the gateway side is gone
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.commands.recv().await
    }

    /// Next tunnel command, skipping any non-invocation source
    /// (prelude, bootstrap code)
    pub async fn next_command(&mut self) -> Option<ExecutorCommand> {
        loop {
            let text = self.commands.recv().await?;
            match FrameCodec::parse_invocation(&text) {
                Ok(command) => return Some(command),
                Err(ProtocolError::UnknownOperation(_))
                | Err(ProtocolError::MalformedInvocation(_)) => {
                    tracing::trace!("Executor endpoint skipping source: {} bytes", text.len());
                }
                Err(e) => {
                    tracing::warn!("Executor endpoint received bad invocation: {}", e);
                }
            }
        }
    }

    /// Command text already queued, without waiting
    pub fn try_recv_raw(&mut self) -> Option<String> {
        self.commands.try_recv().ok()
    }

    /// Send a raw message to the gateway
    ///
    /// Returns `false` if the gateway stopped reading or the endpoint
    /// already disconnected.
    pub fn emit_raw(&self, text: impl Into<String>) -> bool {
        match &self.output {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }

    /// Emit text on the executor's stdout stream
    pub fn emit_stdout(&self, text: &str) -> bool {
        self.emit_stream("stdout", text)
    }

    /// Emit text on the executor's stderr stream
    pub fn emit_stderr(&self, text: &str) -> bool {
        self.emit_stream("stderr", text)
    }

    /// Emit a kernel-level error message
    pub fn emit_error(&self, ename: &str, evalue: &str) -> bool {
        let message = json!({
            "msg_type": "error",
            "content": { "ename": ename, "evalue": evalue, "traceback": [] },
        });
        self.emit_raw(message.to_string())
    }

    /// Emit one tagged frame line on stdout
    pub fn emit_frame(&self, frame: &Frame) -> bool {
        self.emit_stdout(&format!("{}\n", frame.to_line(&self.sentinel)))
    }

    /// Emit several tagged frame lines in a single stdout message
    pub fn emit_batch(&self, frames: &[Frame]) -> bool {
        let text: String = frames
            .iter()
            .map(|frame| format!("{}\n", frame.to_line(&self.sentinel)))
            .collect();
        self.emit_stdout(&text)
    }

    /// Drop the executor's output half; the gateway sees the channel close
    pub fn disconnect(&mut self) {
        self.output = None;
    }

    fn emit_stream(&self, name: &str, text: &str) -> bool {
        let message = json!({
            "msg_type": "stream",
            "content": { "name": name, "text": text },
        });
        self.emit_raw(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use jt_protocol::{Decoded, TunnelId};

    #[tokio::test]
    async fn test_commands_reach_endpoint_in_order() {
        let (factory, mut endpoint) = memory_channel();
        let mut channel = factory.open().await.unwrap();

        let id = TunnelId::generate();
        channel.sink.send(FrameCodec::prelude()).await.unwrap();
        channel
            .sink
            .send(FrameCodec::encode(&ExecutorCommand::StartConnection { id }))
            .await
            .unwrap();
        channel
            .sink
            .send(FrameCodec::encode(&ExecutorCommand::CloseConnection { id }))
            .await
            .unwrap();

        // Prelude is skipped
        assert_eq!(
            endpoint.next_command().await,
            Some(ExecutorCommand::StartConnection { id })
        );
        assert_eq!(
            endpoint.next_command().await,
            Some(ExecutorCommand::CloseConnection { id })
        );
    }

    #[tokio::test]
    async fn test_emitted_frames_decode() {
        let (factory, endpoint) = memory_channel();
        let mut channel = factory.open().await.unwrap();

        let id = TunnelId::generate();
        let frame = Frame::Closed { id };
        assert!(endpoint.emit_frame(&frame));

        let raw = channel.stream.next().await.unwrap().unwrap();
        let decoded = FrameCodec::new().decode(&raw);
        assert_eq!(decoded, vec![Decoded::Frame(frame)]);
    }

    #[tokio::test]
    async fn test_second_open_fails() {
        let (factory, _endpoint) = memory_channel();
        assert!(factory.open().await.is_ok());
        assert!(matches!(factory.open().await, Err(ChannelError::Open(_))));
    }

    #[tokio::test]
    async fn test_disconnect_ends_stream() {
        let (factory, mut endpoint) = memory_channel();
        let mut channel = factory.open().await.unwrap();

        endpoint.disconnect();
        assert!(channel.stream.next().await.is_none());
        assert!(!endpoint.emit_stdout("late"));
    }

    #[tokio::test]
    async fn test_send_fails_after_endpoint_dropped() {
        let (factory, endpoint) = memory_channel();
        let mut channel = factory.open().await.unwrap();
        drop(endpoint);

        let result = channel.sink.send("anything".to_string()).await;
        assert!(matches!(result, Err(ChannelError::Closed(_))));
    }
}
