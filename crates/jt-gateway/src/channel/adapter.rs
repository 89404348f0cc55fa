//! Channel adapter
//!
//! Owns the executor channel. Every outbound message goes through one
//! bounded queue drained by a single writer task, so commands reach the
//! executor in the order they were enqueued. A reader task forwards inbound
//! messages as [`ChannelEvent`]s in arrival order.
//!
//! Whichever task notices the channel failing first publishes the single
//! terminal [`ChannelEvent::Closed`]. After that every send fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use jt_core::traits::{ChannelFactory, ChannelSink, ChannelStream, OpenedChannel};
use jt_core::ChannelError;
use jt_protocol::{ExecutorCommand, FrameCodec};

/// Inbound channel activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// One raw message from the executor
    Message(String),
    /// The channel is gone; always the last event
    Closed(String),
}

/// How long the writer waits for the transport to close
const SINK_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Receiving side of the adapter's event stream
pub type ChannelEvents = mpsc::UnboundedReceiver<ChannelEvent>;

enum Outbound {
    Text(String),
    Flush(oneshot::Sender<()>),
}

/// Publishes the terminal event exactly once
struct CloseSignal {
    fired: AtomicBool,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
}

impl CloseSignal {
    fn fire(&self, reason: String) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.event_tx.send(ChannelEvent::Closed(reason));
            self.cancel.cancel();
            return true;
        }
        false
    }

    fn fail(&self, reason: String) {
        let logged = reason.clone();
        if self.fire(reason) {
            tracing::warn!("Executor channel closed: {}", logged);
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Handle for sending to the executor
#[derive(Clone)]
pub struct ChannelAdapter {
    outbound: mpsc::Sender<Outbound>,
    signal: Arc<CloseSignal>,
    label: Arc<str>,
}

impl ChannelAdapter {
    /// Open the channel and start the writer and reader tasks
    ///
    /// `queue` bounds the number of commands waiting for the writer.
    pub async fn open(
        factory: &dyn ChannelFactory,
        queue: usize,
    ) -> Result<(Self, ChannelEvents), ChannelError> {
        let OpenedChannel {
            sink,
            stream,
            label,
        } = factory.open().await?;

        tracing::info!("Executor channel open ({})", label);

        let (outbound_tx, outbound_rx) = mpsc::channel(queue.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let signal = Arc::new(CloseSignal {
            fired: AtomicBool::new(false),
            event_tx: event_tx.clone(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(run_writer(sink, outbound_rx, signal.clone()));
        tokio::spawn(run_reader(stream, event_tx, signal.clone()));

        let adapter = Self {
            outbound: outbound_tx,
            signal,
            label: label.into(),
        };
        Ok((adapter, event_rx))
    }

    /// Enqueue one command
    pub async fn send(&self, command: &ExecutorCommand) -> Result<(), ChannelError> {
        tracing::trace!(
            "Sending {} for {}",
            command.operation().name(),
            command.id()
        );
        self.send_raw(FrameCodec::encode(command)).await
    }

    /// Enqueue raw executor source
    pub async fn send_raw(&self, text: String) -> Result<(), ChannelError> {
        if self.signal.is_fired() {
            return Err(ChannelError::Closed("channel already closed".into()));
        }
        self.outbound
            .send(Outbound::Text(text))
            .await
            .map_err(|_| ChannelError::Closed("writer stopped".into()))
    }

    /// Enqueue one command without waiting for queue space
    pub fn try_send(&self, command: &ExecutorCommand) -> Result<(), ChannelError> {
        if self.signal.is_fired() {
            return Err(ChannelError::Closed("channel already closed".into()));
        }
        self.outbound
            .try_send(Outbound::Text(FrameCodec::encode(command)))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ChannelError::Transport("command queue full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ChannelError::Closed("writer stopped".into())
                }
            })
    }

    /// Wait until everything enqueued so far has been handed to the transport
    pub async fn flush(&self) -> Result<(), ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound::Flush(tx))
            .await
            .map_err(|_| ChannelError::Closed("writer stopped".into()))?;
        rx.await
            .map_err(|_| ChannelError::Closed("writer stopped before flushing".into()))
    }

    /// Close the channel from the gateway side
    pub fn close(&self) {
        if self.signal.fire("closed by gateway".into()) {
            tracing::info!("Executor channel closed ({})", self.label);
        }
    }

    /// Whether the channel has closed
    pub fn is_closed(&self) -> bool {
        self.signal.is_fired()
    }

    /// Description of the channel for logs
    pub fn label(&self) -> &str {
        &self.label
    }
}

async fn run_writer(
    mut sink: ChannelSink,
    mut outbound: mpsc::Receiver<Outbound>,
    signal: Arc<CloseSignal>,
) {
    loop {
        let item = tokio::select! {
            _ = signal.cancel.cancelled() => break,
            item = outbound.recv() => item,
        };

        match item {
            Some(Outbound::Text(text)) => {
                let sent = tokio::select! {
                    _ = signal.cancel.cancelled() => break,
                    sent = sink.send(text) => sent,
                };
                if let Err(e) = sent {
                    signal.fail(format!("send failed: {}", e));
                    break;
                }
            }
            Some(Outbound::Flush(ack)) => {
                let flushed = tokio::select! {
                    _ = signal.cancel.cancelled() => break,
                    flushed = sink.flush() => flushed,
                };
                if let Err(e) = flushed {
                    signal.fail(format!("flush failed: {}", e));
                    break;
                }
                let _ = ack.send(());
            }
            // Every adapter handle is gone
            None => break,
        }
    }

    // A transport that stopped accepting data may never finish closing
    match tokio::time::timeout(SINK_CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::debug!("Error closing executor channel sink: {}", e),
        Err(_) => tracing::debug!("Executor channel sink did not close in time"),
    }
}

async fn run_reader(
    mut stream: ChannelStream,
    event_tx: mpsc::UnboundedSender<ChannelEvent>,
    signal: Arc<CloseSignal>,
) {
    loop {
        let next = tokio::select! {
            _ = signal.cancel.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(text)) => {
                if event_tx.send(ChannelEvent::Message(text)).is_err() {
                    // Nobody is listening anymore
                    signal.fail("event consumer dropped".into());
                    return;
                }
            }
            Some(Err(e)) => {
                signal.fail(e.to_string());
                return;
            }
            None => {
                signal.fail("executor ended the channel".into());
                return;
            }
        }
    }
}
