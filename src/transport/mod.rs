//! Bidirectional bridge between the agent CLI and a sandbox.
//!
//! A transport makes the CLI believe it is a local process: its command
//! line is started as a backgrounded interactive process inside the
//! sandbox, stdin writes cross the backend boundary, and stdout comes
//! back as raw chunks that the shared JSON-stream parser turns into
//! typed events.

pub mod docker;
pub mod framing;
pub mod json_stream;
pub mod options;
pub mod remote;

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sandbox::error::SandboxError;

pub use options::AgentOptions;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value, SandboxError>> + Send>>;

/// Backpressure bound between the socket reader and the parser.
pub(crate) const STDOUT_CHANNEL_CAPACITY: usize = 32;
/// How often the exit monitor polls the backend.
pub(crate) const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Unconnected,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// One CLI invocation bridged into a sandbox. Lives for a single agent
/// turn.
#[async_trait]
pub trait CommandTransport: Send {
    /// Validate the sandbox handle, start the CLI, and spin up the
    /// stream reader and exit monitor tasks. A no-op when already
    /// connected; `NotReady` once the transport has been closed.
    async fn connect(&mut self) -> Result<(), SandboxError>;

    /// Write to the CLI's stdin. `NotReady` before connect, `InputClosed`
    /// after EOF.
    async fn write(&mut self, data: &str) -> Result<(), SandboxError>;

    /// Signal EOF exactly once.
    async fn end_input(&mut self) -> Result<(), SandboxError>;

    /// Parsed CLI events in emission order. The stream always ends, even
    /// after `close` or a mid-stream failure; a transport error surfaces
    /// as the final item after everything already parsed.
    fn read_messages(&mut self) -> EventStream;

    /// Tear down tasks and the backing socket/process. Idempotent, safe
    /// from any state, never fails.
    async fn close(&mut self);

    fn state(&self) -> TransportState;

    fn is_ready(&self) -> bool {
        self.state() == TransportState::Ready
    }
}

/// Record the first fatal error; later ones only get logged.
pub(crate) fn record_exit_error(slot: &Arc<Mutex<Option<SandboxError>>>, err: SandboxError) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if guard.is_none() {
        *guard = Some(err);
    } else {
        tracing::debug!(error = %err, "suppressing secondary transport error");
    }
}

/// State and plumbing shared by both concrete transports.
pub(crate) struct TransportCore {
    pub state: TransportState,
    stdout_tx: Option<mpsc::Sender<String>>,
    stdout_rx: Option<mpsc::Receiver<String>>,
    pub exit_error: Arc<Mutex<Option<SandboxError>>>,
    input_closed: bool,
    max_buffer_size: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl TransportCore {
    pub fn new(max_buffer_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(STDOUT_CHANNEL_CAPACITY);
        TransportCore {
            state: TransportState::Unconnected,
            stdout_tx: Some(tx),
            stdout_rx: Some(rx),
            exit_error: Arc::new(Mutex::new(None)),
            input_closed: false,
            max_buffer_size,
            tasks: Vec::new(),
        }
    }

    /// Hand the chunk sender to the reader task. Once taken, the stream
    /// ends when the reader drops it; `close` aborting the reader has
    /// the same effect.
    pub fn take_sender(&mut self) -> Option<mpsc::Sender<String>> {
        self.stdout_tx.take()
    }

    pub fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    pub fn ensure_writable(&self) -> Result<(), SandboxError> {
        if self.state != TransportState::Ready {
            return Err(SandboxError::NotReady);
        }
        if self.input_closed {
            return Err(SandboxError::InputClosed);
        }
        Ok(())
    }

    pub fn mark_input_closed(&mut self) -> Result<(), SandboxError> {
        self.ensure_writable()?;
        self.input_closed = true;
        Ok(())
    }

    /// Build the parsed-event stream, consuming the chunk receiver. The
    /// stream ends when every sender is gone (reader tasks aborted or
    /// finished), then surfaces any recorded fatal error.
    pub fn take_stream(&mut self) -> EventStream {
        let Some(mut rx) = self.stdout_rx.take() else {
            return Box::pin(futures::stream::empty());
        };
        let exit_error = self.exit_error.clone();
        let max_buffer_size = self.max_buffer_size;
        Box::pin(async_stream::stream! {
            let mut parser = json_stream::JsonStreamParser::new(max_buffer_size);
            while let Some(chunk) = rx.recv().await {
                match parser.feed(&chunk) {
                    Ok(values) => {
                        for value in values {
                            yield Ok(value);
                        }
                        if parser.finished() {
                            break;
                        }
                    }
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                }
            }
            if !parser.finished() {
                if let Err(err) = parser.finish() {
                    yield Err(err);
                    return;
                }
            }
            let pending = match exit_error.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(err) = pending {
                yield Err(err);
            }
        })
    }

    /// Abort tasks and drop the chunk sender so any consumer stream
    /// terminates. Permitted from any state, idempotent.
    pub fn close(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.state = TransportState::Closing;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.stdout_tx = None;
        self.input_closed = true;
        self.state = TransportState::Closed;
    }
}
