//! Transport abstraction shared by the real connection and the mock runner.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};

use runner_core::{
    CreateSessionRequest, CreateSessionResponse, DeleteSessionRequest, Error, ExecuteRequest,
    ExecuteResponse, Result,
};

/// Ordered stream of execute responses; `Err` ends the stream abnormally.
pub type ResponseStream = mpsc::UnboundedReceiver<Result<ExecuteResponse>>;

/// Command travelling through a request sink.
#[derive(Debug)]
pub enum SinkCommand {
    /// Send one request frame
    Frame(ExecuteRequest),
    /// Half-close the stream; the sender is acknowledged once flushed
    Complete(oneshot::Sender<()>),
}

/// Outgoing half of an execute stream.
///
/// Frames are delivered in the order they are sent.
#[derive(Debug, Clone)]
pub struct RequestSink {
    tx: mpsc::UnboundedSender<SinkCommand>,
}

impl RequestSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a request frame.
    pub fn send(&self, request: ExecuteRequest) -> Result<()> {
        self.tx
            .send(SinkCommand::Frame(request))
            .map_err(|_| Error::Transport("execute stream is closed".to_string()))
    }

    /// Half-close the stream and wait until the transport has flushed it.
    pub async fn complete(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(SinkCommand::Complete(ack_tx))
            .map_err(|_| Error::Transport("execute stream is closed".to_string()))?;
        ack_rx
            .await
            .map_err(|_| Error::Transport("execute stream dropped before completion".to_string()))
    }

    /// Whether the receiving side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Both halves of an open execute stream.
#[derive(Debug)]
pub struct ExecuteCall {
    /// Outgoing request frames
    pub requests: RequestSink,
    /// Incoming response frames
    pub responses: ResponseStream,
}

/// RPC surface of the runner server.
#[async_trait]
pub trait RunnerTransport: Send + Sync {
    /// Whether the server reports itself as serving.
    async fn health(&self) -> Result<bool>;

    /// Create a remote session.
    async fn create_session(&self, request: CreateSessionRequest)
        -> Result<CreateSessionResponse>;

    /// Delete a remote session.
    async fn delete_session(&self, request: DeleteSessionRequest) -> Result<()>;

    /// Open a duplex execute stream.
    async fn execute(&self) -> Result<ExecuteCall>;

    /// Close the transport; later calls fail with `TransportNotActive`.
    async fn close(&self);
}

/// Lifecycle of the transport as observed by its consumers.
#[derive(Clone)]
pub enum TransportState {
    /// No transport yet
    Disconnected,
    /// Transport ready for RPCs
    Ready(Arc<dyn RunnerTransport>),
    /// Transport gone; carries the server exit code when known
    Closed(Option<i32>),
}

impl TransportState {
    /// The ready transport, if any.
    pub fn transport(&self) -> Option<Arc<dyn RunnerTransport>> {
        match self {
            Self::Ready(transport) => Some(Arc::clone(transport)),
            _ => None,
        }
    }

    /// Whether RPCs may be issued.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Short state name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Ready(_) => "ready",
            Self::Closed(_) => "closed",
        }
    }
}

impl std::fmt::Debug for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Ready(_) => f.write_str("Ready"),
            Self::Closed(code) => f.debug_tuple("Closed").field(code).finish(),
        }
    }
}

/// Create a transport state channel starting at `Disconnected`.
pub fn transport_channel() -> (
    watch::Sender<TransportState>,
    watch::Receiver<TransportState>,
) {
    watch::channel(TransportState::Disconnected)
}

/// Publish a ready transport on a fresh channel.
pub fn ready_channel(
    transport: Arc<dyn RunnerTransport>,
) -> (
    watch::Sender<TransportState>,
    watch::Receiver<TransportState>,
) {
    watch::channel(TransportState::Ready(transport))
}
