//! Multiplexed connection to a runner server.
//!
//! One TCP (optionally TLS) connection carries every RPC of a client. Unary
//! calls are matched to replies by id; execute streams are routed by id to
//! their response channel. A writer task owns the write half so frames of all
//! streams are serialized in send order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use runner_core::{
    ClientMessage, CreateSessionRequest, CreateSessionResponse, DeleteSessionRequest, Error,
    ExecuteResponse, Result, ServerMessage,
};

use crate::credentials::TransportCredentials;
use crate::transport::{ExecuteCall, RequestSink, RunnerTransport, SinkCommand};

/// Longest accepted envelope line.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Server name presented during the TLS handshake.
const TLS_DOMAIN: &str = "localhost";

struct Outgoing {
    message: ClientMessage,
    ack: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct Routes {
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>,
    streams: Mutex<HashMap<u64, mpsc::UnboundedSender<Result<ExecuteResponse>>>>,
}

impl Routes {
    fn route(&self, message: ServerMessage) {
        match message {
            ServerMessage::Execute { id, response } => match self.streams.lock().get(&id) {
                Some(tx) => {
                    let _ = tx.send(Ok(response));
                }
                None => debug!("Dropping frame for unknown stream {}", id),
            },
            ServerMessage::ExecuteEnd { id } => {
                debug!("Server ended stream {}", id);
                self.streams.lock().remove(&id);
            }
            ServerMessage::Error { id, message } => {
                let stream = self.streams.lock().remove(&id);
                match stream {
                    Some(tx) => {
                        let _ = tx.send(Err(Error::Rpc(message)));
                    }
                    None => self.reply(ServerMessage::Error { id, message }),
                }
            }
            other => self.reply(other),
        }
    }

    fn reply(&self, message: ServerMessage) {
        let id = message.id();
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => debug!("Dropping reply for unknown call {}", id),
        }
    }

    /// Drops every waiter; pending calls fail and streams end.
    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().clear();
        self.streams.lock().clear();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Client side of a runner server connection.
pub struct Connection {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    routes: Arc<Routes>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to `address` using `credentials`.
    pub async fn connect(address: &str, credentials: &TransportCredentials) -> Result<Self> {
        debug!("Connecting to runner server at {}", address);
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| Error::Transport(format!("failed to connect to {address}: {e}")))?;
        stream.set_nodelay(true)?;

        match credentials.connector()? {
            Some(connector) => {
                let tls = connector
                    .connect(TLS_DOMAIN, stream)
                    .await
                    .map_err(|e| Error::Transport(format!("TLS handshake failed: {e}")))?;
                info!("Connected to runner server at {} (tls)", address);
                Ok(Self::from_stream(tls))
            }
            None => {
                info!("Connected to runner server at {} (insecure)", address);
                Ok(Self::from_stream(stream))
            }
        }
    }

    /// Run the protocol over an already established byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let sink = FramedWrite::new(write_half, LinesCodec::new());

        let routes = Arc::new(Routes::default());
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(lines, Arc::clone(&routes)));
        let writer = tokio::spawn(write_loop(sink, outgoing_rx, Arc::clone(&routes)));

        Self {
            outgoing,
            routes,
            next_id: AtomicU64::new(1),
            tasks: Mutex::new(vec![reader, writer]),
        }
    }

    /// Whether the connection has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.routes.is_closed()
    }

    /// Close the connection without waiting for queued frames.
    pub fn shutdown(&self) {
        if !self.routes.is_closed() {
            info!("Closing runner connection");
        }
        self.routes.mark_closed();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::TransportNotActive)
        } else {
            Ok(())
        }
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn enqueue(&self, message: ClientMessage) -> Result<()> {
        self.outgoing
            .send(Outgoing { message, ack: None })
            .map_err(|_| Error::TransportNotActive)
    }

    async fn call(&self, build: impl FnOnce(u64) -> ClientMessage) -> Result<ServerMessage> {
        self.ensure_open()?;
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.routes.pending.lock().insert(id, tx);
        if self.is_closed() {
            self.routes.pending.lock().remove(&id);
            return Err(Error::TransportNotActive);
        }

        if let Err(e) = self.enqueue(build(id)) {
            self.routes.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(ServerMessage::Error { message, .. }) => Err(Error::Rpc(message)),
            Ok(reply) => Ok(reply),
            Err(_) => Err(Error::Transport(
                "connection closed before reply".to_string(),
            )),
        }
    }
}

fn unexpected(call: &str, reply: &ServerMessage) -> Error {
    Error::Rpc(format!("unexpected reply to {call}: {reply:?}"))
}

#[async_trait]
impl RunnerTransport for Connection {
    async fn health(&self) -> Result<bool> {
        match self.call(|id| ClientMessage::Health { id }).await? {
            ServerMessage::Health { serving, .. } => Ok(serving),
            other => Err(unexpected("health", &other)),
        }
    }

    async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse> {
        match self
            .call(|id| ClientMessage::CreateSession { id, request })
            .await?
        {
            ServerMessage::CreateSession { response, .. } => Ok(response),
            other => Err(unexpected("create_session", &other)),
        }
    }

    async fn delete_session(&self, request: DeleteSessionRequest) -> Result<()> {
        match self
            .call(|id| ClientMessage::DeleteSession { id, request })
            .await?
        {
            ServerMessage::DeleteSession { .. } => Ok(()),
            other => Err(unexpected("delete_session", &other)),
        }
    }

    async fn execute(&self) -> Result<ExecuteCall> {
        self.ensure_open()?;
        let id = self.allocate_id();
        let (response_tx, responses) = mpsc::unbounded_channel();
        self.routes.streams.lock().insert(id, response_tx);
        if self.is_closed() {
            self.routes.streams.lock().remove(&id);
            return Err(Error::TransportNotActive);
        }

        let (requests, commands) = RequestSink::channel();
        let forwarder = tokio::spawn(forward_requests(id, commands, self.outgoing.clone()));

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(forwarder);
        debug!("Opened execute stream {}", id);

        Ok(ExecuteCall {
            requests,
            responses,
        })
    }

    async fn close(&self) {
        self.shutdown();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn read_loop<R>(mut lines: FramedRead<R, LinesCodec>, routes: Arc<Routes>)
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("Runner connection read failed: {}", e);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerMessage>(&line) {
            Ok(message) => routes.route(message),
            Err(e) => warn!("Ignoring malformed server message: {}", e),
        }
    }
    debug!("Runner connection reached end of stream");
    routes.mark_closed();
}

async fn write_loop<W>(
    mut sink: FramedWrite<W, LinesCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    routes: Arc<Routes>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Outgoing { message, ack }) = outgoing.recv().await {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode message {}: {}", message.id(), e);
                continue;
            }
        };
        if let Err(e) = sink.send(line).await {
            warn!("Runner connection write failed: {}", e);
            break;
        }
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }
    routes.mark_closed();
}

/// Turns sink commands of stream `id` into envelopes; a dropped sink
/// half-closes the stream.
async fn forward_requests(
    id: u64,
    mut commands: mpsc::UnboundedReceiver<SinkCommand>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            SinkCommand::Frame(request) => {
                let message = ClientMessage::Execute { id, request };
                if outgoing.send(Outgoing { message, ack: None }).is_err() {
                    return;
                }
            }
            SinkCommand::Complete(ack) => {
                debug!("Half-closing execute stream {}", id);
                let message = ClientMessage::ExecuteEnd { id };
                let _ = outgoing.send(Outgoing {
                    message,
                    ack: Some(ack),
                });
                return;
            }
        }
    }
    let _ = outgoing.send(Outgoing {
        message: ClientMessage::ExecuteEnd { id },
        ack: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_core::ExecuteRequest;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_health_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let connection = Connection::from_stream(client);

        let server_task = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let message: ClientMessage = serde_json::from_str(&line).unwrap();
            let reply = ServerMessage::Health {
                id: message.id(),
                serving: true,
            };
            let mut text = serde_json::to_string(&reply).unwrap();
            text.push('\n');
            write.write_all(text.as_bytes()).await.unwrap();
            lines
        });

        assert!(connection.health().await.unwrap());
        let _lines = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_frames_carry_stream_id() {
        let (client, server) = tokio::io::duplex(4096);
        let connection = Connection::from_stream(client);
        let call = connection.execute().await.unwrap();
        call.requests
            .send(ExecuteRequest::input(b"x".to_vec()))
            .unwrap();

        let (read, _write) = tokio::io::split(server);
        let mut lines = BufReader::new(read).lines();
        let first: ClientMessage =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first, ClientMessage::Execute { .. }));

        drop(call.requests);
        let second: ClientMessage =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second, ClientMessage::ExecuteEnd { id: first.id() });
    }

    #[tokio::test]
    async fn test_shutdown_rejects_calls() {
        let (client, _server) = tokio::io::duplex(64);
        let connection = Connection::from_stream(client);
        connection.shutdown();
        assert!(connection.is_closed());
        assert!(matches!(
            connection.health().await,
            Err(Error::TransportNotActive)
        ));
        assert!(matches!(
            connection.execute().await,
            Err(Error::TransportNotActive)
        ));
    }

    #[tokio::test]
    async fn test_peer_close_ends_pending_calls() {
        let (client, server) = tokio::io::duplex(4096);
        let connection = Connection::from_stream(client);
        let peer = tokio::spawn(async move {
            let (read, _write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let _ = lines.next_line().await;
        });

        let result = connection.health().await;
        peer.await.unwrap();
        assert!(result.is_err());
    }
}
