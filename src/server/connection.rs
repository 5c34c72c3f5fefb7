//! Per-connection WebSocket task

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, Result};
use crate::router::Router;
use crate::server::config::ServerConfig;
use crate::session::{OutboundFrame, SessionHandle, SessionState};

/// How long queued frames may take to flush after the read side ends
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

type WsStream = SplitStream<WebSocketStream<TcpStream>>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Frames read while an earlier frame is still being handled
///
/// The socket keeps being polled during a backpressured submit so that a
/// close is seen at once. Read-ahead stops once `limit` bytes are held,
/// which keeps the transcoder's backpressure reaching the client.
struct ReadAhead {
    frames: VecDeque<Message>,
    bytes: usize,
    limit: usize,
}

impl ReadAhead {
    fn new(limit: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            limit,
        }
    }

    fn has_room(&self) -> bool {
        self.bytes < self.limit
    }

    fn push(&mut self, message: Message) {
        self.bytes += message.len();
        self.frames.push_back(message);
    }

    fn pop(&mut self) -> Option<Message> {
        let message = self.frames.pop_front()?;
        self.bytes -= message.len();
        Some(message)
    }
}

/// What the socket said while a frame was being handled
enum Interrupt {
    Closed,
    Failed(Error),
}

/// A transport session from upgrade to close
pub struct Connection {
    session_id: u64,
    socket: Option<TcpStream>,
    peer_addr: SocketAddr,
    config: ServerConfig,
    router: Arc<Router>,
}

impl Connection {
    pub fn new(
        session_id: u64,
        socket: TcpStream,
        peer_addr: SocketAddr,
        config: ServerConfig,
        router: Arc<Router>,
    ) -> Self {
        Self {
            session_id,
            socket: Some(socket),
            peer_addr,
            config,
            router,
        }
    }

    /// Upgrade, serve frames until the client goes away, then clean up
    ///
    /// Registry cleanup runs whatever the reason the read side ended.
    pub async fn run(&mut self) -> Result<()> {
        let Some(socket) = self.socket.take() else {
            return Ok(());
        };

        let ws_config = WebSocketConfig {
            max_message_size: Some(self.config.max_message_size),
            ..Default::default()
        };
        let handshake = tokio_tungstenite::accept_async_with_config(socket, Some(ws_config));
        let ws = match tokio::time::timeout(self.config.connection_timeout, handshake).await {
            Ok(ws) => ws?,
            Err(_) => {
                tracing::debug!(
                    session_id = self.session_id,
                    peer = %self.peer_addr,
                    "WebSocket handshake timed out"
                );
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "WebSocket handshake timed out",
                )));
            }
        };

        tracing::debug!(
            session_id = self.session_id,
            peer = %self.peer_addr,
            "WebSocket established"
        );

        let (handle, outbound) =
            SessionHandle::channel(self.session_id, self.config.outbound_queue_capacity);
        let mut state = SessionState::new(handle, self.peer_addr);

        let (sink, stream) = ws.split();
        let mut writer = tokio::spawn(write_loop(self.session_id, sink, outbound));

        let result = self.read_loop(&mut state, stream).await;

        self.router.close(&mut state).await;
        tracing::debug!(
            session_id = self.session_id,
            received = state.messages_received,
            rejected = state.messages_rejected,
            duration_secs = state.duration().as_secs(),
            "Session ended"
        );

        // Dropping the state drops the last handle, so the writer sees the
        // queue end after flushing what is left.
        drop(state);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }

        result
    }

    /// Handle frames in arrival order until close, error or `leave`
    async fn read_loop(&self, state: &mut SessionState, mut stream: WsStream) -> Result<()> {
        let mut ahead = ReadAhead::new(self.config.max_message_size);

        loop {
            let message = match ahead.pop() {
                Some(message) => message,
                None => match stream.next().await {
                    Some(message) => message?,
                    None => break,
                },
            };

            if let Message::Close(_) = message {
                break;
            }

            // Dropping an unfinished handler abandons its backpressure wait
            let interrupt = {
                let handled = self.handle(state, message);
                tokio::pin!(handled);

                loop {
                    tokio::select! {
                        biased;
                        _ = &mut handled => break None,
                        next = stream.next(), if ahead.has_room() => match next {
                            Some(Ok(Message::Close(_))) | None => break Some(Interrupt::Closed),
                            Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                                ahead.push(message)
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => break Some(Interrupt::Failed(e.into())),
                        },
                    }
                }
            };

            match interrupt {
                None => {}
                Some(Interrupt::Closed) => {
                    tracing::debug!(
                        session_id = self.session_id,
                        "Transport closed while a frame was in flight"
                    );
                    break;
                }
                Some(Interrupt::Failed(e)) => return Err(e),
            }

            if state.is_closed() {
                break;
            }
        }

        Ok(())
    }

    async fn handle(&self, state: &mut SessionState, message: Message) {
        match message {
            Message::Text(text) => self.router.handle_text(state, &text).await,
            Message::Binary(data) => self.router.handle_binary(state, Bytes::from(data)).await,
            // Pings are answered by tungstenite
            _ => {}
        }
    }
}

async fn write_loop(
    session_id: u64,
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<OutboundFrame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(Message::Text(frame.to_string())).await {
            tracing::debug!(session_id = session_id, error = %e, "WebSocket write failed");
            return;
        }
    }

    let _ = sink.close().await;
}
