//! Listener, handshake tasks and the single live socket.
//!
//! Background tasks here never touch bridge state. Accepted sockets and close
//! notifications travel to the tick through the [`MainThreadDispatcher`];
//! received frames travel through the inbound channel.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::auth::{redact_request, Credentials};
use crate::dispatch::MainThreadDispatcher;
use crate::envelope::ClientInfo;
use crate::error::HandshakeError;
use crate::handshake::{
    check_mount, error_response, read_request_head, switching_protocols_response,
    validate_upgrade, UpgradeRequest,
};

pub const MAX_MESSAGE_BYTES: usize = 2 * 1024 * 1024;
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const STATE_EVENT_CAPACITY: usize = 64;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub(crate) type WsStream = WebSocketStream<TcpStream>;
pub(crate) type WsSink = SplitSink<WsStream, Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    MessageTooBig,
    Transport(String),
    HeartbeatTimeout,
    Replaced,
    Reloading,
    Shutdown,
}

impl CloseReason {
    fn close_frame(&self) -> Option<CloseFrame> {
        let (code, reason) = match self {
            CloseReason::MessageTooBig => (CloseCode::Size, "message too big"),
            CloseReason::HeartbeatTimeout => (CloseCode::Policy, "heartbeat timeout"),
            CloseReason::Replaced => (CloseCode::Policy, "replaced by a newer connection"),
            CloseReason::Reloading => (CloseCode::Away, "editor reloading"),
            CloseReason::Shutdown => (CloseCode::Normal, "bridge stopped"),
            CloseReason::PeerClosed | CloseReason::Transport(_) => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

/// One received frame. `text` is `None` for control frames, which still
/// count as liveness.
#[derive(Debug)]
pub(crate) struct InboundFrame {
    pub connection_id: u64,
    pub received_at: Instant,
    pub text: Option<String>,
}

pub(crate) struct LiveSocket {
    id: u64,
    peer: SocketAddr,
    sink: Arc<Mutex<WsSink>>,
    reader_cancel: CancellationToken,
    client_info: Option<ClientInfo>,
}

impl Drop for LiveSocket {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}

struct Listener {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Clone)]
pub(crate) struct AcceptContext {
    pub mount_path: String,
    pub credentials: Arc<Credentials>,
    pub dispatcher: MainThreadDispatcher,
}

/// Owns the listener and at most one adopted socket.
pub struct ConnectionRegistry {
    state: ConnectionState,
    session_id: Option<String>,
    listener: Option<Listener>,
    live: Option<LiveSocket>,
    next_connection_id: u64,
    events: broadcast::Sender<ConnectionState>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (events, _rx) = broadcast::channel(STATE_EVENT_CAPACITY);
        Self {
            state: ConnectionState::Disconnected,
            session_id: None,
            listener: None,
            live: None,
            next_connection_id: 0,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    pub fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.live.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.live.as_ref().map(|l| l.peer)
    }

    pub fn client_info(&self) -> Option<&ClientInfo> {
        self.live.as_ref().and_then(|l| l.client_info.as_ref())
    }

    /// One event per transition, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.events.subscribe()
    }

    pub(crate) fn set_client_info(&mut self, info: ClientInfo) {
        if let Some(live) = self.live.as_mut() {
            live.client_info = Some(info);
        }
    }

    pub(crate) fn live_id(&self) -> Option<u64> {
        self.live.as_ref().map(|l| l.id)
    }

    pub(crate) fn live_sink(&self) -> Option<Arc<Mutex<WsSink>>> {
        self.live.as_ref().map(|l| l.sink.clone())
    }

    /// Binds and spawns the accept loop. A no-op while already listening.
    pub(crate) fn start(&mut self, addr: &str, ctx: AcceptContext) -> Result<()> {
        if self.listener.is_some() {
            tracing::debug!(addr, "bridge already listening");
            return Ok(());
        }

        let std_listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("bind bridge listener on {addr}"))?;
        std_listener
            .set_nonblocking(true)
            .context("set bridge listener non-blocking")?;
        let listener =
            TcpListener::from_std(std_listener).context("register bridge listener")?;
        let local_addr = listener
            .local_addr()
            .context("bridge listener local_addr")?;

        let cancel = CancellationToken::new();
        tokio::spawn(accept_loop(listener, ctx, cancel.clone()));

        let session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(%local_addr, %session_id, "bridge listening");
        self.listener = Some(Listener { local_addr, cancel });
        self.session_id = Some(session_id);
        self.set_state(ConnectionState::Connecting);
        Ok(())
    }

    /// Cancels the accept loop, closes the live socket and forgets the session.
    pub(crate) fn stop(&mut self, reason: CloseReason) {
        if let Some(listener) = self.listener.take() {
            tracing::info!(local_addr = %listener.local_addr, "bridge listener stopped");
        }
        if let Some(live) = self.live.take() {
            close_socket(live, reason);
        }
        self.session_id = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Replaces any prior socket with `ws`; the prior one is closed first.
    pub(crate) fn adopt(
        &mut self,
        ws: WsStream,
        peer: SocketAddr,
        inbound: mpsc::UnboundedSender<InboundFrame>,
        dispatcher: MainThreadDispatcher,
    ) -> u64 {
        if let Some(prior) = self.live.take() {
            tracing::info!(prior = %prior.peer, new = %peer, "replacing bridge connection");
            close_socket(prior, CloseReason::Replaced);
        }

        self.next_connection_id += 1;
        let id = self.next_connection_id;
        let (sink, stream) = ws.split();
        let reader_cancel = CancellationToken::new();
        tokio::spawn(read_loop(
            id,
            stream,
            inbound,
            dispatcher,
            reader_cancel.clone(),
        ));

        self.live = Some(LiveSocket {
            id,
            peer,
            sink: Arc::new(Mutex::new(sink)),
            reader_cancel,
            client_info: None,
        });
        self.set_state(ConnectionState::Connected);
        id
    }

    /// Tears down the live socket; falls back to `Connecting` while listening.
    pub(crate) fn drop_live(&mut self, reason: CloseReason) -> bool {
        let Some(live) = self.live.take() else {
            return false;
        };
        tracing::info!(peer = %live.peer, reason = ?reason, "bridge connection closed");
        close_socket(live, reason);
        let next = if self.listener.is_some() {
            ConnectionState::Connecting
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(next);
        true
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        tracing::info!(
            from = ?self.state,
            to = ?next,
            session_id = self.session_id.as_deref().unwrap_or(""),
            "bridge state changed"
        );
        self.state = next;
        let _ = self.events.send(next);
    }
}

/// Sends the close frame (if any) and shuts the socket down within
/// [`CLOSE_TIMEOUT`], without blocking the caller.
fn close_socket(live: LiveSocket, reason: CloseReason) {
    let sink = live.sink.clone();
    drop(live);
    let frame = reason.close_frame();
    tokio::spawn(async move {
        let _ = timeout(CLOSE_TIMEOUT, async move {
            let mut sink = sink.lock().await;
            if let Some(frame) = frame {
                let _ = sink.send(Message::Close(Some(frame))).await;
            }
            let _ = sink.close().await;
        })
        .await;
    });
}

pub(crate) fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_BYTES);
    config.max_frame_size = Some(MAX_MESSAGE_BYTES);
    config
}

async fn accept_loop(listener: TcpListener, ctx: AcceptContext, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::debug!(error = %err, "bridge accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let cancel = cancel.child_token();
                tokio::spawn(async move {
                    let negotiated = tokio::select! {
                        _ = cancel.cancelled() => return,
                        res = negotiate(stream, peer, &ctx) => res,
                    };
                    match negotiated {
                        Ok(ws) => {
                            ctx.dispatcher.post(move |bridge| bridge.adopt_socket(ws, peer));
                        }
                        Err(HandshakeError::Unauthorized(_)) => {}
                        Err(err) => {
                            tracing::warn!(%peer, error = %err, "bridge handshake failed");
                        }
                    }
                });
            }
        }
    }
    tracing::debug!("bridge accept loop exited");
}

async fn negotiate(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: &AcceptContext,
) -> Result<WsStream, HandshakeError> {
    let outcome = match timeout(HANDSHAKE_TIMEOUT, read_upgrade(&mut stream, peer, ctx)).await {
        Ok(res) => res,
        Err(_) => Err(HandshakeError::Timeout),
    };

    match outcome {
        Ok((upgrade, leftover)) => {
            stream
                .write_all(switching_protocols_response(&upgrade).as_bytes())
                .await?;
            let ws = WebSocketStream::from_partially_read(
                stream,
                leftover,
                Role::Server,
                Some(websocket_config()),
            )
            .await;
            Ok(ws)
        }
        Err(err) => {
            if let Some(status) = err.status() {
                let body = err.to_string();
                let _ = timeout(CLOSE_TIMEOUT, async {
                    let _ = stream
                        .write_all(error_response(status, &body).as_bytes())
                        .await;
                    let _ = stream.shutdown().await;
                })
                .await;
            }
            Err(err)
        }
    }
}

async fn read_upgrade(
    stream: &mut TcpStream,
    peer: SocketAddr,
    ctx: &AcceptContext,
) -> Result<(UpgradeRequest, Vec<u8>), HandshakeError> {
    let (request, leftover) = read_request_head(stream).await?;
    let upgrade = validate_upgrade(&request)?;
    check_mount(&request, &ctx.mount_path)?;
    if let Err(rejection) = ctx.credentials.authorize(&request) {
        tracing::warn!(
            %peer,
            reason = rejection.as_str(),
            request = %redact_request(&request),
            "bridge connection rejected"
        );
        return Err(HandshakeError::Unauthorized(rejection.as_str()));
    }
    Ok((upgrade, leftover))
}

async fn read_loop(
    id: u64,
    mut stream: SplitStream<WsStream>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    dispatcher: MainThreadDispatcher,
    cancel: CancellationToken,
) {
    let reason = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };
        let text = match next {
            Some(Ok(Message::Text(text))) => Some(text.as_str().to_string()),
            Some(Ok(Message::Binary(bin))) => match String::from_utf8(bin.to_vec()) {
                Ok(text) => Some(text),
                Err(_) => {
                    tracing::debug!(connection_id = id, "ignoring non-utf8 binary frame");
                    None
                }
            },
            Some(Ok(Message::Close(_))) | None => break CloseReason::PeerClosed,
            Some(Ok(_)) => None,
            Some(Err(WsError::Capacity(err))) => {
                tracing::warn!(connection_id = id, error = %err, "inbound message over limit");
                break CloseReason::MessageTooBig;
            }
            Some(Err(err)) => break CloseReason::Transport(err.to_string()),
        };
        let frame = InboundFrame {
            connection_id: id,
            received_at: Instant::now(),
            text,
        };
        if inbound.send(frame).is_err() {
            return;
        }
    };
    dispatcher.post(move |bridge| bridge.handle_socket_closed(id, reason));
}
