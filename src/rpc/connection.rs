//! Connection lifecycle: open, close, reconnect.
//!
//! All mutable connection state sits behind one mutex that is never held
//! across an await. Every socket gets a generation number; reader, writer
//! and heartbeat tasks carry the generation they were spawned for, and
//! anything they report for an older generation is ignored.
//!
//! Lock order is connection state first, then the pending table.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::codec::{decode_frame, encode_request, response_id};
use super::error::RpcError;
use super::events::{ClientEvent, EventBus};
use super::heartbeat;
use super::pending::PendingTable;
use crate::config::ClientConfig;
use crate::endpoint::EndpointResolver;
use crate::models::{ConnectionInfo, ConnectionState};

/// Clean, caller-initiated close.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close frame carried no status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Connection dropped without a close frame, or was forced closed.
pub const ABNORMAL_CLOSURE: u16 = 1006;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SharedConnect = Shared<BoxFuture<'static, Result<(), RpcError>>>;

/// Tasks and outbound channel of one live socket.
struct SocketHandle {
    /// Frames for the writer task; the only way onto the socket.
    outbound: mpsc::UnboundedSender<Message>,
    /// Routes inbound frames and reports the close.
    reader: JoinHandle<()>,
    /// Drains `outbound` into the sink.
    writer: JoinHandle<()>,
    /// Liveness monitor for this socket.
    heartbeat: JoinHandle<()>,
}

impl SocketHandle {
    fn shutdown(self) {
        self.heartbeat.abort();
        self.reader.abort();
        self.writer.abort();
    }
}

/// The connection record.
struct Connection {
    state: ConnectionState,
    /// Router to connect (and reconnect) to. Cleared by `disconnect`.
    target: Option<String>,
    /// Bumped for every new socket attempt.
    generation: u64,
    /// Present while `Open` or `Closing`.
    socket: Option<SocketHandle>,
    /// In-flight open attempt and its target, joinable by other callers.
    attempt: Option<(String, SharedConnect)>,
    /// Automatic reconnects since the last successful open.
    reconnect_attempts: u32,
    /// Pending backoff sleep before the next automatic reconnect.
    reconnect_task: Option<JoinHandle<()>>,
    /// Last time the socket proved alive (open or heartbeat answer).
    last_liveness: Option<Instant>,
    connected_at: Option<DateTime<Utc>>,
}

impl Connection {
    fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target: None,
            generation: 0,
            socket: None,
            attempt: None,
            reconnect_attempts: 0,
            reconnect_task: None,
            last_liveness: None,
            connected_at: None,
        }
    }

    fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.last_liveness = None;
        self.connected_at = None;
    }

    fn is_open(&self, generation: u64) -> bool {
        self.generation == generation
            && self.state == ConnectionState::Open
            && self.socket.is_some()
    }
}

/// Shared core of [`super::RouterOsClient`].
pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    resolver: Arc<dyn EndpointResolver>,
    pub(crate) pending: PendingTable,
    pub(crate) events: EventBus,
    state: Mutex<Connection>,
}

impl Inner {
    pub(crate) fn new(config: ClientConfig, resolver: Arc<dyn EndpointResolver>) -> Self {
        Self {
            config,
            resolver,
            pending: PendingTable::new(),
            events: EventBus::new(),
            state: Mutex::new(Connection::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Opening
    // ------------------------------------------------------------------

    /// Open (or join the open attempt for) the socket for `target`.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        target: &str,
        force: bool,
    ) -> Result<(), RpcError> {
        let (attempt, replaced) = {
            let mut conn = self.lock();

            if !force
                && conn.state == ConnectionState::Open
                && conn.target.as_deref() == Some(target)
            {
                trace!("Already connected to {}", target);
                return Ok(());
            }

            match joinable_attempt(&conn, target).filter(|_| !force) {
                Some(attempt) => {
                    debug!("Joining in-flight connection attempt to {}", target);
                    (attempt, false)
                }
                None => self.start_attempt(&mut conn, target)?,
            }
        };

        if replaced {
            self.events.emit(&ClientEvent::Disconnected {
                code: NORMAL_CLOSURE,
                reason: "connection replaced".to_string(),
            });
        }

        attempt.await
    }

    /// Tear down whatever is there and spawn a fresh open attempt.
    ///
    /// Returns the shared attempt and whether a live socket was replaced.
    fn start_attempt(
        self: &Arc<Self>,
        conn: &mut Connection,
        target: &str,
    ) -> Result<(SharedConnect, bool), RpcError> {
        let url = self.resolver.resolve(target)?;

        if let Some(task) = conn.reconnect_task.take() {
            task.abort();
        }

        let replaced = match conn.socket.take() {
            Some(socket) => {
                debug!(
                    "Closing socket for {} before reconnecting",
                    conn.target.as_deref().unwrap_or("?")
                );
                socket.shutdown();
                self.pending
                    .reject_all(&RpcError::Disconnected("connection replaced".to_string()));
                true
            }
            None => false,
        };

        conn.generation += 1;
        conn.state = ConnectionState::Connecting;
        conn.target = Some(target.to_string());
        conn.last_liveness = None;
        conn.connected_at = None;

        info!("Connecting to {} ({})", target, url);
        let task = tokio::spawn(open_socket(
            Arc::downgrade(self),
            conn.generation,
            target.to_string(),
            url,
            self.config.connect_timeout(),
        ));
        let attempt = async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(RpcError::ConnectionFailed(format!(
                    "connection task ended unexpectedly: {}",
                    e
                ))),
            }
        }
        .boxed()
        .shared();

        conn.attempt = Some((target.to_string(), attempt.clone()));
        Ok((attempt, replaced))
    }

    /// Install a freshly opened socket, unless it was superseded meanwhile.
    fn establish(
        self: &Arc<Self>,
        generation: u64,
        target: &str,
        stream: WsStream,
    ) -> Result<(), RpcError> {
        let mut conn = self.lock();
        if conn.generation != generation {
            drop(conn);
            debug!("Discarding superseded socket for {}", target);
            return Err(RpcError::Disconnected(
                "connection attempt superseded".to_string(),
            ));
        }

        let (sink, stream) = stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let weak = Arc::downgrade(self);

        let writer = tokio::spawn(write_loop(weak.clone(), generation, sink, outbound_rx));
        let reader = tokio::spawn(read_loop(weak.clone(), generation, stream));
        let heartbeat = heartbeat::spawn(
            weak,
            generation,
            self.config.heartbeat_interval(),
            self.config.heartbeat_timeout(),
        );

        conn.socket = Some(SocketHandle {
            outbound,
            reader,
            writer,
            heartbeat,
        });
        conn.state = ConnectionState::Open;
        conn.reconnect_attempts = 0;
        conn.last_liveness = Some(Instant::now());
        conn.connected_at = Some(Utc::now());
        conn.attempt = None;
        drop(conn);

        info!("Connected to {}", target);
        self.events.emit(&ClientEvent::Connected {
            target: target.to_string(),
        });
        Ok(())
    }

    fn attempt_failed(&self, generation: u64, target: &str, err: &RpcError) {
        {
            let mut conn = self.lock();
            if conn.generation != generation {
                return;
            }
            conn.attempt = None;
            conn.mark_disconnected();
        }

        warn!("Connection to {} failed: {}", target, err);
        self.events.emit(&ClientEvent::Error {
            message: err.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Report a transport error on the open socket of `generation`.
    ///
    /// The close that follows is handled separately.
    fn socket_error(&self, generation: u64, message: &str) {
        if !self.lock().is_open(generation) {
            return;
        }
        warn!("Socket error: {}", message);
        self.events.emit(&ClientEvent::Error {
            message: message.to_string(),
        });
    }

    /// React to the socket of `generation` closing.
    ///
    /// Pending requests are rejected before the lock is released. Anything
    /// but a normal closure schedules an automatic reconnect.
    fn on_socket_closed(self: &Arc<Self>, generation: u64, code: u16, reason: &str) {
        let socket = {
            let mut conn = self.lock();
            if conn.generation != generation {
                trace!("Ignoring close of stale socket (generation {})", generation);
                return;
            }
            let Some(socket) = conn.socket.take() else {
                return;
            };
            conn.mark_disconnected();
            self.pending.reject_all(&RpcError::Disconnected(format!(
                "socket closed with code {}",
                code
            )));
            socket
        };
        socket.shutdown();

        if code == NORMAL_CLOSURE {
            info!("Connection closed normally");
        } else {
            warn!("Connection closed with code {}: {}", code, reason);
        }
        self.events.emit(&ClientEvent::Disconnected {
            code,
            reason: reason.to_string(),
        });

        if code != NORMAL_CLOSURE {
            self.schedule_reconnect();
        }
    }

    /// Drop the open socket of `generation` without a close handshake.
    ///
    /// No automatic reconnect is scheduled; the caller decides whether to
    /// reconnect. Returns `false` if that socket is no longer open.
    pub(crate) fn force_close(&self, generation: u64, reason: &str) -> bool {
        let socket = {
            let mut conn = self.lock();
            if !conn.is_open(generation) {
                return false;
            }
            let Some(socket) = conn.socket.take() else {
                return false;
            };
            conn.mark_disconnected();
            self.pending.reject_all(&RpcError::Disconnected(
                "connection forced closed".to_string(),
            ));
            socket
        };
        socket.shutdown();

        warn!("Forced connection closed: {}", reason);
        self.events.emit(&ClientEvent::Disconnected {
            code: ABNORMAL_CLOSURE,
            reason: reason.to_string(),
        });
        true
    }

    /// Caller-initiated close.
    ///
    /// Cancels any scheduled reconnect and forgets the target. An open socket
    /// goes through the close handshake; the `disconnected` event fires once
    /// the peer answers (or the handshake times out).
    pub(crate) fn disconnect(&self) {
        let mut conn = self.lock();
        if let Some(task) = conn.reconnect_task.take() {
            task.abort();
        }
        conn.target = None;
        conn.reconnect_attempts = 0;

        if conn.attempt.take().is_some() {
            // Orphan the in-flight attempt.
            conn.generation += 1;
        }

        self.pending.reject_all(&RpcError::Disconnected(
            "disconnected by client".to_string(),
        ));

        let generation = conn.generation;
        let closing = match &conn.socket {
            Some(socket) if conn.state == ConnectionState::Open => {
                socket.heartbeat.abort();
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::from_static("client disconnect"),
                };
                socket.outbound.send(Message::Close(Some(frame))).is_ok()
            }
            _ => false,
        };

        if closing {
            conn.state = ConnectionState::Closing;
            drop(conn);
            info!("Disconnecting (generation {})", generation);
            return;
        }

        let socket = conn.socket.take();
        conn.mark_disconnected();
        drop(conn);

        match socket {
            Some(socket) => {
                socket.shutdown();
                self.events.emit(&ClientEvent::Disconnected {
                    code: NORMAL_CLOSURE,
                    reason: "client disconnect".to_string(),
                });
            }
            None => debug!("Disconnect requested with no open socket"),
        }
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    /// Schedule the next automatic reconnect, or give up at the limit.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        let mut conn = self.lock();
        let Some(target) = conn.target.clone() else {
            return;
        };
        if conn.state != ConnectionState::Disconnected
            || conn.attempt.is_some()
            || conn.reconnect_task.is_some()
        {
            return;
        }

        if conn.reconnect_attempts >= self.config.max_reconnect_attempts {
            let attempts = conn.reconnect_attempts;
            drop(conn);
            warn!(
                "Giving up on {} after {} reconnect attempt(s)",
                target, attempts
            );
            self.events
                .emit(&ClientEvent::MaxReconnectAttemptsReached { attempts });
            return;
        }

        conn.reconnect_attempts += 1;
        let attempt = conn.reconnect_attempts;
        let delay = self.config.reconnect_delay(attempt);
        info!(
            "Reconnecting to {} in {:?} (attempt {}/{})",
            target, delay, attempt, self.config.max_reconnect_attempts
        );

        let weak = Arc::downgrade(self);
        // Stored under the same lock, so the task cannot observe a missing handle.
        conn.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.run_scheduled_reconnect(target).await;
            }
        }));
    }

    async fn run_scheduled_reconnect(self: &Arc<Self>, target: String) {
        let attempt = {
            let mut conn = self.lock();
            // Our own handle; dropping it detaches.
            conn.reconnect_task = None;

            if conn.target.as_deref() != Some(target.as_str())
                || conn.state == ConnectionState::Open
            {
                return;
            }

            match joinable_attempt(&conn, &target) {
                Some(attempt) => attempt,
                None => match self.start_attempt(&mut conn, &target) {
                    Ok((attempt, _)) => attempt,
                    Err(e) => {
                        warn!("Cannot reconnect to {}: {}", target, e);
                        return;
                    }
                },
            }
        };

        if let Err(e) = attempt.await {
            debug!("Scheduled reconnect to {} failed: {}", target, e);
            self.schedule_reconnect();
        }
    }

    pub(crate) fn reset_reconnect_attempts(&self) {
        self.lock().reconnect_attempts = 0;
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Generation of the open socket, if any.
    pub(crate) fn open_generation(&self) -> Option<u64> {
        let conn = self.lock();
        conn.is_open(conn.generation).then_some(conn.generation)
    }

    /// Make sure a socket is open, reconnecting to the known target if
    /// needed. Returns the open socket's generation.
    pub(crate) async fn ensure_open(self: &Arc<Self>) -> Result<u64, RpcError> {
        let target = {
            let conn = self.lock();
            if conn.is_open(conn.generation) {
                return Ok(conn.generation);
            }
            conn.target.clone()
        };

        let Some(target) = target else {
            return Err(RpcError::NotConnected);
        };
        debug!("Not connected; reconnecting to {} before sending", target);
        self.connect(&target, false).await?;

        self.open_generation()
            .ok_or_else(|| RpcError::Disconnected("connection lost while opening".to_string()))
    }

    /// Queue a frame on the socket of `generation`.
    ///
    /// The only path to the socket.
    fn write(&self, generation: u64, message: Message) -> Result<(), RpcError> {
        let conn = self.lock();
        if !conn.is_open(generation) {
            return Err(RpcError::Disconnected("connection is not open".to_string()));
        }
        match &conn.socket {
            Some(socket) => socket
                .outbound
                .send(message)
                .map_err(|_| RpcError::Transport("socket writer has stopped".to_string())),
            None => Err(RpcError::Disconnected("connection is not open".to_string())),
        }
    }

    /// Send one request on the socket of `generation` and wait for its
    /// response.
    pub(crate) async fn dispatch(
        &self,
        generation: u64,
        message: &Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        let action = message
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let (slot, response_rx) = self.pending.register(action);
        let id = slot.id();

        let frame = encode_request(message, id)?;
        self.write(generation, Message::text(frame))?;
        trace!("Sent request {} ({})", id, action);

        match tokio::time::timeout(timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Disconnected("request abandoned".to_string())),
            Err(_) => {
                debug!("Request {} ({}) timed out after {:?}", id, action, timeout);
                Err(RpcError::Timeout(timeout.as_millis() as u64))
            }
        }
    }

    fn route_frame(&self, raw: &[u8]) {
        let Some(value) = decode_frame(raw) else {
            return;
        };

        let unsolicited = match response_id(&value) {
            Some(id) => match self.pending.complete(id, value) {
                Ok(()) => return,
                Err(value) => {
                    debug!("No pending request for id {}; treating as event", id);
                    value
                }
            },
            None => value,
        };
        self.events.emit(&ClientEvent::Message(unsolicited));
    }

    // ------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------

    pub(crate) fn record_liveness(&self, generation: u64) {
        let mut conn = self.lock();
        if conn.is_open(generation) {
            conn.last_liveness = Some(Instant::now());
        }
    }

    /// Target and time since the last liveness signal of the socket of
    /// `generation`, or `None` once that socket is gone.
    pub(crate) fn liveness(&self, generation: u64) -> Option<(String, Duration)> {
        let conn = self.lock();
        if !conn.is_open(generation) {
            return None;
        }
        let target = conn.target.clone()?;
        let age = conn
            .last_liveness
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        Some((target, age))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn target(&self) -> Option<String> {
        self.lock().target.clone()
    }

    pub(crate) fn snapshot(&self) -> ConnectionInfo {
        let conn = self.lock();
        ConnectionInfo {
            state: conn.state,
            target: conn.target.clone(),
            reconnect_attempts: conn.reconnect_attempts,
            pending_requests: self.pending.len(),
            connected_at: conn.connected_at,
        }
    }
}

fn joinable_attempt(conn: &Connection, target: &str) -> Option<SharedConnect> {
    match &conn.attempt {
        Some((pending_target, attempt)) if pending_target == target => Some(attempt.clone()),
        _ => None,
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let conn = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = conn.reconnect_task.take() {
            task.abort();
        }
        if let Some(socket) = conn.socket.take() {
            socket.shutdown();
        }
    }
}

// ----------------------------------------------------------------------
// Socket tasks
// ----------------------------------------------------------------------

async fn open_socket(
    inner: Weak<Inner>,
    generation: u64,
    target: String,
    url: Url,
    timeout: Duration,
) -> Result<(), RpcError> {
    let outcome = match tokio::time::timeout(timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(match RpcError::from(e) {
            RpcError::Transport(msg) | RpcError::Disconnected(msg) => {
                RpcError::ConnectionFailed(msg)
            }
            other => other,
        }),
        Err(_) => Err(RpcError::ConnectTimeout(timeout.as_millis() as u64)),
    };

    let Some(inner) = inner.upgrade() else {
        return Err(RpcError::NotConnected);
    };
    match outcome {
        Ok(stream) => inner.establish(generation, &target, stream),
        Err(e) => {
            inner.attempt_failed(generation, &target, &e);
            Err(e)
        }
    }
}

async fn read_loop(inner: Weak<Inner>, generation: u64, mut stream: SplitStream<WsStream>) {
    let (code, reason) = loop {
        let frame = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let reason = e.to_string();
                if let Some(client) = inner.upgrade() {
                    client.socket_error(generation, &reason);
                }
                break (ABNORMAL_CLOSURE, reason);
            }
            None => break (ABNORMAL_CLOSURE, "connection dropped".to_string()),
        };

        let Some(client) = inner.upgrade() else {
            return;
        };
        match frame {
            Message::Text(text) => client.route_frame(text.as_str().as_bytes()),
            Message::Binary(data) => client.route_frame(&data),
            Message::Close(Some(close)) => {
                break (u16::from(close.code), close.reason.as_str().to_string())
            }
            Message::Close(None) => break (NO_STATUS_RECEIVED, String::new()),
            // Pings are answered by tungstenite.
            _ => {}
        }
    };

    if let Some(client) = inner.upgrade() {
        client.on_socket_closed(generation, code, &reason);
    }
}

async fn write_loop(
    inner: Weak<Inner>,
    generation: u64,
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));

        if let Err(e) = sink.send(message).await {
            if !closing {
                if let Some(client) = inner.upgrade() {
                    client.socket_error(generation, &format!("write failed: {}", e));
                    client.force_close(generation, "write failed");
                }
                return;
            }
        }

        if closing {
            break;
        }
    }

    // Close handshake: the reader finishes it when the peer answers.
    let Some(timeout) = inner.upgrade().map(|c| c.config.connect_timeout()) else {
        return;
    };
    tokio::time::sleep(timeout).await;
    if let Some(client) = inner.upgrade() {
        debug!("Close handshake timed out");
        client.on_socket_closed(generation, NORMAL_CLOSURE, "close handshake timed out");
    }
}
