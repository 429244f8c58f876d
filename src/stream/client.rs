//! Room event client and its reconnecting connection worker.
//!
//! [`RoomEventClient`] is bound to one room. `connect()` spawns a background
//! worker that owns the socket's inbound side, feeds frames through the
//! message router, and reconnects on unsolicited closure following the retry
//! schedule. Reconnects resume from the last applied sequence number.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};

use crate::cursor::CursorStore;
use crate::retry::RetrySchedule;
use crate::stream::correlator::Correlator;
use crate::stream::proto::{ClientMessage, ServerMessage};
use crate::stream::router::{ListenerHandle, Listeners, MessageRouter, SharedCursor};
use crate::stream::transport::{Connector, SocketHandle, WsConnector};

/// Local development websocket base URL.
pub const DEFAULT_WS_URL_BASE: &str = "ws://localhost:8000";
/// Environment variable read by [`RoomClientConfig::from_env`].
pub const WS_URL_BASE_ENV: &str = "GAMEROOM_WS_URL_BASE";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RoomClientDefaults;

impl RoomClientDefaults {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Identity of the room stream a client follows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomClientConfig {
    /// Websocket base URL, e.g. `ws://localhost:8000`.
    pub base_url: String,
    /// Room to follow.
    pub room_id: u64,
    /// Cursor to resume from on the first connect.
    pub initial_cursor: Option<i64>,
}

impl RoomClientConfig {
    pub fn new(base_url: impl Into<String>, room_id: u64) -> Self {
        Self {
            base_url: base_url.into(),
            room_id,
            initial_cursor: None,
        }
    }

    /// Uses `GAMEROOM_WS_URL_BASE`, falling back to [`DEFAULT_WS_URL_BASE`].
    pub fn from_env(room_id: u64) -> Self {
        let base_url = std::env::var(WS_URL_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WS_URL_BASE.to_string());
        Self::new(base_url, room_id)
    }

    pub fn with_initial_cursor(mut self, cursor: Option<i64>) -> Self {
        self.initial_cursor = cursor;
        self
    }
}

/// Tunables for reconnects and correlated requests.
#[derive(Clone, Debug)]
pub struct RoomClientOptions {
    pub retry_schedule: RetrySchedule,
    /// Timeout used by the convenience request helpers.
    pub request_timeout: Duration,
}

impl Default for RoomClientOptions {
    fn default() -> Self {
        Self {
            retry_schedule: RetrySchedule::default(),
            request_timeout: RoomClientDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Connection lifecycle published by the worker.
///
/// Listeners are not told about transient disconnects; callers that care
/// watch this channel instead.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// Errors produced by the room client.
#[derive(Debug, Error)]
pub enum RoomClientError {
    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No socket is currently open.
    #[error("websocket is not connected")]
    NotConnected,

    /// The client was closed and cannot be reused.
    #[error("room client is closed")]
    Closed,

    /// The server rejected a correlated request.
    #[error("request rejected ({code}): {message}")]
    Response { code: String, message: String },

    /// No response arrived for a correlated request in time.
    #[error("no response for {event_key} within {timeout:?}")]
    ResponseTimeout { event_key: String, timeout: Duration },

    /// A bounded retry schedule ran out.
    #[error("gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// Runtime or protocol contract error.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RoomClientError {
    /// `true` for failures where the server never answered.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ResponseTimeout { .. })
    }
}

/// Builds the websocket URL for a room.
///
/// A missing or zero cursor omits `last_seq`, asking the server for a full
/// snapshot only.
pub fn room_endpoint(base_url: &str, room_id: u64, cursor: Option<i64>) -> String {
    let base = base_url.trim().trim_end_matches('/');
    match cursor {
        Some(cursor) if cursor != 0 => format!("{base}/ws/game_rooms/{room_id}?last_seq={cursor}"),
        _ => format!("{base}/ws/game_rooms/{room_id}"),
    }
}

/// State shared between the client facade and its worker.
struct Shared {
    room_id: u64,
    base_url: String,
    closed: AtomicBool,
    shutdown: Notify,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    status: watch::Sender<ConnectionStatus>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    /// Marks the client unusable after the worker stops on its own.
    fn terminate(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.outbound().take();
        self.set_status(ConnectionStatus::Closed);
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<String>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_text(&self, text: String) -> Result<(), RoomClientError> {
        match self.outbound().as_ref() {
            Some(tx) => tx.send(text).map_err(|_| RoomClientError::NotConnected),
            None if self.is_closed() => Err(RoomClientError::Closed),
            None => Err(RoomClientError::NotConnected),
        }
    }
}

/// Live, reconnecting view of one game room's event stream.
pub struct RoomEventClient {
    shared: Arc<Shared>,
    listeners: Listeners,
    cursor: SharedCursor,
    correlator: Correlator,
    store: CursorStore,
    connector: Arc<dyn Connector>,
    options: RoomClientOptions,
    worker: Mutex<Option<JoinHandle<Result<(), RoomClientError>>>>,
    started: AtomicBool,
}

impl RoomEventClient {
    /// Creates an unconnected client with the websocket connector and an
    /// in-memory cursor store.
    pub fn new(config: RoomClientConfig) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                room_id: config.room_id,
                base_url: config.base_url,
                closed: AtomicBool::new(false),
                shutdown: Notify::new(),
                outbound: Mutex::new(None),
                status,
            }),
            listeners: Listeners::default(),
            cursor: SharedCursor::new(config.initial_cursor),
            correlator: Correlator::default(),
            store: CursorStore::default(),
            connector: Arc::new(WsConnector),
            options: RoomClientOptions::default(),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Persists cursors through `store`.
    ///
    /// When the client holds no cursor yet, the stored one is used on connect.
    pub fn with_cursor_store(mut self, store: CursorStore) -> Self {
        self.store = store;
        self
    }

    /// Replaces the transport connector.
    pub fn with_connector(mut self, connector: impl Connector) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn with_options(mut self, options: RoomClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn room_id(&self) -> u64 {
        self.shared.room_id
    }

    /// Last applied sequence number, for diagnostics.
    pub fn last_seq(&self) -> Option<i64> {
        self.cursor.get()
    }

    /// URL the next connection attempt would use.
    pub fn endpoint(&self) -> String {
        let cursor = self
            .cursor
            .get()
            .or_else(|| self.store.get(self.shared.room_id, None));
        room_endpoint(&self.shared.base_url, self.shared.room_id, cursor)
    }

    /// Receiver for connection lifecycle changes.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Starts the connection worker.
    ///
    /// Returns immediately; the socket opens in the background and transport
    /// failures are handled as closures. Calling `connect` again while the
    /// worker runs is a no-op. Must be called from within a Tokio runtime.
    pub fn connect(&self) -> Result<(), RoomClientError> {
        if self.shared.is_closed() {
            return Err(RoomClientError::Closed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|err| {
            self.started.store(false, Ordering::SeqCst);
            RoomClientError::Protocol(format!("connect requires a tokio runtime: {err}"))
        })?;

        let router = MessageRouter::new(
            self.shared.room_id,
            self.cursor.clone(),
            self.store.clone(),
            self.listeners.clone(),
            self.correlator.pending().clone(),
        );
        let worker = runtime.spawn(connection_worker(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            self.options.retry_schedule.clone(),
            router,
        ));
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        Ok(())
    }

    /// Registers a listener for every server message.
    pub fn on<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        self.listeners.add(listener)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Sends a message without waiting for a reply.
    ///
    /// Fails with [`RoomClientError::NotConnected`] when no socket is open;
    /// nothing is buffered across disconnects.
    pub fn send(&self, message: ClientMessage) -> Result<(), RoomClientError> {
        let text = message.to_text()?;
        self.shared.send_text(text)
    }

    /// Sends a message with a fresh correlation key and waits for the
    /// server's `response`.
    ///
    /// Resolves `Ok(())` on success, [`RoomClientError::Response`] when the
    /// server rejects the request, and [`RoomClientError::ResponseTimeout`]
    /// when nothing arrives within `timeout`.
    pub async fn send_with_response(
        &self,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<(), RoomClientError> {
        self.correlator
            .request(|message| self.send(message), message, timeout)
            .await
    }

    /// [`send_with_response`](Self::send_with_response) with the configured
    /// default timeout.
    pub async fn request(&self, message: ClientMessage) -> Result<(), RoomClientError> {
        self.send_with_response(message, self.options.request_timeout)
            .await
    }

    pub fn ping(&self) -> Result<(), RoomClientError> {
        self.send(ClientMessage::ping())
    }

    pub fn send_chat(&self, text: impl Into<String>) -> Result<(), RoomClientError> {
        self.send(ClientMessage::chat(text))
    }

    pub async fn start_game(&self) -> Result<(), RoomClientError> {
        self.request(ClientMessage::game_start()).await
    }

    pub async fn reset_game(&self) -> Result<(), RoomClientError> {
        self.request(ClientMessage::game_reset()).await
    }

    /// Sends a game-specific action and waits for it to be accepted.
    pub async fn send_action(&self, data: Value) -> Result<(), RoomClientError> {
        self.request(ClientMessage::action(data)).await
    }

    /// Permanently closes the client.
    ///
    /// Clears listeners, closes the socket and stops any pending reconnect.
    /// Correlated requests already in flight are left to their timeouts.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.listeners.clear();
        self.shared.outbound().take();
        self.shared.shutdown.notify_one();
        self.shared.set_status(ConnectionStatus::Closed);
        info!(event = "client_closed", room_id = self.shared.room_id);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Waits for the connection worker to finish.
    ///
    /// `Ok(())` after [`close`](Self::close); an error when a malformed frame
    /// or an exhausted retry schedule stopped the worker. Returns immediately
    /// when the worker was never started or was already awaited.
    pub async fn wait(&self) -> Result<(), RoomClientError> {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match worker {
            Some(worker) => worker
                .await
                .map_err(|err| RoomClientError::Protocol(format!("connection worker failed: {err}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for RoomEventClient {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for RoomEventClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomEventClient")
            .field("room_id", &self.shared.room_id)
            .field("last_seq", &self.cursor.get())
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

enum SessionOutcome {
    Shutdown,
    Closed,
}

async fn connection_worker(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    schedule: RetrySchedule,
    mut router: MessageRouter,
) -> Result<(), RoomClientError> {
    let room_id = shared.room_id;
    let mut retries = 0usize;

    loop {
        if shared.is_closed() {
            break;
        }

        let url = room_endpoint(&shared.base_url, room_id, router.resume_cursor());
        shared.set_status(ConnectionStatus::Connecting);
        debug!(event = "connect_attempt", room_id, retries, url = %url);

        let opened = tokio::select! {
            opened = connector.connect(&url) => opened,
            _ = shared.shutdown.notified() => break,
        };

        match opened {
            Ok(socket) => match run_connected_session(&shared, &mut router, socket, &mut retries).await {
                Ok(SessionOutcome::Shutdown) => break,
                Ok(SessionOutcome::Closed) => {}
                Err(err) => {
                    error!(event = "inbound_frame_rejected", room_id, error = %err);
                    shared.terminate();
                    return Err(err);
                }
            },
            Err(err) => {
                warn!(event = "connect_failed", room_id, retries, error = %err);
            }
        }

        shared.outbound().take();
        if shared.is_closed() {
            break;
        }
        shared.set_status(ConnectionStatus::Disconnected);

        if !schedule.allows_attempt(retries) {
            warn!(event = "reconnect_abandoned", room_id, attempts = retries);
            shared.terminate();
            return Err(RoomClientError::RetriesExhausted { attempts: retries });
        }

        let delay = schedule.delay_for(retries);
        info!(
            event = "reconnect_scheduled",
            room_id,
            attempt = retries + 1,
            delay_ms = delay.as_millis() as u64
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown.notified() => break,
        }
        // close() may land between the timer firing and this check.
        if shared.is_closed() {
            break;
        }
        retries += 1;
    }

    shared.outbound().take();
    shared.set_status(ConnectionStatus::Closed);
    debug!(event = "connection_worker_stopped", room_id);
    Ok(())
}

async fn run_connected_session(
    shared: &Shared,
    router: &mut MessageRouter,
    socket: SocketHandle,
    retries: &mut usize,
) -> Result<SessionOutcome, RoomClientError> {
    let SocketHandle {
        outbound,
        mut inbound,
    } = socket;

    *shared.outbound() = Some(outbound);
    if shared.is_closed() {
        return Ok(SessionOutcome::Shutdown);
    }
    shared.set_status(ConnectionStatus::Connected);
    info!(event = "connected", room_id = shared.room_id);

    loop {
        tokio::select! {
            maybe_frame = inbound.recv() => {
                match maybe_frame {
                    Some(text) => {
                        *retries = 0;
                        router.handle_text(&text)?;
                    }
                    None => {
                        info!(event = "socket_closed", room_id = shared.room_id);
                        return Ok(SessionOutcome::Closed);
                    }
                }
            }
            _ = shared.shutdown.notified() => return Ok(SessionOutcome::Shutdown),
        }
    }
}
