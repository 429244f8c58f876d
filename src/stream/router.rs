//! Inbound frame parsing, cursor tracking, and listener fan-out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, trace, warn};

use crate::cursor::CursorStore;
use crate::stream::client::RoomClientError;
use crate::stream::correlator::{PendingRequests, ResponseOutcome};
use crate::stream::proto::ServerMessage;

/// Callback invoked for every server message that reaches listeners.
pub type Listener = Arc<dyn Fn(&ServerMessage) + Send + Sync>;

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    entries: Vec<(u64, Listener)>,
}

/// Ordered set of listeners shared between the client and its worker.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    inner: Arc<Mutex<ListenerRegistry>>,
}

impl Listeners {
    pub(crate) fn add<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ServerMessage) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn clear(&self) {
        self.lock().entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Calls every listener in registration order.
    ///
    /// The registry lock is released before any listener runs so listeners
    /// may register or unsubscribe from inside the callback.
    pub(crate) fn notify(&self, message: &ServerMessage) {
        let snapshot: Vec<Listener> = self
            .lock()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(message);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registration returned by `RoomEventClient::on`.
///
/// The listener stays registered until [`ListenerHandle::unsubscribe`] is
/// called or the client is closed. Dropping the handle does not unsubscribe.
#[derive(Debug)]
pub struct ListenerHandle {
    id: u64,
    registry: Weak<Mutex<ListenerRegistry>>,
}

impl ListenerHandle {
    /// Removes the listener. Calling this more than once is a no-op.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.entries.retain(|(id, _)| *id != self.id);
    }
}

/// Last applied sequence number, shared with the client facade.
#[derive(Clone, Debug, Default)]
pub(crate) struct SharedCursor {
    inner: Arc<Mutex<Option<i64>>>,
}

impl SharedCursor {
    pub(crate) fn new(initial: Option<i64>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    pub(crate) fn get(&self) -> Option<i64> {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, cursor: i64) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(cursor);
    }
}

/// Applies inbound frames for one room.
pub(crate) struct MessageRouter {
    room_id: u64,
    cursor: SharedCursor,
    store: CursorStore,
    listeners: Listeners,
    pending: PendingRequests,
}

impl MessageRouter {
    pub(crate) fn new(
        room_id: u64,
        cursor: SharedCursor,
        store: CursorStore,
        listeners: Listeners,
        pending: PendingRequests,
    ) -> Self {
        Self {
            room_id,
            cursor,
            store,
            listeners,
            pending,
        }
    }

    /// Cursor to resume from: the in-memory value, else the stored one.
    pub(crate) fn resume_cursor(&self) -> Option<i64> {
        self.cursor
            .get()
            .or_else(|| self.store.get(self.room_id, None))
    }

    /// Parses and dispatches one text frame.
    ///
    /// A frame that is not a valid server message is returned as an error and
    /// nothing is dispatched.
    pub(crate) fn handle_text(&mut self, text: &str) -> Result<(), RoomClientError> {
        let message = ServerMessage::from_text(text)?;
        self.dispatch(message);
        Ok(())
    }

    pub(crate) fn dispatch(&mut self, message: ServerMessage) {
        trace!(event = "message_received", room_id = self.room_id, kind = message.kind());
        match &message {
            ServerMessage::Snapshot { last_seq, .. } => {
                self.cursor.set(*last_seq);
                self.persist(*last_seq);
            }
            ServerMessage::Event { seq, .. } => {
                let advanced = self.cursor.get().map_or(*seq, |current| current.max(*seq));
                if advanced != *seq {
                    debug!(
                        event = "stale_event",
                        room_id = self.room_id,
                        seq = *seq,
                        cursor = advanced
                    );
                }
                self.cursor.set(advanced);
                self.persist(advanced);
            }
            ServerMessage::Response {
                event_key,
                success,
                error,
            } => {
                let outcome = ResponseOutcome {
                    success: *success,
                    error: error.clone(),
                };
                if self.pending.resolve(event_key, outcome) {
                    return;
                }
                debug!(
                    event = "uncorrelated_response",
                    room_id = self.room_id,
                    event_key = %event_key
                );
            }
            ServerMessage::Ping { .. } | ServerMessage::Error { .. } => {}
        }
        self.listeners.notify(&message);
    }

    fn persist(&self, cursor: i64) {
        if let Err(err) = self.store.set(self.room_id, cursor) {
            warn!(
                event = "cursor_persist_failed",
                room_id = self.room_id,
                cursor,
                error = %err
            );
        }
    }
}
