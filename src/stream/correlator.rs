//! Request/response correlation over the push channel.
//!
//! Each correlated request gets a fresh UUID `event_key`. The router hands any
//! `response` carrying a pending key to the waiting request and stops its
//! propagation; the request's own timeout is the only other way an entry
//! leaves the table. Whichever side removes the entry settles the request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::retry::with_timeout;
use crate::stream::client::RoomClientError;
use crate::stream::proto::{ClientMessage, ResponseErrorMsg, UNKNOWN_ERROR_CODE};

/// Server verdict for one correlated request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResponseOutcome {
    pub success: bool,
    pub error: Option<ResponseErrorMsg>,
}

impl ResponseOutcome {
    fn into_result(self) -> Result<(), RoomClientError> {
        if self.success {
            return Ok(());
        }
        let error = self.error.unwrap_or_default();
        Err(RoomClientError::Response {
            code: error
                .code
                .unwrap_or_else(|| UNKNOWN_ERROR_CODE.to_string()),
            message: error.message.unwrap_or_default(),
        })
    }
}

/// Table of requests waiting for their `response`.
#[derive(Clone, Debug, Default)]
pub(crate) struct PendingRequests {
    inner: Arc<Mutex<HashMap<String, oneshot::Sender<ResponseOutcome>>>>,
}

impl PendingRequests {
    pub(crate) fn register(&self, event_key: &str) -> oneshot::Receiver<ResponseOutcome> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(event_key.to_string(), tx);
        rx
    }

    fn take(&self, event_key: &str) -> Option<oneshot::Sender<ResponseOutcome>> {
        self.lock().remove(event_key)
    }

    /// Settles the request registered under `event_key`.
    ///
    /// Returns `false` when no request is waiting for that key, including a
    /// request whose caller has already gone away.
    pub(crate) fn resolve(&self, event_key: &str, outcome: ResponseOutcome) -> bool {
        let Some(tx) = self.take(event_key) else {
            return false;
        };
        tx.send(outcome).is_ok()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<ResponseOutcome>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregisters a request when its future is dropped before settling.
struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    event_key: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.take(self.event_key);
    }
}

/// Promise-style requests layered over a fire-and-forget send.
#[derive(Clone, Debug, Default)]
pub(crate) struct Correlator {
    pending: PendingRequests,
}

impl Correlator {
    pub(crate) fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Sends `message` with a fresh correlation key and waits for the
    /// matching response.
    pub(crate) async fn request<S>(
        &self,
        send: S,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<(), RoomClientError>
    where
        S: FnOnce(ClientMessage) -> Result<(), RoomClientError>,
    {
        let event_key = Uuid::new_v4().to_string();
        let mut rx = self.pending.register(&event_key);
        let _guard = PendingGuard {
            pending: &self.pending,
            event_key: &event_key,
        };

        send(message.with_event_key(event_key.clone()))?;
        debug!(
            event = "request_sent",
            event_key = %event_key,
            timeout_ms = timeout.as_millis() as u64
        );

        let outcome = match with_timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                return Err(RoomClientError::Protocol(format!(
                    "response slot for {event_key} dropped"
                )));
            }
            Err(_) => {
                if self.pending.take(&event_key).is_some() {
                    warn!(
                        event = "request_timed_out",
                        event_key = %event_key,
                        timeout_ms = timeout.as_millis() as u64
                    );
                    return Err(RoomClientError::ResponseTimeout {
                        event_key: event_key.clone(),
                        timeout,
                    });
                }
                // The router removed the entry first and is about to send its outcome.
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        return Err(RoomClientError::ResponseTimeout {
                            event_key: event_key.clone(),
                            timeout,
                        });
                    }
                }
            }
        };

        debug!(
            event = "response_received",
            event_key = %event_key,
            success = outcome.success
        );
        outcome.into_result()
    }
}
