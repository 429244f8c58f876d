//! Realtime stream modules.
//!
//! - `client`: room client facade and the reconnecting connection worker.
//! - `correlator`: `event_key` request/response matching.
//! - `proto`: protocol messages shared with the room server.
//! - `router`: inbound frame dispatch, cursor tracking, and listeners.
//! - `session`: observable room state folded from the event stream.
//! - `transport`: socket seam and the websocket connector.

/// Room client and connection worker.
pub mod client;
pub(crate) mod correlator;
/// Room protocol messages.
pub mod proto;
/// Listener registration types.
pub mod router;
/// Room state tracking on top of the client.
pub mod session;
/// Connector trait and websocket implementation.
pub mod transport;
