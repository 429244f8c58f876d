//! Rust SDK for game-room realtime event streams.
//!
//! The crate is organized by concern:
//! - `stream`: websocket room client, protocol types, and room state helpers.
//! - `cursor`: persistence of the last applied sequence number per room.
//! - `retry`: reconnect schedule and timeout utilities.

/// Per-room cursor persistence.
pub mod cursor;
/// Reconnect schedule and timeout helpers.
pub mod retry;
/// Realtime room client, protocol types, and room state helpers.
pub mod stream;
