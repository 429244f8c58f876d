//! Observable room state built from the event stream.
//!
//! [`RoomState`] folds snapshots and room events into players, chat and game
//! state. [`RoomSession`] attaches a `RoomState` to a client as a listener and
//! publishes every change on a `watch` channel, so any front end can render
//! from it without the client knowing about the front end.

use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::stream::client::RoomEventClient;
use crate::stream::proto::{
    ChatMessageMsg, PlayerMsg, PlayerStatusMsg, RoomEventKind, RoomEventMsg, RoomStatusMsg,
    ServerMessage,
};
use crate::stream::router::ListenerHandle;

/// Current view of a room.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RoomState {
    pub room_id: Option<u64>,
    pub status: RoomStatusMsg,
    pub players: Vec<PlayerMsg>,
    pub chat_messages: Vec<ChatMessageMsg>,
    /// Shared game state (board, turn, ...).
    pub game_state: Option<Value>,
    /// State private to the local player, sent with `game.init`.
    pub player_state: Option<Value>,
    /// Sequence number of the last applied snapshot or event.
    pub last_seq: Option<i64>,
}

/// What a message changed in a [`RoomState`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoomUpdate {
    Snapshot,
    PlayerJoined { player_id: String },
    PlayerLeft { player_id: String },
    ChatMessage,
    GameState,
    PlayerState,
    RoomClosed,
}

impl RoomState {
    /// Players whose status is connected.
    pub fn active_players(&self) -> Vec<&PlayerMsg> {
        self.players
            .iter()
            .filter(|player| player.status == PlayerStatusMsg::Connected)
            .collect()
    }

    /// Applies one server message.
    ///
    /// Returns `None` when the message changes nothing beyond `last_seq`.
    pub fn apply(&mut self, message: &ServerMessage) -> Option<RoomUpdate> {
        match message {
            ServerMessage::Snapshot { last_seq, data } => {
                self.room_id = Some(data.room_id);
                self.status = data.status;
                self.players = data.players.clone();
                self.chat_messages = data.chat_messages.clone();
                self.game_state = data.game_state().cloned();
                self.last_seq = Some(*last_seq);
                Some(RoomUpdate::Snapshot)
            }
            ServerMessage::Event { seq, event } => {
                self.last_seq = Some(self.last_seq.map_or(*seq, |current| current.max(*seq)));
                self.apply_event(event)
            }
            ServerMessage::Response { .. } | ServerMessage::Ping { .. } | ServerMessage::Error { .. } => {
                None
            }
        }
    }

    fn apply_event(&mut self, event: &RoomEventMsg) -> Option<RoomUpdate> {
        match event.event_kind() {
            RoomEventKind::PlayerJoined => {
                let mut player: PlayerMsg = decode_event_data(event)?;
                player.status = PlayerStatusMsg::Connected;
                let player_id = player.id.clone();
                match self.players.iter_mut().find(|known| known.id == player.id) {
                    Some(known) => *known = player,
                    None => self.players.push(player),
                }
                Some(RoomUpdate::PlayerJoined { player_id })
            }
            RoomEventKind::PlayerLeft => {
                let Some(player_id) = event.data.get("id").and_then(Value::as_str) else {
                    warn!(event = "player_left_without_id", kind = event.kind.as_str());
                    return None;
                };
                for player in self.players.iter_mut().filter(|player| player.id == player_id) {
                    player.status = PlayerStatusMsg::Disconnected;
                }
                Some(RoomUpdate::PlayerLeft {
                    player_id: player_id.to_string(),
                })
            }
            RoomEventKind::MessageSent => {
                let message: ChatMessageMsg = decode_event_data(event)?;
                self.chat_messages.push(message);
                Some(RoomUpdate::ChatMessage)
            }
            RoomEventKind::GameStateUpdate => {
                self.game_state = Some(event.data.clone());
                Some(RoomUpdate::GameState)
            }
            RoomEventKind::GameInit => {
                self.player_state = Some(event.data.clone());
                Some(RoomUpdate::PlayerState)
            }
            RoomEventKind::RoomClosed => {
                self.status = RoomStatusMsg::Closed;
                self.game_state = None;
                self.player_state = None;
                Some(RoomUpdate::RoomClosed)
            }
            RoomEventKind::GameStart | RoomEventKind::Other(_) => None,
        }
    }
}

fn decode_event_data<T>(event: &RoomEventMsg) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    match serde_json::from_value(event.data.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                event = "room_event_data_invalid",
                kind = event.kind.as_str(),
                error = %err
            );
            None
        }
    }
}

/// [`RoomState`] kept current by a client listener.
#[derive(Debug)]
pub struct RoomSession {
    state: watch::Receiver<RoomState>,
    handle: ListenerHandle,
}

impl RoomSession {
    /// Registers a listener on `client` that folds messages into state.
    pub fn attach(client: &RoomEventClient) -> Self {
        let (tx, rx) = watch::channel(RoomState::default());
        let handle = client.on(move |message| {
            tx.send_if_modified(|state| {
                let seen = state.last_seq;
                state.apply(message).is_some() || state.last_seq != seen
            });
        });
        Self { state: rx, handle }
    }

    /// Copy of the current state.
    pub fn state(&self) -> RoomState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<RoomState> {
        self.state.clone()
    }

    /// Stops tracking; the last state stays readable through existing
    /// receivers.
    pub fn detach(self) {
        self.handle.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn msg(value: Value) -> ServerMessage {
        serde_json::from_value(value).expect("server message")
    }

    fn seeded() -> RoomState {
        let mut state = RoomState::default();
        state.apply(&msg(json!({
            "type": "snapshot",
            "last_seq": 4,
            "data": {
                "room_id": 7,
                "status": "waiting_for_start",
                "players": [
                    {"id": "a", "user_name": "ann", "role": "admin"},
                    {"id": "b", "user_name": "bob", "role": "player"}
                ],
                "chat_messages": [{"sender_id": "a", "value": "hello"}],
                "game_state": {"status": "not_started"}
            }
        })));
        state
    }

    #[test]
    fn snapshot_replaces_state() {
        let state = seeded();
        assert_eq!(state.room_id, Some(7));
        assert_eq!(state.status, RoomStatusMsg::WaitingForStart);
        assert_eq!(state.players.len(), 2);
        assert_eq!(state.chat_messages[0].kind, "text");
        assert_eq!(state.game_state, Some(json!({"status": "not_started"})));
        assert_eq!(state.last_seq, Some(4));
    }

    #[test]
    fn player_join_and_leave_update_roster() {
        let mut state = seeded();
        let joined = state.apply(&msg(json!({
            "type": "event",
            "seq": 5,
            "event": {"type": "player.joined", "data": {"id": "c", "user_name": "cy", "role": "player"}}
        })));
        assert_eq!(
            joined,
            Some(RoomUpdate::PlayerJoined {
                player_id: "c".to_string()
            })
        );
        assert_eq!(state.active_players().len(), 3);

        state.apply(&msg(json!({
            "type": "event",
            "seq": 6,
            "event": {"type": "player.left", "data": {"id": "b"}}
        })));
        let active: Vec<&str> = state
            .active_players()
            .iter()
            .map(|player| player.id.as_str())
            .collect();
        assert_eq!(active, vec!["a", "c"]);
        assert_eq!(state.players.len(), 3);
        assert_eq!(state.last_seq, Some(6));
    }

    #[test]
    fn rejoining_player_is_not_duplicated() {
        let mut state = seeded();
        state.apply(&msg(json!({
            "type": "event", "seq": 5,
            "event": {"type": "player.left", "data": {"id": "b"}}
        })));
        state.apply(&msg(json!({
            "type": "event", "seq": 6,
            "event": {"type": "player.joined", "data": {"id": "b", "user_name": "bob"}}
        })));
        assert_eq!(state.players.len(), 2);
        assert_eq!(state.active_players().len(), 2);
    }

    #[test]
    fn chat_and_game_events_apply() {
        let mut state = seeded();
        state.apply(&msg(json!({
            "type": "event", "seq": 5,
            "event": {"type": "message.sent", "data": {"sender_id": "b", "value": "gl"}}
        })));
        state.apply(&msg(json!({
            "type": "event", "seq": 6,
            "event": {"type": "game.state.update", "data": {"current_player": 2}}
        })));
        state.apply(&msg(json!({
            "type": "event", "seq": 7,
            "event": {"type": "game.init", "data": {"player": 1}}
        })));
        assert_eq!(state.chat_messages.len(), 2);
        assert_eq!(state.game_state, Some(json!({"current_player": 2})));
        assert_eq!(state.player_state, Some(json!({"player": 1})));
    }

    #[test]
    fn room_closed_resets_game() {
        let mut state = seeded();
        let update = state.apply(&msg(json!({
            "type": "event", "seq": 5,
            "event": {"type": "room.closed", "data": {}}
        })));
        assert_eq!(update, Some(RoomUpdate::RoomClosed));
        assert_eq!(state.status, RoomStatusMsg::Closed);
        assert_eq!(state.game_state, None);
    }

    #[test]
    fn malformed_event_data_is_ignored() {
        let mut state = seeded();
        let before = state.clone();
        let update = state.apply(&msg(json!({
            "type": "event", "seq": 5,
            "event": {"type": "player.joined", "data": {"nickname": "??"}}
        })));
        assert_eq!(update, None);
        assert_eq!(state.players, before.players);
        assert_eq!(state.last_seq, Some(5));
    }

    #[test]
    fn unhandled_events_still_advance_last_seq() {
        let mut state = seeded();
        state.apply(&msg(json!({
            "type": "event", "seq": 5,
            "event": {"type": "game.start", "data": {}}
        })));
        state.apply(&msg(json!({
            "type": "event", "seq": 6,
            "event": {"type": "emoji.sent", "data": {"emoji": "tada"}}
        })));
        assert_eq!(state.last_seq, Some(6));
        assert_eq!(state.status, RoomStatusMsg::WaitingForStart);
    }

    #[test]
    fn pings_do_not_change_state() {
        let mut state = seeded();
        assert_eq!(state.apply(&msg(json!({"type": "ping"}))), None);
    }
}
