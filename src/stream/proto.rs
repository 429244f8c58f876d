use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code used when a failed response carries no code of its own.
pub const UNKNOWN_ERROR_CODE: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatusMsg {
    #[default]
    WaitingForPlayers,
    WaitingForStart,
    WaitingForPlayer,
    InProgress,
    Closed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerRoleMsg {
    Admin,
    #[default]
    Player,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatusMsg {
    #[default]
    Connected,
    Offline,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerMsg {
    pub id: String,
    pub user_name: String,
    #[serde(default)]
    pub role: PlayerRoleMsg,
    #[serde(default)]
    pub status: PlayerStatusMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessageMsg {
    #[serde(rename = "type", default = "text_kind")]
    pub kind: String,
    pub sender_id: String,
    pub value: String,
}

fn text_kind() -> String {
    "text".to_string()
}

/// Full room state carried by a `snapshot` message.
///
/// Every field is optional on the wire so an empty `data: {}` decodes.
/// Game-specific sections such as `game_state` land in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RoomSnapshotMsg {
    pub room_id: u64,
    pub status: RoomStatusMsg,
    pub players: Vec<PlayerMsg>,
    pub chat_messages: Vec<ChatMessageMsg>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RoomSnapshotMsg {
    /// Game-specific state section, if the server attached one.
    pub fn game_state(&self) -> Option<&Value> {
        self.extra.get("game_state").filter(|value| !value.is_null())
    }
}

/// Domain event carried by an `event` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoomEventMsg {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl RoomEventMsg {
    /// Classifies the event type string.
    pub fn event_kind(&self) -> RoomEventKind {
        RoomEventKind::parse(&self.kind)
    }
}

/// Known room event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEventKind {
    PlayerJoined,
    PlayerLeft,
    RoomClosed,
    MessageSent,
    GameStart,
    GameInit,
    GameStateUpdate,
    Other(String),
}

impl RoomEventKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "player.joined" => Self::PlayerJoined,
            "player.left" => Self::PlayerLeft,
            "room.closed" => Self::RoomClosed,
            "message.sent" => Self::MessageSent,
            "game.start" => Self::GameStart,
            "game.init" => Self::GameInit,
            "game.state.update" => Self::GameStateUpdate,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PlayerJoined => "player.joined",
            Self::PlayerLeft => "player.left",
            Self::RoomClosed => "room.closed",
            Self::MessageSent => "message.sent",
            Self::GameStart => "game.start",
            Self::GameInit => "game.init",
            Self::GameStateUpdate => "game.state.update",
            Self::Other(kind) => kind,
        }
    }
}

/// Error detail attached to a failed `response`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ResponseErrorMsg {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_key: Option<String>,
    },
    ChatMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_key: Option<String>,
    },
    Action {
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_key: Option<String>,
    },
    GameStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_key: Option<String>,
    },
    GameReset {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_key: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot {
        last_seq: i64,
        #[serde(default)]
        data: RoomSnapshotMsg,
    },
    Event {
        seq: i64,
        event: RoomEventMsg,
    },
    Response {
        event_key: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ResponseErrorMsg>,
    },
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ClientMessage {
    pub fn ping() -> Self {
        Self::Ping { event_key: None }
    }

    pub fn chat(text: impl Into<String>) -> Self {
        Self::ChatMessage {
            text: text.into(),
            event_key: None,
        }
    }

    pub fn action(data: Value) -> Self {
        Self::Action {
            data,
            event_key: None,
        }
    }

    pub fn game_start() -> Self {
        Self::GameStart { event_key: None }
    }

    pub fn game_reset() -> Self {
        Self::GameReset { event_key: None }
    }

    /// Correlation key carried by this message, if any.
    pub fn event_key(&self) -> Option<&str> {
        match self {
            Self::Ping { event_key }
            | Self::ChatMessage { event_key, .. }
            | Self::Action { event_key, .. }
            | Self::GameStart { event_key }
            | Self::GameReset { event_key } => event_key.as_deref(),
        }
    }

    /// Returns the message with its correlation key replaced.
    pub fn with_event_key(mut self, key: impl Into<String>) -> Self {
        let slot = match &mut self {
            Self::Ping { event_key }
            | Self::ChatMessage { event_key, .. }
            | Self::Action { event_key, .. }
            | Self::GameStart { event_key }
            | Self::GameReset { event_key } => event_key,
        };
        *slot = Some(key.into());
        self
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ServerMessage {
    /// Wire tag of the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::Event { .. } => "event",
            Self::Response { .. } => "response",
            Self::Ping { .. } => "ping",
            Self::Error { .. } => "error",
        }
    }

    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn snapshot_with_empty_data_decodes() {
        let msg = ServerMessage::from_text(r#"{"type":"snapshot","last_seq":42,"data":{}}"#)
            .expect("decode");
        assert_eq!(
            msg,
            ServerMessage::Snapshot {
                last_seq: 42,
                data: RoomSnapshotMsg::default(),
            }
        );
    }

    #[test]
    fn snapshot_keeps_players_chat_and_game_state() {
        let text = json!({
            "type": "snapshot",
            "last_seq": 3,
            "data": {
                "room_id": 7,
                "status": "waiting_for_start",
                "players": [
                    {"id": "p1", "user_name": "ann", "role": "admin", "status": "connected"}
                ],
                "chat_messages": [{"type": "text", "sender_id": "p1", "value": "hi"}],
                "game_state": {"current_player": 1}
            }
        })
        .to_string();

        let ServerMessage::Snapshot { data, .. } = ServerMessage::from_text(&text).expect("decode")
        else {
            panic!("expected snapshot");
        };
        assert_eq!(data.room_id, 7);
        assert_eq!(data.status, RoomStatusMsg::WaitingForStart);
        assert_eq!(data.players[0].role, PlayerRoleMsg::Admin);
        assert_eq!(data.chat_messages[0].value, "hi");
        assert_eq!(data.game_state(), Some(&json!({"current_player": 1})));
    }

    #[test]
    fn unknown_room_status_is_tolerated() {
        let snapshot: RoomSnapshotMsg =
            serde_json::from_value(json!({"status": "something_new"})).expect("decode");
        assert_eq!(snapshot.status, RoomStatusMsg::Unknown);
    }

    #[test]
    fn event_decodes_with_kind() {
        let text = json!({
            "type": "event",
            "seq": 43,
            "event": {"seq": 43, "room_id": 7, "type": "player.joined", "data": {"id": "p2"}}
        })
        .to_string();
        let ServerMessage::Event { seq, event } = ServerMessage::from_text(&text).expect("decode")
        else {
            panic!("expected event");
        };
        assert_eq!(seq, 43);
        assert_eq!(event.event_kind(), RoomEventKind::PlayerJoined);
        assert_eq!(event.data["id"], "p2");
    }

    #[test]
    fn unrecognised_event_kind_is_preserved() {
        let kind = RoomEventKind::parse("board.flipped");
        assert_eq!(kind, RoomEventKind::Other("board.flipped".to_string()));
        assert_eq!(kind.as_str(), "board.flipped");
    }

    #[test]
    fn response_error_fields_are_optional() {
        let msg = ServerMessage::from_text(
            r#"{"type":"response","event_key":"k","success":false,"error":{"type":"error","message":"nope"}}"#,
        )
        .expect("decode");
        assert_eq!(
            msg,
            ServerMessage::Response {
                event_key: "k".to_string(),
                success: false,
                error: Some(ResponseErrorMsg {
                    code: None,
                    message: Some("nope".to_string()),
                }),
            }
        );
    }

    #[test]
    fn ping_without_timestamp_decodes() {
        let msg = ServerMessage::from_text(r#"{"type":"ping"}"#).expect("decode");
        assert_eq!(msg, ServerMessage::Ping { timestamp: None });
        assert_eq!(msg.kind(), "ping");
    }

    #[test]
    fn unknown_server_tag_is_rejected() {
        assert!(ServerMessage::from_text(r#"{"type":"teleport"}"#).is_err());
    }

    #[test]
    fn client_ping_encodes_bare_tag() {
        assert_eq!(
            ClientMessage::ping().to_text().expect("encode"),
            r#"{"type":"ping"}"#
        );
    }

    #[test]
    fn client_event_key_is_attached_to_any_variant() {
        let msg = ClientMessage::action(json!({"player": 1, "column": 3})).with_event_key("abc");
        assert_eq!(msg.event_key(), Some("abc"));

        let encoded: Value = serde_json::from_str(&msg.to_text().expect("encode")).expect("json");
        assert_eq!(
            encoded,
            json!({"type": "action", "data": {"player": 1, "column": 3}, "event_key": "abc"})
        );

        let start: Value =
            serde_json::from_str(&ClientMessage::game_start().with_event_key("k2").to_text().expect("encode"))
                .expect("json");
        assert_eq!(start, json!({"type": "game_start", "event_key": "k2"}));
    }

    #[test]
    fn chat_message_decodes() {
        let msg = ClientMessage::from_text(r#"{"type":"chat_message","text":"gg"}"#).expect("decode");
        assert_eq!(msg, ClientMessage::chat("gg"));
    }
}
