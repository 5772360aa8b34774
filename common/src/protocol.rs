use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::player::{PlayerId, PlayerSummary};
use crate::score::GameHistory;

// Every frame on the wire is `{ "type": "<scope>:<name>", "payload": { ... } }`.

/// Messages sent by the client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    #[serde(rename = "player:request_id")]
    RequestId { name: String },
    #[serde(rename = "player:reconnect")]
    Reconnect {
        #[serde(rename = "playerID")]
        player_id: PlayerId,
        name: String,
    },
    #[serde(rename = "player:update_name")]
    UpdateName { name: String },
    #[serde(rename = "player:update_location")]
    UpdateLocation { latitude: f64, longitude: f64 },
    #[serde(rename = "player:state_update")]
    StateUpdate {
        #[serde(rename = "playerID")]
        player_id: PlayerId,
        name: String,
        history: GameHistory,
        total: i64,
        #[serde(rename = "opponentID", default, skip_serializing_if = "Option::is_none")]
        opponent_id: Option<PlayerId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<crate::player::Location>,
    },
    #[serde(rename = "players:search")]
    Search {
        #[serde(rename = "searchTerm")]
        search_term: String,
    },
    #[serde(rename = "players:nearby")]
    Nearby {
        latitude: f64,
        longitude: f64,
        #[serde(rename = "radiusKm")]
        radius_km: f64,
    },
    #[serde(rename = "game:start")]
    StartGame {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
        #[serde(rename = "winThreshold", default, skip_serializing_if = "Option::is_none")]
        win_threshold: Option<i64>,
    },
    #[serde(rename = "game:score_update")]
    ScoreUpdate {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
        score: i64,
    },
    #[serde(rename = "game:apply_brisks")]
    ApplyBrisks {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
        #[serde(rename = "briskCount")]
        brisk_count: u32,
    },
    #[serde(rename = "game:opponent_undo")]
    OpponentUndo {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
        points: i64,
        #[serde(rename = "briskValue", default, skip_serializing_if = "Option::is_none")]
        brisk_value: Option<u32>,
    },
    #[serde(rename = "game:reset")]
    Reset {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
    },
}

/// Opponent state attached to a `game:resume`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_threshold: Option<f64>,
}

/// Messages sent by the relay to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "connection:established")]
    ConnectionEstablished {},
    #[serde(rename = "player:id_assigned")]
    IdAssigned {
        #[serde(rename = "playerID")]
        player_id: PlayerId,
    },
    #[serde(rename = "player:reconnected")]
    Reconnected {
        #[serde(rename = "playerID")]
        player_id: PlayerId,
    },
    #[serde(rename = "player:invalid_id")]
    InvalidId {},
    #[serde(rename = "player:name_changed")]
    NameChanged {
        #[serde(rename = "playerID")]
        player_id: PlayerId,
        #[serde(default)]
        name: String,
    },
    #[serde(rename = "players:list")]
    PlayersList {
        #[serde(default)]
        players: Vec<PlayerSummary>,
    },
    #[serde(rename = "players:search_results")]
    SearchResults {
        #[serde(default)]
        players: Vec<PlayerSummary>,
    },
    #[serde(rename = "players:nearby_results")]
    NearbyResults {
        #[serde(default)]
        players: Vec<PlayerSummary>,
    },
    #[serde(rename = "game:auto_joined")]
    AutoJoined {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
        #[serde(rename = "opponentName", default)]
        opponent_name: String,
        #[serde(rename = "winThreshold", default, skip_serializing_if = "Option::is_none")]
        win_threshold: Option<f64>,
    },
    #[serde(rename = "game:resume")]
    Resume {
        #[serde(rename = "opponentID")]
        opponent_id: PlayerId,
        #[serde(rename = "opponentName", default)]
        opponent_name: String,
        #[serde(rename = "gameState", default, skip_serializing_if = "Option::is_none")]
        game_state: Option<ResumeState>,
        #[serde(rename = "winThreshold", default, skip_serializing_if = "Option::is_none")]
        win_threshold: Option<f64>,
    },
    #[serde(rename = "game:opponent_scored")]
    OpponentScored { score: i64 },
    #[serde(rename = "game:apply_brisks")]
    ApplyBrisks {
        #[serde(rename = "briskCount")]
        brisk_count: u32,
    },
    #[serde(rename = "game:opponent_undo")]
    OpponentUndo {
        #[serde(default)]
        points: i64,
        #[serde(rename = "briskValue", default, skip_serializing_if = "Option::is_none")]
        brisk_value: Option<u32>,
    },
    #[serde(rename = "game:reset")]
    Reset {
        #[serde(rename = "opponentID", default, skip_serializing_if = "Option::is_none")]
        opponent_id: Option<PlayerId>,
    },
}

/// Discriminant of a [`ServerMessage`], used to subscribe to one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerTag {
    ConnectionEstablished,
    IdAssigned,
    Reconnected,
    InvalidId,
    NameChanged,
    PlayersList,
    SearchResults,
    NearbyResults,
    AutoJoined,
    Resume,
    OpponentScored,
    ApplyBrisks,
    OpponentUndo,
    Reset,
}

impl ServerTag {
    pub const ALL: [ServerTag; 14] = [
        ServerTag::ConnectionEstablished,
        ServerTag::IdAssigned,
        ServerTag::Reconnected,
        ServerTag::InvalidId,
        ServerTag::NameChanged,
        ServerTag::PlayersList,
        ServerTag::SearchResults,
        ServerTag::NearbyResults,
        ServerTag::AutoJoined,
        ServerTag::Resume,
        ServerTag::OpponentScored,
        ServerTag::ApplyBrisks,
        ServerTag::OpponentUndo,
        ServerTag::Reset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerTag::ConnectionEstablished => "connection:established",
            ServerTag::IdAssigned => "player:id_assigned",
            ServerTag::Reconnected => "player:reconnected",
            ServerTag::InvalidId => "player:invalid_id",
            ServerTag::NameChanged => "player:name_changed",
            ServerTag::PlayersList => "players:list",
            ServerTag::SearchResults => "players:search_results",
            ServerTag::NearbyResults => "players:nearby_results",
            ServerTag::AutoJoined => "game:auto_joined",
            ServerTag::Resume => "game:resume",
            ServerTag::OpponentScored => "game:opponent_scored",
            ServerTag::ApplyBrisks => "game:apply_brisks",
            ServerTag::OpponentUndo => "game:opponent_undo",
            ServerTag::Reset => "game:reset",
        }
    }

    pub fn from_wire(kind: &str) -> Option<ServerTag> {
        ServerTag::ALL.into_iter().find(|tag| tag.as_str() == kind)
    }
}

impl ServerMessage {
    pub fn tag(&self) -> ServerTag {
        match self {
            ServerMessage::ConnectionEstablished {} => ServerTag::ConnectionEstablished,
            ServerMessage::IdAssigned { .. } => ServerTag::IdAssigned,
            ServerMessage::Reconnected { .. } => ServerTag::Reconnected,
            ServerMessage::InvalidId {} => ServerTag::InvalidId,
            ServerMessage::NameChanged { .. } => ServerTag::NameChanged,
            ServerMessage::PlayersList { .. } => ServerTag::PlayersList,
            ServerMessage::SearchResults { .. } => ServerTag::SearchResults,
            ServerMessage::NearbyResults { .. } => ServerTag::NearbyResults,
            ServerMessage::AutoJoined { .. } => ServerTag::AutoJoined,
            ServerMessage::Resume { .. } => ServerTag::Resume,
            ServerMessage::OpponentScored { .. } => ServerTag::OpponentScored,
            ServerMessage::ApplyBrisks { .. } => ServerTag::ApplyBrisks,
            ServerMessage::OpponentUndo { .. } => ServerTag::OpponentUndo,
            ServerMessage::Reset { .. } => ServerTag::Reset,
        }
    }

    pub fn decode(text: &str) -> Result<ServerMessage, ProtocolError> {
        let frame = normalize_frame(text)?;
        if ServerTag::from_wire(&frame.kind).is_none() {
            return Err(ProtocolError::UnknownType(frame.kind));
        }
        frame.into_message()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::RequestId { .. } => "player:request_id",
            ClientMessage::Reconnect { .. } => "player:reconnect",
            ClientMessage::UpdateName { .. } => "player:update_name",
            ClientMessage::UpdateLocation { .. } => "player:update_location",
            ClientMessage::StateUpdate { .. } => "player:state_update",
            ClientMessage::Search { .. } => "players:search",
            ClientMessage::Nearby { .. } => "players:nearby",
            ClientMessage::StartGame { .. } => "game:start",
            ClientMessage::ScoreUpdate { .. } => "game:score_update",
            ClientMessage::ApplyBrisks { .. } => "game:apply_brisks",
            ClientMessage::OpponentUndo { .. } => "game:opponent_undo",
            ClientMessage::Reset { .. } => "game:reset",
        }
    }

    pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
        normalize_frame(text)?.into_message()
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(String),
    #[error("frame has no type")]
    MissingType,
    #[error("unknown message type {0}")]
    UnknownType(String),
    #[error("invalid payload for {kind}: {message}")]
    Payload { kind: String, message: String },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Json(err.to_string())
    }
}

struct RawFrame {
    kind: String,
    value: Value,
}

impl RawFrame {
    fn into_message<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.value).map_err(|err| ProtocolError::Payload {
            kind: self.kind,
            message: err.to_string(),
        })
    }
}

// Payload-less frames arrive with the payload missing or null; the typed
// enums expect an object, so fill in an empty one.
fn normalize_frame(text: &str) -> Result<RawFrame, ProtocolError> {
    let mut value: Value = serde_json::from_str(text)?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| ProtocolError::Json("frame is not an object".to_string()))?;
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    if object.get("payload").is_none_or(Value::is_null) {
        object.insert("payload".to_string(), Value::Object(Map::new()));
    }
    Ok(RawFrame { kind, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outbound_frames_match_contract() {
        let msg = ClientMessage::Reconnect {
            player_id: PlayerId::from("1234"),
            name: "Alice".to_string(),
        };
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "player:reconnect", "payload": {"playerID": "1234", "name": "Alice"}})
        );

        let msg = ClientMessage::OpponentUndo {
            opponent_id: PlayerId::from("5678"),
            points: 200,
            brisk_value: None,
        };
        let json: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"type": "game:opponent_undo", "payload": {"opponentID": "5678", "points": 200}})
        );
        assert_eq!(msg.kind(), "game:opponent_undo");
    }

    #[test]
    fn test_decode_payloadless_frames() {
        for text in [
            r#"{"type":"connection:established"}"#,
            r#"{"type":"connection:established","payload":null}"#,
            r#"{"type":"connection:established","payload":{"clientId":"abc"}}"#,
        ] {
            let msg = ServerMessage::decode(text).unwrap();
            assert_eq!(msg.tag(), ServerTag::ConnectionEstablished);
        }
        let msg = ServerMessage::decode(r#"{"type":"player:invalid_id"}"#).unwrap();
        assert_eq!(msg, ServerMessage::InvalidId {});
    }

    #[test]
    fn test_decode_game_messages() {
        let msg = ServerMessage::decode(
            r#"{"type":"game:resume","payload":{"opponentID":"4321","opponentName":"Bob","gameState":{"total":640,"history":[]}}}"#,
        )
        .unwrap();
        match msg {
            ServerMessage::Resume {
                opponent_id,
                opponent_name,
                game_state,
                win_threshold,
            } => {
                assert_eq!(opponent_id.as_str(), "4321");
                assert_eq!(opponent_name, "Bob");
                assert_eq!(game_state.and_then(|state| state.total), Some(640));
                assert_eq!(win_threshold, None);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let msg = ServerMessage::decode(
            r#"{"type":"game:opponent_undo","payload":{"points":200,"briskValue":22}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ServerMessage::OpponentUndo {
                points: 200,
                brisk_value: Some(22)
            }
        );
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(matches!(
            ServerMessage::decode("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            ServerMessage::decode(r#"["player:id_assigned"]"#),
            Err(ProtocolError::Json(_))
        ));
        assert_eq!(
            ServerMessage::decode(r#"{"payload":{}}"#),
            Err(ProtocolError::MissingType)
        );
        assert_eq!(
            ServerMessage::decode(r#"{"type":"game:teleport","payload":{}}"#),
            Err(ProtocolError::UnknownType("game:teleport".to_string()))
        );
        assert!(matches!(
            ServerMessage::decode(r#"{"type":"game:apply_brisks","payload":{"briskCount":"lots"}}"#),
            Err(ProtocolError::Payload { .. })
        ));
    }

    #[test]
    fn test_every_tag_has_distinct_wire_name() {
        for tag in ServerTag::ALL {
            assert_eq!(ServerTag::from_wire(tag.as_str()), Some(tag));
        }
    }
}
