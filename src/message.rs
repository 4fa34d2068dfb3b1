use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::presence::{PresenceDiffPayload, PresenceStatePayload};
use crate::world::{
    Player, Room, RoomSettings, RoomStatus, RoomType, SettingsPatch, SpecialChar, TurnEndReason,
    TurnPhase, UserId,
};

pub const MAX_NAME_LEN: usize = 32;
pub const MAX_MESSAGE_LEN: usize = 500;
pub const MAX_SLUG_LEN: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("could not parse frame")]
    BadFrame(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("invalid payload for `{event}`: {reason}")]
    BadPayload { event: String, reason: String },
    #[error("message must be 1-{MAX_MESSAGE_LEN} characters")]
    BadMessage,
    #[error("name must be 1-{MAX_NAME_LEN} characters")]
    BadName,
    #[error("invalid room id")]
    BadRoomId,
}

/// One WebSocket frame, modeled on a Phoenix Channels message: an event on a
/// topic, with an optional client-chosen `ref` echoed back in replies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<Value>,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// A server push: an event broadcast on a topic, not tied to a request.
    pub fn push(topic: &str, event: &ServerEvent) -> Frame {
        let (event, payload) = event.parts();
        Frame {
            topic: topic.to_owned(),
            event,
            payload,
            reference: None,
        }
    }

    pub fn reply_ok(topic: &str, reference: Option<Value>, response: Value) -> Frame {
        Frame {
            topic: topic.to_owned(),
            event: "phx_reply".to_owned(),
            payload: serde_json::json!({ "status": "ok", "response": response }),
            reference,
        }
    }

    pub fn reply_error(topic: &str, reference: Option<Value>, message: &str) -> Frame {
        Frame {
            topic: topic.to_owned(),
            event: "phx_reply".to_owned(),
            payload: serde_json::json!({ "status": "error", "response": { "message": message } }),
            reference,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_owned())
    }

    /// The room slug for frames on a `room:{slug}` topic.
    pub fn room_slug(&self) -> Option<&str> { self.topic.strip_prefix("room:") }
}

pub fn validate_name(name: &str) -> Result<String, ProtocolError> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(ProtocolError::BadName);
    }
    Ok(name.to_owned())
}

pub fn validate_room_slug(slug: &str) -> Result<String, ProtocolError> {
    if slug.is_empty()
        || slug.len() > MAX_SLUG_LEN
        || !slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ProtocolError::BadRoomId);
    }
    Ok(slug.to_owned())
}

/// Join parameters carried by `phx_join`.
#[derive(Clone, Debug, Deserialize)]
pub struct JoinParams {
    pub name: String,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub room_type: Option<RoomType>,
}

/// A filtered stroke batch. Deserializing drops any extra fields a client
/// may attach, so only this fixed shape is stored and relayed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrokeBatch {
    #[serde(rename = "drawMode")]
    pub draw_mode: bool,
    #[serde(rename = "strokeColor")]
    pub stroke_color: String,
    #[serde(rename = "strokeWidth")]
    pub stroke_width: f64,
    pub paths: Value,
}

/// Client -> Server commands, one per inbound event name.
#[derive(Clone, Debug)]
pub enum ClientCommand {
    NewMessage { message: String },
    Drawing(StrokeBatch),
    DrawingClear,
    StartGame,
    StartTurn { word: String },
    SkipWords,
    UpdateRoomSettings(SettingsPatch),
    VoteToKick { target_id: UserId },
    VoiceJoin,
    VoiceLeave,
    VoiceMute { muted: bool },
    WebrtcOffer(Value),
    WebrtcAnswer(Value),
    WebrtcIceCandidate(Value),
    Heartbeat,
}

impl ClientCommand {
    pub fn parse(event: &str, payload: Value) -> Result<ClientCommand, ProtocolError> {
        fn typed<T: serde::de::DeserializeOwned>(
            event: &str,
            payload: Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(payload).map_err(|err| ProtocolError::BadPayload {
                event: event.to_owned(),
                reason: err.to_string(),
            })
        }

        #[derive(Deserialize)]
        struct MessagePayload {
            message: String,
        }

        #[derive(Deserialize)]
        struct WordPayload {
            word: String,
        }

        #[derive(Deserialize)]
        struct KickPayload {
            target_id: UserId,
        }

        #[derive(Deserialize)]
        struct MutePayload {
            #[serde(default)]
            muted: bool,
        }

        let cmd = match event {
            "new_message" => {
                let MessagePayload { message } = typed(event, payload)?;
                let message = message.trim().to_owned();
                if message.is_empty() || message.chars().count() > MAX_MESSAGE_LEN {
                    return Err(ProtocolError::BadMessage);
                }
                ClientCommand::NewMessage { message }
            }
            "drawing" => ClientCommand::Drawing(typed(event, payload)?),
            "drawing_clear" => ClientCommand::DrawingClear,
            "start_game" => ClientCommand::StartGame,
            "start_turn" => {
                let WordPayload { word } = typed(event, payload)?;
                ClientCommand::StartTurn { word }
            }
            "skip_words" => ClientCommand::SkipWords,
            "update_room_settings" => ClientCommand::UpdateRoomSettings(typed(event, payload)?),
            "vote_to_kick" => {
                let KickPayload { target_id } = typed(event, payload)?;
                ClientCommand::VoteToKick { target_id }
            }
            "voice_join" => ClientCommand::VoiceJoin,
            "voice_leave" => ClientCommand::VoiceLeave,
            "voice_mute" => {
                let MutePayload { muted } = typed(event, payload)?;
                ClientCommand::VoiceMute { muted }
            }
            "webrtc_offer" => ClientCommand::WebrtcOffer(payload),
            "webrtc_answer" => ClientCommand::WebrtcAnswer(payload),
            "webrtc_ice_candidate" => ClientCommand::WebrtcIceCandidate(payload),
            "heartbeat" => ClientCommand::Heartbeat,
            other => return Err(ProtocolError::UnknownEvent(other.to_owned())),
        };

        Ok(cmd)
    }
}

/// Server -> Client events. Serializes to `{event, payload}`, the
/// self-describing envelope shape the bus and the socket share.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomInfo(RoomInfoPayload),
    GameStarted { round: u32 },
    DrawerAssigned { drawer_id: UserId, round: u32 },
    SelectWord { words: Vec<String> },
    WordAutoSelected { word: String },
    TurnStarted(TurnStartedPayload),
    LetterReveal { index: usize, letter: String },
    NewMessage { user_id: UserId, name: String, message: String },
    CorrectGuess { user_id: UserId, name: String },
    SimilarWord { user_id: UserId, name: String },
    ScoreUpdated { user_id: UserId, score: u32 },
    TurnOver(TurnOverPayload),
    GameOver { scores: Vec<PlayerScore> },
    Drawing(StrokeBatch),
    DrawingClear {},
    AdminChanged { admin_id: UserId },
    RoomSettingsUpdated { settings: RoomSettings },
    PlayerKicked { user_id: UserId },
    VoiceStateChanged { voice_members: BTreeMap<UserId, bool> },
    PresenceState(PresenceStatePayload),
    PresenceDiff(PresenceDiffPayload),
    WebrtcOffer(Value),
    WebrtcAnswer(Value),
    WebrtcIceCandidate(Value),
    Error { message: String },
}

impl ServerEvent {
    /// Split into the wire `(event, payload)` pair.
    pub fn parts(&self) -> (String, Value) {
        let value = serde_json::to_value(self).unwrap_or_default();
        match value {
            Value::Object(mut map) => {
                let event = map
                    .remove("event")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                let payload = map.remove("payload").unwrap_or(Value::Null);
                (event, payload)
            }
            _ => (String::new(), Value::Null),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PlayerScore {
    pub user_id: UserId,
    pub name: String,
    pub score: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct PlayerInfo {
    pub user_id: UserId,
    pub name: String,
    pub avatar: Option<String>,
    pub score: u32,
    pub guessed_this_turn: bool,
}

/// The room snapshot broadcast on every transition. The word only ever
/// appears masked here; the drawer learns it through their own channel.
#[derive(Clone, Debug, Serialize)]
pub struct RoomInfoPayload {
    pub room_id: String,
    pub status: RoomStatus,
    pub settings: RoomSettings,
    pub admin_id: Option<UserId>,
    pub current_round: u32,
    pub phase: Option<TurnPhase>,
    pub current_drawer_id: Option<UserId>,
    pub word_mask: Option<String>,
    pub special_chars: Vec<SpecialChar>,
    pub turn_deadline_unix: Option<u64>,
    pub players: Vec<PlayerInfo>,
    pub voice_members: BTreeMap<UserId, bool>,
}

impl RoomInfoPayload {
    pub fn new(room: &Room, players: &[Player]) -> Self {
        Self {
            room_id: room.room_id.clone(),
            status: room.status,
            settings: room.settings.clone(),
            admin_id: room.admin_id.clone(),
            current_round: room.current_round,
            phase: room.phase,
            current_drawer_id: room.current_drawer_id.clone(),
            word_mask: room.masked_word(),
            special_chars: room.special_chars(),
            turn_deadline_unix: room.turn_deadline_unix,
            players: players
                .iter()
                .map(|p| PlayerInfo {
                    user_id: p.user_id.clone(),
                    name: p.display_name.clone(),
                    avatar: p.avatar.clone(),
                    score: p.score,
                    guessed_this_turn: p.guessed_this_turn,
                })
                .collect(),
            voice_members: room.voice_members.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct TurnStartedPayload {
    pub drawer_id: UserId,
    pub round: u32,
    pub turn_time_sec: u32,
    pub word_mask: String,
    pub special_chars: Vec<SpecialChar>,
    pub turn_deadline_unix: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct TurnOverPayload {
    pub reason: TurnEndReason,
    pub word: Option<String>,
    pub scores: Vec<PlayerScore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_phoenix_shape() {
        let text = r#"{"topic":"room:happy-cat","event":"new_message","payload":{"message":"hi"},"ref":"1"}"#;
        let frame = Frame::parse(text).unwrap();
        assert_eq!(frame.room_slug(), Some("happy-cat"));
        assert_eq!(frame.event, "new_message");
        assert_eq!(frame.reference, Some(Value::String("1".into())));
    }

    #[test]
    fn event_names_match_the_protocol() {
        let (event, payload) = ServerEvent::WordAutoSelected { word: "apple".into() }.parts();
        assert_eq!(event, "word_auto_selected");
        assert_eq!(payload["word"], "apple");

        let (event, _) = ServerEvent::DrawingClear {}.parts();
        assert_eq!(event, "drawing_clear");

        let (event, payload) = ServerEvent::ScoreUpdated {
            user_id: "u1".into(),
            score: 217,
        }
        .parts();
        assert_eq!(event, "score_updated");
        assert_eq!(payload["score"], 217);
    }

    #[test]
    fn stroke_batches_are_filtered_to_the_fixed_shape() {
        let raw = serde_json::json!({
            "drawMode": true,
            "strokeColor": "#ff0000",
            "strokeWidth": 4.0,
            "paths": [[1, 2], [3, 4]],
            "sneaky": "dropped",
        });

        let batch: StrokeBatch = serde_json::from_value(raw).unwrap();
        let clean = serde_json::to_value(&batch).unwrap();
        assert!(clean.get("sneaky").is_none());
        assert_eq!(clean["strokeColor"], "#ff0000");
    }

    #[test]
    fn chat_command_enforces_length() {
        let err = ClientCommand::parse("new_message", serde_json::json!({"message": "  "}));
        assert!(err.is_err());

        let long = "x".repeat(MAX_MESSAGE_LEN + 1);
        let err = ClientCommand::parse("new_message", serde_json::json!({ "message": long }));
        assert!(err.is_err());

        let ok = ClientCommand::parse("new_message", serde_json::json!({"message": "apple"}));
        assert!(matches!(ok, Ok(ClientCommand::NewMessage { .. })));
    }

    #[test]
    fn unknown_events_are_rejected() {
        assert!(matches!(
            ClientCommand::parse("no_such_event", Value::Null),
            Err(ProtocolError::UnknownEvent(_))
        ));
    }

    #[test]
    fn room_slugs_are_constrained() {
        assert!(validate_room_slug("happy-cat").is_ok());
        assert!(validate_room_slug("Nope").is_err());
        assert!(validate_room_slug("").is_err());
        assert!(validate_room_slug("a b").is_err());
    }
}
