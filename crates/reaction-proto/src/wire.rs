// SPDX-License-Identifier: Apache-2.0
//! JSON text framing: client→server frame parsing and server→client frame
//! encoding.
//!
//! Frames are decoded as a JSON object and dispatched by a `type` tag, with
//! a fallback branch for the untagged reaction sample.

use serde_json::Value;
use thiserror::Error;

use crate::model::{EffectType, Events, ExperimentGroup, States};

/// Errors while decoding an inbound client frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The frame was not valid JSON.
    #[error("invalid json: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The frame was valid JSON but not an object.
    #[error("frame is not a json object")]
    NotAnObject,
    /// A required field was missing or of the wrong type.
    #[error("missing or malformed field: {0}")]
    MissingField(&'static str),
    /// `manual_effect` named an effect type outside the fixed set.
    #[error("unknown effect type: {0}")]
    UnknownEffectType(String),
}

/// The parsed handshake frame, required as the first frame on a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeFrame {
    /// Non-empty client-declared user id.
    pub user_id: String,
    /// Declared experiment cohort (default `control2`).
    pub experiment_group: ExperimentGroup,
    /// Whether this connection drives video transport.
    pub is_host: bool,
}

/// Parse the mandatory first frame of a connection.
///
/// # Errors
/// Returns [`FrameError`] if the frame is not valid JSON, not an object, or
/// is missing a non-empty `userId`.
pub fn parse_handshake(raw: &str) -> Result<HandshakeFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    let obj = value.as_object().ok_or(FrameError::NotAnObject)?;
    let user_id = obj
        .get("userId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(FrameError::MissingField("userId"))?
        .to_owned();
    let experiment_group = obj
        .get("experimentGroup")
        .and_then(Value::as_str)
        .map_or(ExperimentGroup::Control2, ExperimentGroup::parse);
    let is_host = obj
        .get("isHost")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(HandshakeFrame {
        user_id,
        experiment_group,
        is_host,
    })
}

/// One reaction-sample frame, pre-timestamp: the connection stamps
/// `server_receive_ms` itself, so this carries only the client-supplied
/// fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionFrame {
    /// Boolean states reported.
    pub states: States,
    /// Event counts reported.
    pub events: Events,
    /// Client-reported playback position.
    pub video_time_seconds: Option<f64>,
    /// Opaque viewing-session tag.
    pub session_id: Option<String>,
}

/// Video-transport event kind relayed from host to participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Host started playback.
    Play,
    /// Host paused playback.
    Pause,
    /// Host seeked to a new position.
    Seek,
}

impl TransportKind {
    /// Wire tag for this transport event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Play => "video_play",
            Self::Pause => "video_pause",
            Self::Seek => "video_seek",
        }
    }
}

/// A parsed, dispatch-ready inbound frame. Everything except the handshake
/// (see [`parse_handshake`]) and unrecognized tags (ignored by the caller).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// An untagged (or `type: "reaction"`) per-second reaction sample.
    Reaction(ReactionFrame),
    /// `video_play` / `video_pause` / `video_seek`.
    VideoTransport {
        /// Which transport event this is.
        kind: TransportKind,
        /// Reported playback position.
        current_time: f64,
    },
    /// `time_sync_request`, sent by a participant.
    TimeSyncRequest,
    /// `time_sync_response`, sent by the host.
    TimeSyncResponse {
        /// The participant that asked for the host's clock.
        requester_id: String,
        /// The host's current playback position.
        current_time: f64,
    },
    /// `video_url_selected`, sent by the host.
    VideoUrlSelected {
        /// Identifier of the chosen video.
        video_id: String,
    },
    /// `session_create`.
    SessionCreate {
        /// Opaque session identifier minted by the client.
        session_id: String,
        /// Identifier of the video being watched.
        video_id: String,
    },
    /// `session_completed`.
    SessionCompleted {
        /// The session that finished.
        session_id: String,
    },
    /// `manual_effect`, debug-group only.
    ManualEffect {
        /// Requested effect type.
        effect_type: EffectType,
        /// Requested intensity (clamped to `[0, 1]` by the caller).
        intensity: f64,
        /// Requested duration in milliseconds.
        duration_ms: u64,
        /// Optional session tag.
        session_id: Option<String>,
        /// Optional playback position.
        video_time: Option<f64>,
    },
}

/// Outcome of parsing a post-handshake frame: either a recognized, decoded
/// frame, or a named-but-unrecognized tag that the caller should log and
/// ignore. Unknown tags are never an error.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    /// A recognized frame ready for dispatch.
    Known(ClientFrame),
    /// An object with an unrecognized `type` tag.
    UnknownTag(String),
}

fn parse_states(obj: &serde_json::Map<String, Value>) -> States {
    let get = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
    States {
        is_smiling: get("isSmiling"),
        is_surprised: get("isSurprised"),
        is_concentrating: get("isConcentrating"),
        is_hand_up: get("isHandUp"),
    }
}

fn parse_events(obj: &serde_json::Map<String, Value>) -> Events {
    let get = |key: &str| {
        obj.get(key)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    };
    Events {
        nod: get("nod"),
        shake_head: get("shakeHead"),
        sway_vertical: get("swayVertical"),
        sway_horizontal: get("swayHorizontal"),
        cheer: get("cheer"),
        clap: get("clap"),
    }
}

/// Parse one post-handshake inbound frame.
///
/// `type` field wins over heuristics; absence of `type` together with
/// presence of `states`/`events` is treated as a reaction sample.
///
/// # Errors
/// Returns [`FrameError`] for malformed JSON or a recognized tag missing a
/// required field. An unrecognized tag is not an error — see
/// [`ParsedFrame::UnknownTag`].
pub fn parse_frame(raw: &str) -> Result<ParsedFrame, FrameError> {
    let value: Value = serde_json::from_str(raw)?;
    let obj = value.as_object().ok_or(FrameError::NotAnObject)?;

    let tag = obj.get("type").and_then(Value::as_str);

    let frame = match tag {
        None | Some("reaction") => ClientFrame::Reaction(ReactionFrame {
            states: obj
                .get("states")
                .and_then(Value::as_object)
                .map(parse_states)
                .unwrap_or_default(),
            events: obj
                .get("events")
                .and_then(Value::as_object)
                .map(parse_events)
                .unwrap_or_default(),
            video_time_seconds: obj.get("videoTime").and_then(Value::as_f64),
            session_id: obj
                .get("sessionId")
                .and_then(Value::as_str)
                .map(str::to_owned),
        }),
        Some(tag @ ("video_play" | "video_pause" | "video_seek")) => {
            let kind = match tag {
                "video_play" => TransportKind::Play,
                "video_pause" => TransportKind::Pause,
                _ => TransportKind::Seek,
            };
            let current_time = obj
                .get("currentTime")
                .and_then(Value::as_f64)
                .ok_or(FrameError::MissingField("currentTime"))?;
            ClientFrame::VideoTransport { kind, current_time }
        }
        Some("time_sync_request") => ClientFrame::TimeSyncRequest,
        Some("time_sync_response") => ClientFrame::TimeSyncResponse {
            requester_id: obj
                .get("requesterId")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("requesterId"))?
                .to_owned(),
            current_time: obj
                .get("currentTime")
                .and_then(Value::as_f64)
                .ok_or(FrameError::MissingField("currentTime"))?,
        },
        Some("video_url_selected") => ClientFrame::VideoUrlSelected {
            video_id: obj
                .get("videoId")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("videoId"))?
                .to_owned(),
        },
        Some("session_create") => ClientFrame::SessionCreate {
            session_id: obj
                .get("sessionId")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("sessionId"))?
                .to_owned(),
            video_id: obj
                .get("videoId")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("videoId"))?
                .to_owned(),
        },
        Some("session_completed") => ClientFrame::SessionCompleted {
            session_id: obj
                .get("sessionId")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("sessionId"))?
                .to_owned(),
        },
        Some("manual_effect") => {
            let effect_type_raw = obj
                .get("effectType")
                .and_then(Value::as_str)
                .ok_or(FrameError::MissingField("effectType"))?;
            let effect_type = EffectType::parse(effect_type_raw)
                .ok_or_else(|| FrameError::UnknownEffectType(effect_type_raw.to_owned()))?;
            let intensity = obj
                .get("intensity")
                .and_then(Value::as_f64)
                .ok_or(FrameError::MissingField("intensity"))?;
            let duration_ms = obj
                .get("durationMs")
                .and_then(Value::as_u64)
                .ok_or(FrameError::MissingField("durationMs"))?;
            ClientFrame::ManualEffect {
                effect_type,
                intensity,
                duration_ms,
                session_id: obj
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                video_time: obj.get("videoTime").and_then(Value::as_f64),
            }
        }
        Some(other) => return Ok(ParsedFrame::UnknownTag(other.to_owned())),
    };
    Ok(ParsedFrame::Known(frame))
}

pub mod encode {
    //! Server→client frame encoding.

    use serde_json::{json, Value};

    use crate::model::{Effect, ExperimentGroup};

    /// `connection_established`, sent once after a successful handshake.
    #[must_use]
    pub fn connection_established(
        user_id: &str,
        experiment_group: ExperimentGroup,
        is_host: bool,
        message: &str,
        timestamp_iso: &str,
    ) -> Value {
        json!({
            "type": "connection_established",
            "userId": user_id,
            "experimentGroup": experiment_group.as_str(),
            "isHost": is_host,
            "message": message,
            "timestamp": timestamp_iso,
        })
    }

    /// `effect`, the at-most-one-per-tick broadcast decision.
    #[must_use]
    pub fn effect(effect: &Effect) -> Value {
        let debug = effect.debug.as_ref().map(|d| {
            json!({
                "activeUsers": d.active_users,
                "ratioState": d.ratio_state,
                "densityEvent": d.density_event,
            })
        });
        json!({
            "type": "effect",
            "effectType": effect.effect_type.as_str(),
            "intensity": effect.intensity,
            "durationMs": effect.duration_ms,
            "timestamp": effect.server_send_ms,
            "debug": debug,
        })
    }

    /// Relayed `video_play` / `video_pause` / `video_seek`.
    #[must_use]
    pub fn video_transport(tag: &str, current_time: f64, timestamp_ms: u64) -> Value {
        json!({
            "type": tag,
            "currentTime": current_time,
            "timestamp": timestamp_ms,
        })
    }

    /// `time_sync_request` forwarded to the host.
    #[must_use]
    pub fn time_sync_request(requester_id: &str) -> Value {
        json!({
            "type": "time_sync_request",
            "requesterId": requester_id,
        })
    }

    /// `time_sync_response` forwarded back to the requester.
    #[must_use]
    pub fn time_sync_response(current_time: f64) -> Value {
        json!({
            "type": "time_sync_response",
            "currentTime": current_time,
        })
    }

    /// `video_url_selected`, broadcast so late joiners can leave the
    /// waiting screen.
    #[must_use]
    pub fn video_url_selected(video_id: &str) -> Value {
        json!({
            "type": "video_url_selected",
            "videoId": video_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EffectType;

    #[test]
    fn parse_handshake_defaults_group_and_host() {
        let h = parse_handshake(r#"{"userId":"u-1"}"#).expect("handshake");
        assert_eq!(h.user_id, "u-1");
        assert_eq!(h.experiment_group, ExperimentGroup::Control2);
        assert!(!h.is_host);
    }

    #[test]
    fn parse_handshake_rejects_empty_user_id() {
        let err = parse_handshake(r#"{"userId":""}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("userId")));
    }

    #[test]
    fn parse_handshake_rejects_missing_user_id() {
        let err = parse_handshake(r#"{"isHost":true}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("userId")));
    }

    #[test]
    fn untagged_object_with_states_is_a_reaction_sample() {
        let raw = r#"{"states":{"isSmiling":true},"events":{"nod":2},"videoTime":12.5,"sessionId":"s1"}"#;
        let parsed = parse_frame(raw).expect("parse");
        let ParsedFrame::Known(ClientFrame::Reaction(r)) = parsed else {
            panic!("expected reaction frame");
        };
        assert!(r.states.is_smiling);
        assert!(!r.states.is_surprised);
        assert_eq!(r.events.nod, 2);
        assert_eq!(r.events.clap, 0);
        assert_eq!(r.video_time_seconds, Some(12.5));
        assert_eq!(r.session_id.as_deref(), Some("s1"));
    }

    #[test]
    fn explicit_type_reaction_parses_same_as_untagged() {
        let raw = r#"{"type":"reaction","states":{},"events":{}}"#;
        let parsed = parse_frame(raw).expect("parse");
        assert!(matches!(
            parsed,
            ParsedFrame::Known(ClientFrame::Reaction(_))
        ));
    }

    #[test]
    fn reaction_ignores_unknown_state_and_event_names() {
        let raw = r#"{"states":{"isSmiling":true,"bogus":true},"events":{"nod":1,"bogus":9}}"#;
        let ParsedFrame::Known(ClientFrame::Reaction(r)) = parse_frame(raw).unwrap() else {
            panic!("expected reaction");
        };
        assert!(r.states.is_smiling);
        assert_eq!(r.events.nod, 1);
    }

    #[test]
    fn video_play_requires_current_time() {
        let err = parse_frame(r#"{"type":"video_play"}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("currentTime")));
    }

    #[test]
    fn video_play_parses() {
        let parsed = parse_frame(r#"{"type":"video_play","currentTime":42.0}"#).unwrap();
        assert_eq!(
            parsed,
            ParsedFrame::Known(ClientFrame::VideoTransport {
                kind: TransportKind::Play,
                current_time: 42.0
            })
        );
    }

    #[test]
    fn unknown_tag_is_not_an_error() {
        let parsed = parse_frame(r#"{"type":"something_else"}"#).unwrap();
        assert_eq!(parsed, ParsedFrame::UnknownTag("something_else".to_owned()));
    }

    #[test]
    fn manual_effect_rejects_unknown_effect_type() {
        let raw = r#"{"type":"manual_effect","effectType":"nonsense","intensity":1.0,"durationMs":2000}"#;
        let err = parse_frame(raw).unwrap_err();
        assert!(matches!(err, FrameError::UnknownEffectType(_)));
    }

    #[test]
    fn manual_effect_parses_known_effect_type() {
        let raw = r#"{"type":"manual_effect","effectType":"sparkle","intensity":1.0,"durationMs":2000,"sessionId":"s","videoTime":10.0}"#;
        let parsed = parse_frame(raw).unwrap();
        assert_eq!(
            parsed,
            ParsedFrame::Known(ClientFrame::ManualEffect {
                effect_type: EffectType::Sparkle,
                intensity: 1.0,
                duration_ms: 2000,
                session_id: Some("s".to_owned()),
                video_time: Some(10.0),
            })
        );
    }

    #[test]
    fn time_sync_response_requires_requester_and_time() {
        let err = parse_frame(r#"{"type":"time_sync_response","requesterId":"u2"}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("currentTime")));
    }

    #[test]
    fn non_object_frame_errors() {
        let err = parse_frame("[1,2,3]").unwrap_err();
        assert!(matches!(err, FrameError::NotAnObject));
    }

    #[test]
    fn invalid_json_errors() {
        let err = parse_frame("{not json").unwrap_err();
        assert!(matches!(err, FrameError::InvalidJson(_)));
    }
}
