//! Message encoding
//!
//! Every payload is a JSON envelope:
//!
//! ```text
//! {"type":"PlaybackCommand","deviceId":"dev-a","timestamp":1700000000000,"data":{"action":"Next"}}
//! ```
//!
//! Decoding reads the envelope first and dispatches on `type`, so the
//! variant never has to be guessed from the shape of the payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::message::{Message, MessageBody};
use crate::identity::PeerIdentity;

#[derive(Debug, Error)]
#[error("Failed to encode {kind} message: {source}")]
pub struct EncodeError {
    pub kind: &'static str,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed message envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownVariant(String),

    #[error("Malformed {kind} message: {source}")]
    Body {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundEnvelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    device_id: &'a PeerIdentity,
    timestamp: u64,
    data: &'a T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    device_id: PeerIdentity,
    timestamp: u64,
    #[serde(default)]
    data: serde_json::Value,
}

/// Encode a message to its JSON payload (single line, no trailing newline)
pub fn encode(message: &Message) -> Result<String, EncodeError> {
    match &message.body {
        MessageBody::Announce(data) => encode_with(message, data),
        MessageBody::PlaybackState(data) => encode_with(message, data),
        MessageBody::PlaybackCommand(data) => encode_with(message, data),
        MessageBody::QueueSync(data) => encode_with(message, data),
        MessageBody::ConnectionStatus(data) => encode_with(message, data),
    }
}

fn encode_with<T: Serialize>(message: &Message, data: &T) -> Result<String, EncodeError> {
    let envelope = OutboundEnvelope {
        kind: message.kind(),
        device_id: &message.device_id,
        timestamp: message.timestamp,
        data,
    };
    serde_json::to_string(&envelope).map_err(|source| EncodeError {
        kind: message.kind(),
        source,
    })
}

/// Decode a JSON payload produced by [`encode`]
pub fn decode(payload: &str) -> Result<Message, DecodeError> {
    let envelope: InboundEnvelope =
        serde_json::from_str(payload).map_err(DecodeError::Envelope)?;

    let body = match envelope.kind.as_str() {
        "Announce" => MessageBody::Announce(body("Announce", envelope.data)?),
        "PlaybackState" => MessageBody::PlaybackState(body("PlaybackState", envelope.data)?),
        "PlaybackCommand" => {
            MessageBody::PlaybackCommand(body("PlaybackCommand", envelope.data)?)
        }
        "QueueSync" => MessageBody::QueueSync(body("QueueSync", envelope.data)?),
        "ConnectionStatus" => {
            MessageBody::ConnectionStatus(body("ConnectionStatus", envelope.data)?)
        }
        _ => return Err(DecodeError::UnknownVariant(envelope.kind)),
    };

    Ok(Message {
        device_id: envelope.device_id,
        timestamp: envelope.timestamp,
        body,
    })
}

/// Decode a raw frame payload
pub fn decode_frame(payload: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::InvalidUtf8)?;
    decode(text)
}

fn body<T: DeserializeOwned>(kind: &'static str, data: serde_json::Value) -> Result<T, DecodeError> {
    serde_json::from_value(data).map_err(|source| DecodeError::Body { kind, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::*;

    fn msg(body: MessageBody) -> Message {
        Message {
            device_id: PeerIdentity::from("dev-A"),
            timestamp: 1_700_000_000_000,
            body,
        }
    }

    #[test]
    fn test_envelope_shape() {
        let encoded = encode(&msg(MessageBody::PlaybackCommand(PlaybackCommand::new(
            PlaybackAction::Next,
        ))))
        .unwrap();

        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["type"], "PlaybackCommand");
        assert_eq!(value["deviceId"], "dev-A");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
        assert_eq!(value["data"]["action"], "Next");
        assert!(!encoded.contains('\n'));
    }

    #[test]
    fn test_round_trip_every_variant() {
        let track = TrackInfo {
            id: "dQw4w9WgXcQ".to_string(),
            title: "Never Gonna Give You Up".to_string(),
            artist: "Rick Astley".to_string(),
            album: Some("Whenever You Need Somebody".to_string()),
            thumbnail_url: None,
            duration_ms: 213_000,
        };

        let bodies = vec![
            MessageBody::Announce(Announce {
                device_name: "Pixel Watch".to_string(),
                device_type: DeviceType::Watch,
                capabilities: DeviceType::Watch.default_capabilities(),
            }),
            MessageBody::PlaybackState(PlaybackState {
                is_playing: true,
                position_ms: 1000,
                duration_ms: 213_000,
                current_track: Some(track.clone()),
                repeat_mode: RepeatMode::All,
                shuffle_enabled: true,
                volume: 0.5,
            }),
            MessageBody::PlaybackCommand(PlaybackCommand::with_value(PlaybackAction::Seek, "42000")),
            MessageBody::QueueSync(QueueSync {
                queue: vec![track],
                current_index: 0,
            }),
            MessageBody::ConnectionStatus(ConnectionStatus {
                state: LinkState::Disconnected,
                message: Some("bye".to_string()),
            }),
        ];

        for body in bodies {
            let original = msg(body);
            let decoded = decode(&encode(&original).unwrap()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn test_unknown_variant() {
        let payload = r#"{"type":"Lyrics","deviceId":"dev-A","timestamp":1,"data":{}}"#;
        match decode(payload) {
            Err(DecodeError::UnknownVariant(kind)) => assert_eq!(kind, "Lyrics"),
            other => panic!("expected UnknownVariant, got {:?}", other),
        }
    }

    #[test]
    fn test_field_names_do_not_select_variant() {
        // A command whose value mentions another variant's name is still a command
        let payload = r#"{"type":"PlaybackCommand","deviceId":"dev-A","timestamp":1,"data":{"action":"PlaySong","value":"PlaybackState"}}"#;
        let decoded = decode(payload).unwrap();
        assert_eq!(
            decoded.body,
            MessageBody::PlaybackCommand(PlaybackCommand::with_value(
                PlaybackAction::PlaySong,
                "PlaybackState"
            ))
        );
    }

    #[test]
    fn test_body_mismatch_is_decode_error() {
        let payload = r#"{"type":"QueueSync","deviceId":"dev-A","timestamp":1,"data":{"action":"Next"}}"#;
        assert!(matches!(
            decode(payload),
            Err(DecodeError::Body { kind: "QueueSync", .. })
        ));
        assert!(matches!(decode("not json"), Err(DecodeError::Envelope(_))));
        assert!(matches!(
            decode_frame(&[0xff, 0xfe]),
            Err(DecodeError::InvalidUtf8)
        ));
    }
}
