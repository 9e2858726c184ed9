//! Data-channel wire format.
//!
//! Every payload on the message channel is UTF-8 JSON. Chat messages carry
//! no `kind` field; control traffic is tagged with `kind`. Payloads are
//! decoded exactly once at the channel boundary into [`WireFrame`].

use crate::ChatMessage;
use serde::{Deserialize, Serialize};

/// Errors produced while decoding or encoding a wire payload.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload is not valid JSON or does not match a control shape.
    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload is valid JSON but not an object.
    #[error("payload is not a JSON object")]
    NotAnObject,

    /// A required chat field is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// A required chat field is present but empty.
    #[error("required field `{0}` is empty")]
    EmptyField(&'static str),
}

/// Control traffic, never shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Acknowledges receipt of a chat message.
    DeliveryReceipt {
        #[serde(rename = "messageId")]
        message_id: String,
        ts: i64,
    },
    /// Signals that the sender started or stopped typing.
    TypingIndicator {
        #[serde(rename = "senderId")]
        sender_id: String,
        #[serde(rename = "isTyping")]
        is_typing: bool,
        ts: i64,
    },
}

/// A decoded data-channel payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Chat(ChatMessage),
    Control(ControlFrame),
}

impl WireFrame {
    /// Encodes the frame as UTF-8 JSON.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let bytes = match self {
            Self::Chat(message) => serde_json::to_vec(message)?,
            Self::Control(control) => serde_json::to_vec(control)?,
        };
        Ok(bytes)
    }
}

/// Untyped view of a chat payload so each missing field can be reported.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChat {
    id: Option<String>,
    sender_id: Option<String>,
    sender_name: Option<String>,
    text: Option<String>,
    ts: Option<i64>,
}

/// Decodes one raw payload into a [`WireFrame`].
///
/// Any payload carrying a `kind` field is treated as control traffic; an
/// unrecognised `kind` is rejected rather than surfaced as chat.
pub fn decode_frame(bytes: &[u8]) -> Result<WireFrame, FrameError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    if !value.is_object() {
        return Err(FrameError::NotAnObject);
    }

    if value.get("kind").is_some() {
        let control: ControlFrame = serde_json::from_value(value)?;
        return Ok(WireFrame::Control(control));
    }

    let raw: RawChat = serde_json::from_value(value)?;
    let id = require_non_empty(raw.id, "id")?;
    let sender_id = require_non_empty(raw.sender_id, "senderId")?;
    let text = require_non_empty(raw.text, "text")?;
    let ts = raw.ts.ok_or(FrameError::MissingField("ts"))?;

    Ok(WireFrame::Chat(ChatMessage {
        id,
        sender_id,
        sender_name: raw.sender_name.filter(|name| !name.is_empty()),
        text,
        ts,
    }))
}

fn require_non_empty(value: Option<String>, field: &'static str) -> Result<String, FrameError> {
    match value {
        None => Err(FrameError::MissingField(field)),
        Some(v) if v.trim().is_empty() => Err(FrameError::EmptyField(field)),
        Some(v) => Ok(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chat_message() {
        let frame = decode_frame(
            br#"{"id":"m1","senderId":"agent","senderName":"Agent","text":"hello","ts":1700000000000}"#,
        )
        .unwrap();

        match frame {
            WireFrame::Chat(msg) => {
                assert_eq!(msg.id, "m1");
                assert_eq!(msg.sender_id, "agent");
                assert_eq!(msg.sender_name.as_deref(), Some("Agent"));
                assert_eq!(msg.ts, 1_700_000_000_000);
            }
            other => panic!("expected chat frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_delivery_receipt() {
        let frame = decode_frame(br#"{"kind":"delivery_receipt","messageId":"m1","ts":5}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Control(ControlFrame::DeliveryReceipt {
                message_id: "m1".to_string(),
                ts: 5,
            })
        );
    }

    #[test]
    fn decodes_typing_indicator() {
        let frame = decode_frame(
            br#"{"kind":"typing_indicator","senderId":"agent","isTyping":true,"ts":9}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            WireFrame::Control(ControlFrame::TypingIndicator {
                sender_id: "agent".to_string(),
                is_typing: true,
                ts: 9,
            })
        );
    }

    #[test]
    fn unknown_control_kind_is_rejected() {
        let err = decode_frame(br#"{"kind":"reaction","id":"m1","senderId":"a","text":"x","ts":1}"#)
            .unwrap_err();
        assert!(matches!(err, FrameError::Json(_)));
    }

    #[test]
    fn rejects_chat_without_required_fields() {
        let err = decode_frame(br#"{"id":"m1","senderId":"a","ts":1}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("text")));

        let err = decode_frame(br#"{"id":"m1","senderId":"a","text":"  ","ts":1}"#).unwrap_err();
        assert!(matches!(err, FrameError::EmptyField("text")));

        let err = decode_frame(br#"{"id":"m1","senderId":"a","text":"x"}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("ts")));

        let err = decode_frame(br#"{"senderId":"a","text":"x","ts":1}"#).unwrap_err();
        assert!(matches!(err, FrameError::MissingField("id")));
    }

    #[test]
    fn rejects_non_object_and_invalid_json() {
        assert!(matches!(decode_frame(b"[1,2]"), Err(FrameError::NotAnObject)));
        assert!(matches!(decode_frame(b"not json"), Err(FrameError::Json(_))));
    }

    #[test]
    fn encoded_control_frames_carry_kind_tag() {
        let bytes = WireFrame::Control(ControlFrame::TypingIndicator {
            sender_id: "me".to_string(),
            is_typing: false,
            ts: 3,
        })
        .encode()
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "typing_indicator");
        assert_eq!(json["senderId"], "me");
        assert_eq!(json["isTyping"], false);
    }
}
