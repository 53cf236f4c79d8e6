//! Wire framing: the outer envelope plus the client/server frame sum types.
//!
//! Decoding happens in two stages, following the same shape as the header/body
//! split used for inbound client messages elsewhere in this codebase: first the
//! envelope is decoded with its payload left as raw JSON, then the payload is
//! decoded a second time once the `type` tag says which shape to expect. This
//! keeps an unknown or malformed payload from poisoning the whole frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::models::{ChatId, MessageId, MessageKind};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("invalid payload for type {type_}: {source}")]
    InvalidPayload {
        type_: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Outer envelope as received off the wire. `payload` is left undecoded until
/// the `type` tag is known.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope<'a> {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(borrow)]
    pub payload: &'a RawValue,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub chat_id: ChatId,
    pub content: String,
    #[serde(default)]
    pub message_type: Option<MessageKind>,
    pub media_url: Option<String>,
    pub reply_to_id: Option<MessageId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageIdPayload {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatIdPayload {
    pub chat_id: ChatId,
}

/// A decoded client-originated frame, dispatched to an intent handler.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    SendMessage(SendMessagePayload),
    ReadMessage(MessageIdPayload),
    ReadChat(ChatIdPayload),
    TypingStart(ChatIdPayload),
    TypingStop(ChatIdPayload),
    SubscribeChat(ChatIdPayload),
    UnsubscribeChat(ChatIdPayload),
    Ping,
}

pub fn decode_client_frame(raw: &[u8]) -> Result<ClientFrame, CodecError> {
    let envelope: RawEnvelope = serde_json::from_slice(raw)?;
    let payload = |type_: &str| -> Result<_, CodecError> {
        serde_json::from_str(envelope.payload.get()).map_err(|source| CodecError::InvalidPayload {
            type_: type_.to_string(),
            source,
        })
    };

    Ok(match envelope.type_.as_str() {
        "send_message" => ClientFrame::SendMessage(payload("send_message")?),
        "read_message" => ClientFrame::ReadMessage(payload("read_message")?),
        "read_chat" => ClientFrame::ReadChat(payload("read_chat")?),
        "typing_start" => ClientFrame::TypingStart(payload("typing_start")?),
        "typing_stop" => ClientFrame::TypingStop(payload("typing_stop")?),
        "subscribe_chat" => ClientFrame::SubscribeChat(payload("subscribe_chat")?),
        "unsubscribe_chat" => ClientFrame::UnsubscribeChat(payload("unsubscribe_chat")?),
        "ping" => ClientFrame::Ping,
        other => return Err(CodecError::UnknownType(other.to_string())),
    })
}

/// A server-originated frame, serialized to bytes before entering a session's
/// outbound queue.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Message(crate::models::Message),
    MessageRead {
        message_id: MessageId,
        user_id: crate::models::UserId,
        read_at: DateTime<Utc>,
    },
    Typing {
        chat_id: ChatId,
        user_id: crate::models::UserId,
        user_name: String,
        is_typing: bool,
    },
    UserOnline {
        user_id: crate::models::UserId,
        username: String,
        is_online: bool,
    },
    UserOffline {
        user_id: crate::models::UserId,
        username: String,
        is_online: bool,
        last_seen: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> Vec<u8> {
        #[derive(Serialize)]
        struct Wire<'a> {
            #[serde(flatten)]
            frame: &'a ServerFrame,
            timestamp: DateTime<Utc>,
        }
        serde_json::to_vec(&Wire {
            frame: self,
            timestamp: Utc::now(),
        })
        .expect("ServerFrame serialization is infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_send_message() {
        let raw = br#"{"type":"send_message","payload":{"chat_id":"6ba7b810-9dad-11d1-80b4-00c04fd430c8","content":"hi"}}"#;
        match decode_client_frame(raw).unwrap() {
            ClientFrame::SendMessage(p) => assert_eq!(p.content, "hi"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_an_error() {
        let raw = br#"{"type":"not_a_real_type","payload":{}}"#;
        assert!(matches!(
            decode_client_frame(raw),
            Err(CodecError::UnknownType(_))
        ));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        let raw = br#"{"type":"send_message","payload":{"chat_id":"not-a-uuid"}}"#;
        assert!(matches!(
            decode_client_frame(raw),
            Err(CodecError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn ping_has_no_payload_fields() {
        let raw = br#"{"type":"ping","payload":{}}"#;
        assert!(matches!(decode_client_frame(raw).unwrap(), ClientFrame::Ping));
    }
}
