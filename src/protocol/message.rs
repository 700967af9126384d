//! Application messages and the simple/advanced formatting conventions.
//!
//! In simple mode the frame payload is the whole message. In advanced mode
//! every text message is a JSON envelope pairing an event name with its data:
//!
//! ```text
//! {"event": "chat", "data": {"from": "ada", "text": "hi"}}
//! ```
//!
//! Binary messages are passed through verbatim in both modes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::assembler::Incoming;
use crate::core::frame::{chunk_and_wrap, Frame, OpCode};
use crate::error::Result;

/// Event name used when a plain text message is sent in advanced mode.
pub const DEFAULT_EVENT: &str = "message";

/// Messaging convention of a connection or group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Simple,
    Advanced,
}

/// Wire form of an advanced-mode message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// A logical message as seen by the application.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Event { event: String, data: Value },
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Message::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Event message with any serializable data.
    pub fn event(event: impl Into<String>, data: impl Serialize) -> Result<Self> {
        Ok(Message::Event {
            event: event.into(),
            data: serde_json::to_value(data)?,
        })
    }

    /// Event name, for event messages.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Message::Event { event, .. } => Some(event),
            _ => None,
        }
    }

    /// Opcode and payload for `mode`, before any chunking.
    pub fn format(&self, mode: Mode) -> Result<(OpCode, Bytes)> {
        match (self, mode) {
            (Message::Binary(data), _) => Ok((OpCode::Binary, data.clone())),
            (Message::Text(text), Mode::Simple) => Ok((OpCode::Text, Bytes::from(text.clone()))),
            (Message::Text(text), Mode::Advanced) => encode_envelope(DEFAULT_EVENT, &Value::String(text.clone())),
            (Message::Event { event, data }, _) => encode_envelope(event, data),
        }
    }

    /// Formatted frames, split so no frame payload exceeds `max_chunk`.
    ///
    /// Frames are unmasked; the codec adds keys for the client role.
    pub fn to_frames(&self, mode: Mode, max_chunk: usize) -> Result<Vec<Frame>> {
        let (opcode, payload) = self.format(mode)?;
        Ok(chunk_and_wrap(opcode, payload, false, max_chunk))
    }

    /// Interpret a reassembled data message under `mode`.
    ///
    /// Control frames yield `Ok(None)`.
    pub fn parse(incoming: Incoming, mode: Mode) -> Result<Option<Self>> {
        match (incoming, mode) {
            (Incoming::Text(text), Mode::Simple) => Ok(Some(Message::Text(text))),
            (Incoming::Text(text), Mode::Advanced) => {
                let envelope: Envelope = serde_json::from_str(&text)?;
                Ok(Some(Message::Event {
                    event: envelope.event,
                    data: envelope.data,
                }))
            }
            (Incoming::Binary(data), _) => Ok(Some(Message::Binary(data))),
            (Incoming::Control(_), _) => Ok(None),
        }
    }
}

fn encode_envelope(event: &str, data: &Value) -> Result<(OpCode, Bytes)> {
    #[derive(Serialize)]
    struct EnvelopeRef<'a> {
        event: &'a str,
        data: &'a Value,
    }
    let json = serde_json::to_vec(&EnvelopeRef { event, data })?;
    Ok((OpCode::Text, Bytes::from(json)))
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::Text(text)
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::Text(text.to_string())
    }
}

impl From<Bytes> for Message {
    fn from(data: Bytes) -> Self {
        Message::Binary(data)
    }
}

impl From<Vec<u8>> for Message {
    fn from(data: Vec<u8>) -> Self {
        Message::Binary(data.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn simple_mode_is_verbatim() {
        let (op, payload) = Message::text("hi").format(Mode::Simple).unwrap();
        assert_eq!(op, OpCode::Text);
        assert_eq!(&payload[..], b"hi");
    }

    #[test]
    fn advanced_mode_wraps_text() {
        let (op, payload) = Message::text("hi").format(Mode::Advanced).unwrap();
        assert_eq!(op, OpCode::Text);
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"event": "message", "data": "hi"}));
    }

    #[test]
    fn event_round_trip() {
        let msg = Message::event("chat", json!({"text": "hello"})).unwrap();
        let (_, payload) = msg.format(Mode::Advanced).unwrap();
        let text = String::from_utf8(payload.to_vec()).unwrap();

        let parsed = Message::parse(Incoming::Text(text), Mode::Advanced)
            .unwrap()
            .unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.event_name(), Some("chat"));
    }

    #[test]
    fn envelope_without_data() {
        let parsed = Message::parse(Incoming::Text(r#"{"event":"ready"}"#.into()), Mode::Advanced)
            .unwrap()
            .unwrap();
        assert_eq!(
            parsed,
            Message::Event {
                event: "ready".into(),
                data: Value::Null
            }
        );
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        assert!(Message::parse(Incoming::Text("not json".into()), Mode::Advanced).is_err());
    }

    #[test]
    fn large_message_is_chunked() {
        let frames = Message::binary(vec![0u8; 10]).to_frames(Mode::Simple, 4).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Binary);
        assert!(frames[2].fin);
    }
}
