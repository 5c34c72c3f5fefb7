//! Inbound client messages
//!
//! Parsing happens in two steps: the `type` field is read first so unknown
//! kinds can be told apart from malformed frames, then the body is decoded
//! for that kind. Signaling bodies are kept as raw JSON so the payload reaches
//! the target exactly as the sender wrote it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::value::{to_raw_value, RawValue};

use crate::error::ProtocolError;
use crate::registry::Role;

/// Fields accepted as the target identity of a signaling message
const TARGET_FIELDS: [&str; 3] = ["to", "target", "userId"];

/// Discriminator of every inbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    Register,
    ViewerJoin,
    Join,
    Offer,
    Answer,
    IceCandidate,
    StartStream,
    StreamData,
    StopStream,
    Leave,
}

impl MessageKind {
    /// Every message kind
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Register,
        MessageKind::ViewerJoin,
        MessageKind::Join,
        MessageKind::Offer,
        MessageKind::Answer,
        MessageKind::IceCandidate,
        MessageKind::StartStream,
        MessageKind::StreamData,
        MessageKind::StopStream,
        MessageKind::Leave,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Register => "register",
            MessageKind::ViewerJoin => "viewer-join",
            MessageKind::Join => "join",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
            MessageKind::StartStream => "start-stream",
            MessageKind::StreamData => "stream-data",
            MessageKind::StopStream => "stop-stream",
            MessageKind::Leave => "leave",
        }
    }

    /// Whether this kind moves a session from unregistered to registered
    pub fn is_registration(&self) -> bool {
        matches!(
            self,
            MessageKind::Register | MessageKind::ViewerJoin | MessageKind::Join
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

/// Session negotiation message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    fn from_message_kind(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Offer => Some(SignalKind::Offer),
            MessageKind::Answer => Some(SignalKind::Answer),
            MessageKind::IceCandidate => Some(SignalKind::IceCandidate),
            _ => None,
        }
    }

    /// Corresponding message kind
    pub fn message_kind(&self) -> MessageKind {
        match self {
            SignalKind::Offer => MessageKind::Offer,
            SignalKind::Answer => MessageKind::Answer,
            SignalKind::IceCandidate => MessageKind::IceCandidate,
        }
    }
}

/// An offer, answer or ICE candidate on its way to another connection
///
/// Only the routing fields are interpreted. Every other field stays raw JSON
/// text and is written back out unchanged.
#[derive(Debug)]
pub struct SignalEnvelope {
    /// Negotiation step
    pub kind: SignalKind,
    /// Target identity
    pub to: String,
    /// Opaque negotiation fields
    pub payload: BTreeMap<String, Box<RawValue>>,
}

impl SignalEnvelope {
    fn from_fields(
        kind: SignalKind,
        mut fields: BTreeMap<String, Box<RawValue>>,
    ) -> Result<Self, ProtocolError> {
        fields.remove("type");
        // The sender identity comes from the session, never from the client.
        fields.remove("from");

        let mut to = None;
        for field in TARGET_FIELDS {
            if let Some(raw) = fields.remove(field) {
                if to.is_none() {
                    let target: String = serde_json::from_str(raw.get()).map_err(|e| {
                        ProtocolError::Malformed(format!("{} must be a string: {}", field, e))
                    })?;
                    to = Some(target);
                }
            }
        }

        let to = to.ok_or_else(|| {
            ProtocolError::Malformed(format!("{} has no target", kind.message_kind()))
        })?;

        Ok(Self {
            kind,
            to,
            payload: fields,
        })
    }

    /// Encode the frame delivered to the target
    ///
    /// `from` is stamped by the router. With `echo_user_id` the sender is also
    /// written to `userId`, the field peer-only clients key their peers on.
    pub fn to_frame(&self, from: &str, echo_user_id: bool) -> Result<String, ProtocolError> {
        let encode = |e: serde_json::Error| ProtocolError::Encode(e.to_string());
        let kind = to_raw_value(self.kind.message_kind().as_str()).map_err(encode)?;
        let sender = to_raw_value(from).map_err(encode)?;

        let mut frame: BTreeMap<&str, &RawValue> = self
            .payload
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_ref()))
            .collect();
        frame.insert("type", &kind);
        frame.insert("from", &sender);
        if echo_user_id {
            frame.insert("userId", &sender);
        }

        serde_json::to_string(&frame).map_err(encode)
    }
}

#[derive(Deserialize)]
struct TypeTag {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ControlMessage {
    Register {
        username: String,
        #[serde(default, rename = "isStreamer")]
        is_streamer: bool,
        #[serde(default)]
        role: Option<Role>,
    },
    ViewerJoin {
        username: String,
    },
    Join {
        #[serde(default)]
        username: Option<String>,
    },
    StartStream {
        #[serde(default, rename = "streamKey")]
        stream_key: Option<String>,
    },
    StreamData {
        chunk: Vec<u8>,
    },
    StopStream {},
    Leave {},
}

/// A decoded inbound message
#[derive(Debug)]
pub enum Envelope {
    /// Named registration as publisher, viewer or peer
    Register { identity: String, role: Role },
    /// Named registration as viewer, answered with the live stream list
    ViewerJoin { identity: String },
    /// Anonymous peer registration; the server assigns the identity
    Join { display_name: Option<String> },
    /// Offer, answer or ICE candidate to forward
    Signal(SignalEnvelope),
    /// Start (or restart) the sender's ingest pipeline
    StartStream { stream_key: Option<String> },
    /// Media bytes for the sender's pipeline
    StreamData(Bytes),
    /// Stop the sender's ingest pipeline
    StopStream,
    /// Explicit departure
    Leave,
}

impl Envelope {
    /// Parse a JSON text frame
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let tag: TypeTag =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        let kind: MessageKind = tag.kind.ok_or(ProtocolError::MissingType)?.parse()?;

        if let Some(signal) = SignalKind::from_message_kind(kind) {
            let fields: BTreeMap<String, Box<RawValue>> = serde_json::from_str(text)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            return SignalEnvelope::from_fields(signal, fields).map(Envelope::Signal);
        }

        let control: ControlMessage = serde_json::from_str(text)
            .map_err(|e| ProtocolError::Malformed(format!("{}: {}", kind, e)))?;

        Ok(match control {
            ControlMessage::Register {
                username,
                is_streamer,
                role,
            } => {
                let role = role.unwrap_or(if is_streamer {
                    Role::Publisher
                } else {
                    Role::Peer
                });
                Envelope::Register {
                    identity: username,
                    role,
                }
            }
            ControlMessage::ViewerJoin { username } => Envelope::ViewerJoin { identity: username },
            ControlMessage::Join { username } => Envelope::Join {
                display_name: username,
            },
            ControlMessage::StartStream { stream_key } => Envelope::StartStream { stream_key },
            ControlMessage::StreamData { chunk } => Envelope::StreamData(Bytes::from(chunk)),
            ControlMessage::StopStream {} => Envelope::StopStream,
            ControlMessage::Leave {} => Envelope::Leave,
        })
    }

    /// Kind of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            Envelope::Register { .. } => MessageKind::Register,
            Envelope::ViewerJoin { .. } => MessageKind::ViewerJoin,
            Envelope::Join { .. } => MessageKind::Join,
            Envelope::Signal(signal) => signal.kind.message_kind(),
            Envelope::StartStream { .. } => MessageKind::StartStream,
            Envelope::StreamData(_) => MessageKind::StreamData,
            Envelope::StopStream => MessageKind::StopStream,
            Envelope::Leave => MessageKind::Leave,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
        assert!(MessageKind::Join.is_registration());
        assert!(!MessageKind::StreamData.is_registration());
    }

    #[test]
    fn test_parse_register_roles() {
        let env = Envelope::parse(r#"{"type":"register","username":"alice","isStreamer":true}"#)
            .unwrap();
        assert!(matches!(
            env,
            Envelope::Register { ref identity, role: Role::Publisher } if identity == "alice"
        ));

        let env = Envelope::parse(r#"{"type":"register","username":"bob"}"#).unwrap();
        assert!(matches!(env, Envelope::Register { role: Role::Peer, .. }));

        // Explicit role wins over the legacy flag
        let env = Envelope::parse(
            r#"{"type":"register","username":"v","isStreamer":true,"role":"viewer"}"#,
        )
        .unwrap();
        assert!(matches!(env, Envelope::Register { role: Role::Viewer, .. }));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            Envelope::parse(r#"{"username":"x"}"#).unwrap_err(),
            ProtocolError::MissingType
        );
        assert_eq!(
            Envelope::parse(r#"{"type":"dance"}"#).unwrap_err(),
            ProtocolError::UnknownType("dance".into())
        );
        assert!(matches!(
            Envelope::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":"register"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":"offer","offer":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_stream_data_ignores_legacy_username() {
        let env =
            Envelope::parse(r#"{"type":"stream-data","username":"alice","chunk":[1,2,3]}"#)
                .unwrap();
        match env {
            Envelope::StreamData(chunk) => assert_eq!(&chunk[..], &[1, 2, 3]),
            other => panic!("unexpected envelope: {:?}", other),
        }

        let env = Envelope::parse(r#"{"type":"stop-stream","username":"alice"}"#).unwrap();
        assert_eq!(env.kind(), MessageKind::StopStream);
    }

    #[test]
    fn test_signal_target_aliases() {
        for field in ["to", "target", "userId"] {
            let text = format!(r#"{{"type":"answer","{}":"carol","answer":{{"sdp":"x"}}}}"#, field);
            match Envelope::parse(&text).unwrap() {
                Envelope::Signal(signal) => {
                    assert_eq!(signal.to, "carol");
                    assert_eq!(signal.kind, SignalKind::Answer);
                    assert!(!signal.payload.contains_key(field));
                }
                other => panic!("unexpected envelope: {:?}", other),
            }
        }
    }

    #[test]
    fn test_signal_payload_forwarded_verbatim() {
        let text = r#"{"type":"offer","target":"carol","from":"mallory","offer":{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 0.0.0.0"},"n":1.50}"#;
        let signal = match Envelope::parse(text).unwrap() {
            Envelope::Signal(signal) => signal,
            other => panic!("unexpected envelope: {:?}", other),
        };

        let frame = signal.to_frame("bob", false).unwrap();
        assert_eq!(
            frame,
            r#"{"from":"bob","n":1.50,"offer":{"type":"offer","sdp":"v=0\r\no=- 1 2 IN IP4 0.0.0.0"},"type":"offer"}"#
        );

        let frame = signal.to_frame("bob", true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["userId"], "bob");
        assert_eq!(value["from"], "bob");
    }
}
