//! Signaling messages and their relay wire format.
//!
//! Relay entries are JSON objects with a required `type` field:
//!
//! ```json
//! {"type": "offer",  "sdp": "v=0..."}
//! {"type": "answer", "sdp": "v=0..."}
//! {"type": "ice", "sdpMid": "0", "sdpMLineIndex": 0, "candidate": "candidate:1 ..."}
//! ```

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::IceCandidate;

/// A signaling message. Routing is by relay address, never by content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    #[serde(rename = "ice")]
    IceCandidate(IceCandidate),
}

/// Why a relay entry could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("entry is not an object")]
    NotAnObject,

    #[error("entry has no 'type' field")]
    MissingType,

    #[error("unknown entry type '{0}'")]
    UnknownType(String),

    #[error("malformed '{kind}' entry: {message}")]
    Malformed { kind: String, message: String },
}

impl SignalMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate(_) => "ice",
        }
    }

    pub fn to_wire(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Decode a relay entry.
    ///
    /// Structural problems are reported as [`WireError`]; the SDP body itself
    /// is not inspected here.
    pub fn from_wire(value: &Value) -> Result<Self, WireError> {
        let object = value.as_object().ok_or(WireError::NotAnObject)?;
        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(WireError::MissingType)?;

        match kind {
            "offer" | "answer" | "ice" => {}
            other => return Err(WireError::UnknownType(other.to_string())),
        }

        let message: SignalMessage =
            serde_json::from_value(value.clone()).map_err(|e| WireError::Malformed {
                kind: kind.to_string(),
                message: e.to_string(),
            })?;

        if let SignalMessage::IceCandidate(candidate) = &message {
            if candidate.candidate.trim().is_empty() {
                return Err(WireError::Malformed {
                    kind: kind.to_string(),
                    message: "empty candidate line".to_string(),
                });
            }
        }

        Ok(message)
    }
}

/// Accepts `sdpMLineIndex` as a JSON integer or as a numeric string.
pub(crate) fn lenient_line_index<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawIndex {
        Number(u64),
        Text(String),
    }

    match RawIndex::deserialize(deserializer)? {
        RawIndex::Number(n) => u16::try_from(n)
            .map_err(|_| D::Error::custom(format!("sdpMLineIndex {} out of range", n))),
        RawIndex::Text(text) => text
            .trim()
            .parse::<u16>()
            .map_err(|e| D::Error::custom(format!("sdpMLineIndex '{}': {}", text, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_encode_ice_uses_wire_names() {
        let message = SignalMessage::IceCandidate(IceCandidate::new("0", 0, "candidate:1 1 UDP 1 10.0.0.1 9 typ host"));
        assert_eq!(
            message.to_wire().unwrap(),
            json!({
                "type": "ice",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "candidate": "candidate:1 1 UDP 1 10.0.0.1 9 typ host",
            })
        );
    }

    #[test]
    fn test_encode_offer() {
        let message = SignalMessage::Offer { sdp: "v=0...A".to_string() };
        assert_eq!(message.to_wire().unwrap(), json!({"type": "offer", "sdp": "v=0...A"}));
    }

    #[test]
    fn test_decode_answer() {
        let decoded = SignalMessage::from_wire(&json!({"type": "answer", "sdp": "v=0...B"})).unwrap();
        assert_eq!(decoded, SignalMessage::Answer { sdp: "v=0...B".to_string() });
    }

    #[test]
    fn test_decode_line_index_as_string() {
        let decoded = SignalMessage::from_wire(&json!({
            "type": "ice",
            "sdpMid": "video",
            "sdpMLineIndex": "1",
            "candidate": "candidate:2 ...",
        }))
        .unwrap();
        assert_eq!(decoded, SignalMessage::IceCandidate(IceCandidate::new("video", 1, "candidate:2 ...")));
    }

    #[test]
    fn test_decode_rejects_missing_type() {
        assert_eq!(
            SignalMessage::from_wire(&json!({"sdp": "v=0"})),
            Err(WireError::MissingType)
        );
        assert_eq!(
            SignalMessage::from_wire(&json!({"type": 5, "sdp": "v=0"})),
            Err(WireError::MissingType)
        );
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        assert_eq!(
            SignalMessage::from_wire(&json!({"type": "bye"})),
            Err(WireError::UnknownType("bye".to_string()))
        );
    }

    #[test]
    fn test_decode_rejects_malformed_entries() {
        assert!(matches!(
            SignalMessage::from_wire(&json!({"type": "answer"})),
            Err(WireError::Malformed { .. })
        ));
        assert!(matches!(
            SignalMessage::from_wire(&json!({"type": "ice", "sdpMid": "0", "sdpMLineIndex": -1, "candidate": "c"})),
            Err(WireError::Malformed { .. })
        ));
        assert!(matches!(
            SignalMessage::from_wire(&json!({"type": "ice", "sdpMid": "0", "sdpMLineIndex": 0, "candidate": ""})),
            Err(WireError::Malformed { .. })
        ));
        assert_eq!(SignalMessage::from_wire(&json!("offer")), Err(WireError::NotAnObject));
    }
}
