//! Log command wire codec.
//!
//! Every mutating request is encoded into a single byte blob before it is
//! handed to the replicated log, and decoded again by the state machine on
//! apply. The log itself treats commands as opaque bytes.
//!
//! Frame layout:
//!
//! ```text
//! [1 byte kind][u32 BE payload length][bincode payload]
//! ```
//!
//! Kind values: `0x01 = SetPair`, `0x02 = DeletePair`. A frame that fails to
//! decode during apply is logged and skipped; it never takes down the node.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const KIND_SET_PAIR: u8 = 0x01;
pub const KIND_DELETE_PAIR: u8 = 0x02;

/// A decoded log command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    SetPair { key: String, value: String },
    DeletePair { key: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetPairPayload {
    key: String,
    value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeletePairPayload {
    key: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty command frame")]
    Empty,

    #[error("unknown command kind 0x{0:02x}")]
    UnknownKind(u8),

    #[error("truncated command frame: expected {expected} payload bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("payload decode failed: {0}")]
    Payload(String),
}

impl Command {
    pub fn kind(&self) -> u8 {
        match self {
            Command::SetPair { .. } => KIND_SET_PAIR,
            Command::DeletePair { .. } => KIND_DELETE_PAIR,
        }
    }

    /// Encode into the wire frame submitted to the replicated log.
    pub fn encode(&self) -> Vec<u8> {
        let payload = match self {
            Command::SetPair { key, value } => bincode::serialize(&SetPairPayload {
                key: key.clone(),
                value: value.clone(),
            }),
            Command::DeletePair { key } => {
                bincode::serialize(&DeletePairPayload { key: key.clone() })
            }
        }
        // Serializing owned strings into a Vec cannot fail.
        .unwrap_or_default();

        let mut frame = Vec::with_capacity(1 + 4 + payload.len());
        frame.push(self.kind());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    /// Decode a wire frame. The inverse of [`Command::encode`].
    pub fn decode(frame: &[u8]) -> Result<Command, CodecError> {
        if frame.is_empty() {
            return Err(CodecError::Empty);
        }
        let kind = frame[0];
        if frame.len() < 5 {
            return Err(CodecError::Truncated {
                expected: 4,
                got: frame.len() - 1,
            });
        }
        let len = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]) as usize;
        let payload = &frame[5..];
        if payload.len() < len {
            return Err(CodecError::Truncated {
                expected: len,
                got: payload.len(),
            });
        }
        let payload = &payload[..len];

        match kind {
            KIND_SET_PAIR => {
                let p: SetPairPayload = bincode::deserialize(payload)
                    .map_err(|e| CodecError::Payload(e.to_string()))?;
                Ok(Command::SetPair {
                    key: p.key,
                    value: p.value,
                })
            }
            KIND_DELETE_PAIR => {
                let p: DeletePairPayload = bincode::deserialize(payload)
                    .map_err(|e| CodecError::Payload(e.to_string()))?;
                Ok(Command::DeletePair { key: p.key })
            }
            other => Err(CodecError::UnknownKind(other)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_pair_roundtrip() {
        let cmd = Command::SetPair {
            key: "x".to_string(),
            value: "1".to_string(),
        };
        let frame = cmd.encode();
        assert_eq!(frame[0], KIND_SET_PAIR);
        assert_eq!(Command::decode(&frame).unwrap(), cmd);
    }

    #[test]
    fn delete_pair_roundtrip() {
        let cmd = Command::DeletePair {
            key: "gone".to_string(),
        };
        let frame = cmd.encode();
        assert_eq!(frame[0], KIND_DELETE_PAIR);
        assert_eq!(Command::decode(&frame).unwrap(), cmd);
    }

    #[test]
    fn roundtrip_preserves_arbitrary_bytes_in_strings() {
        let cmd = Command::SetPair {
            key: "k\u{00e9}y \u{2603}".to_string(),
            value: "\u{0000}binary-ish\n\r".to_string(),
        };
        assert_eq!(Command::decode(&cmd.encode()).unwrap(), cmd);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let mut frame = Command::SetPair {
            key: "k".to_string(),
            value: "v".to_string(),
        }
        .encode();
        frame[0] = 0xFF;
        assert_eq!(Command::decode(&frame), Err(CodecError::UnknownKind(0xFF)));
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert_eq!(Command::decode(&[]), Err(CodecError::Empty));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let frame = Command::SetPair {
            key: "key".to_string(),
            value: "value".to_string(),
        }
        .encode();

        // Header cut short.
        assert!(matches!(
            Command::decode(&frame[..3]),
            Err(CodecError::Truncated { .. })
        ));
        // Payload cut short.
        assert!(matches!(
            Command::decode(&frame[..frame.len() - 2]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn garbage_payload_is_rejected() {
        let mut frame = vec![KIND_SET_PAIR];
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(
            Command::decode(&frame),
            Err(CodecError::Payload(_)) | Err(CodecError::Truncated { .. })
        ));
    }
}
