//! WebSocket protocol primitives.
use base64::{engine::general_purpose::STANDARD as base64, Engine};
use ntex_bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};

// Handshake GUID from RFC 6455 section 1.3, appended to the client key
// before hashing.
const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Hash a `Sec-WebSocket-Key` value into the `Sec-WebSocket-Accept` value
/// the server is expected to return.
pub fn hash_key(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_GUID);
    base64.encode(hasher.finalize())
}

/// Operation codes defined in RFC 6455 section 5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continue,
    /// Text frame
    Text,
    /// Binary frame
    Binary,
    /// Connection close
    Close,
    /// Ping
    Ping,
    /// Pong
    Pong,
}

impl OpCode {
    pub(crate) fn from_u8(code: u8) -> Option<OpCode> {
        match code {
            0x0 => Some(OpCode::Continue),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    /// Control frames interleave with fragmented messages and never carry
    /// extension transformations.
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Status codes used in `Close` frames, RFC 6455 section 7.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// Normal closure
    Normal,
    /// Endpoint is going away
    Away,
    /// Protocol error
    Protocol,
    /// Received data it cannot accept
    Unsupported,
    /// Abnormal closure, no close frame received
    Abnormal,
    /// Received data inconsistent with the message type
    Invalid,
    /// Message violates endpoint policy
    Policy,
    /// Message too big to process
    Size,
    /// Client expected an extension the server did not negotiate
    Extension,
    /// Unexpected condition on the server
    Error,
    /// Any other registered code
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1006 => CloseCode::Abnormal,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1010 => CloseCode::Extension,
            1011 => CloseCode::Error,
            code => CloseCode::Other(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

/// Reason for closing the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: CloseCode,
    pub description: Option<String>,
}

impl From<CloseCode> for CloseReason {
    fn from(code: CloseCode) -> Self {
        CloseReason {
            code,
            description: None,
        }
    }
}

impl CloseReason {
    pub(crate) fn encode(reason: Option<&CloseReason>) -> Bytes {
        match reason {
            None => Bytes::new(),
            Some(reason) => {
                let code: u16 = reason.code.into();
                let mut payload = BytesMut::with_capacity(
                    2 + reason.description.as_ref().map(String::len).unwrap_or(0),
                );
                payload.extend_from_slice(&code.to_be_bytes());
                if let Some(description) = &reason.description {
                    payload.extend_from_slice(description.as_bytes());
                }
                payload.freeze()
            }
        }
    }

    pub(crate) fn parse(payload: &[u8]) -> Option<CloseReason> {
        if payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([payload[0], payload[1]]).into();
        let description = if payload.len() > 2 {
            Some(String::from_utf8_lossy(&payload[2..]).into_owned())
        } else {
            None
        };
        Some(CloseReason { code, description })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_rfc_vector() {
        // RFC 6455 section 1.3 sample handshake
        let accept = hash_key(b"dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn opcodes() {
        for code in [0x0, 0x1, 0x2, 0x8, 0x9, 0xA] {
            assert_eq!(OpCode::from_u8(code).unwrap().as_u8(), code);
        }
        assert!(OpCode::from_u8(0x3).is_none());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn close_reason_roundtrip() {
        let reason = CloseReason {
            code: CloseCode::Policy,
            description: Some("go away".to_string()),
        };
        let payload = CloseReason::encode(Some(&reason));
        assert_eq!(CloseReason::parse(&payload), Some(reason));

        assert!(CloseReason::encode(None).is_empty());
        assert_eq!(CloseReason::parse(b""), None);
        assert_eq!(
            CloseReason::parse(&[0x03, 0xe8]),
            Some(CloseReason::from(CloseCode::Normal))
        );
    }
}
