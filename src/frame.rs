//! Wire-level frame parsing and generation.
use nanorand::{Rng, WyRand};
use ntex_bytes::BytesMut;

use crate::codec::WireFrame;
use crate::error::ProtocolError;
use crate::proto::OpCode;

/// Control frame payloads are limited to 125 bytes (RFC 6455 section 5.5).
const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket frame parser/generator.
#[derive(Debug)]
pub struct Parser;

impl Parser {
    /// Parse one frame out of `src`.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered; consumes the
    /// frame's bytes from `src` only once it is complete. `server` selects
    /// the masking direction to enforce.
    pub(crate) fn parse(
        src: &mut BytesMut,
        server: bool,
        max_size: usize,
    ) -> Result<Option<WireFrame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }

        let b0 = src[0];
        let b1 = src[1];

        let fin = b0 & 0x80 != 0;
        let rsv = (b0 >> 4) & 0x07;
        let opcode = OpCode::from_u8(b0 & 0x0F)
            .ok_or(ProtocolError::InvalidOpcode(b0 & 0x0F))?;

        let masked = b1 & 0x80 != 0;
        if masked != server {
            return Err(if server {
                ProtocolError::UnmaskedFrame
            } else {
                ProtocolError::MaskedFrame
            });
        }

        let (length, mut header_len) = match b1 & 0x7F {
            126 => {
                if src.len() < 4 {
                    return Ok(None);
                }
                (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
            }
            127 => {
                if src.len() < 10 {
                    return Ok(None);
                }
                let mut len = [0; 8];
                len.copy_from_slice(&src[2..10]);
                (u64::from_be_bytes(len), 10)
            }
            len => (u64::from(len), 2),
        };

        if opcode.is_control() {
            if length > MAX_CONTROL_PAYLOAD as u64 {
                return Err(ProtocolError::InvalidLength(length as usize));
            }
            if !fin {
                return Err(ProtocolError::FragmentedControl);
            }
        }
        if length > max_size as u64 {
            return Err(ProtocolError::Overflow);
        }
        let length = length as usize;

        let mask = if masked {
            if src.len() < header_len + 4 {
                return Ok(None);
            }
            let mut mask = [0; 4];
            mask.copy_from_slice(&src[header_len..header_len + 4]);
            header_len += 4;
            Some(mask)
        } else {
            None
        };

        if src.len() < header_len + length {
            src.reserve(header_len + length - src.len());
            return Ok(None);
        }

        let _ = src.split_to(header_len);
        let mut payload = src.split_to(length);
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(WireFrame {
            fin,
            rsv,
            opcode,
            payload: payload.freeze(),
        }))
    }

    /// Write a frame into `dst`, masking the payload when `mask` is set
    /// (client to server direction).
    pub(crate) fn write(
        dst: &mut BytesMut,
        opcode: OpCode,
        rsv: u8,
        fin: bool,
        payload: &[u8],
        mask: bool,
    ) {
        let b0 = (u8::from(fin) << 7) | (rsv << 4) | opcode.as_u8();
        let masked = u8::from(mask) << 7;

        dst.reserve(payload.len() + 14);
        dst.extend_from_slice(&[b0]);
        match payload.len() {
            len if len < 126 => dst.extend_from_slice(&[masked | len as u8]),
            len if len <= u16::MAX as usize => {
                dst.extend_from_slice(&[masked | 126]);
                dst.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                dst.extend_from_slice(&[masked | 127]);
                dst.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        if mask {
            let mut key = [0; 4];
            WyRand::new().fill(&mut key);
            dst.extend_from_slice(&key);

            let start = dst.len();
            dst.extend_from_slice(payload);
            apply_mask(&mut dst[start..], key);
        } else {
            dst.extend_from_slice(payload);
        }
    }
}

fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &mut BytesMut, server: bool) -> Result<Option<WireFrame>, ProtocolError> {
        Parser::parse(src, server, 65_536)
    }

    #[test]
    fn masked_roundtrip() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0, true, b"hello", true);
        // client frames carry the mask bit and a 4 byte key
        assert_eq!(buf[1] & 0x80, 0x80);
        assert_eq!(buf.len(), 2 + 4 + 5);

        let frame = parse(&mut buf, true).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn unmasked_roundtrip() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Text, 0, true, b"data", false);
        assert_eq!(&buf[..], &[0x81, 0x04, b'd', b'a', b't', b'a']);

        let frame = parse(&mut buf, false).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"data");
    }

    #[test]
    fn partial_input() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0, true, &[0x55; 300], false);

        let mut partial = BytesMut::new();
        partial.extend_from_slice(&buf[..1]);
        assert!(parse(&mut partial, false).unwrap().is_none());
        partial.extend_from_slice(&buf[1..3]);
        assert!(parse(&mut partial, false).unwrap().is_none());
        partial.extend_from_slice(&buf[3..]);
        let frame = parse(&mut partial, false).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn wrong_mask_direction() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0, true, b"x", true);
        assert!(matches!(
            parse(&mut buf, false),
            Err(ProtocolError::MaskedFrame)
        ));

        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0, true, b"x", false);
        assert!(matches!(
            parse(&mut buf, true),
            Err(ProtocolError::UnmaskedFrame)
        ));
    }

    #[test]
    fn control_frame_limits() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Ping, 0, true, &[0; 126], false);
        assert!(matches!(
            parse(&mut buf, false),
            Err(ProtocolError::InvalidLength(126))
        ));

        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Ping, 0, false, b"", false);
        assert!(matches!(
            parse(&mut buf, false),
            Err(ProtocolError::FragmentedControl)
        ));
    }

    #[test]
    fn max_size_enforced() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0, true, &[0; 64], false);
        assert!(matches!(
            Parser::parse(&mut buf, false, 63),
            Err(ProtocolError::Overflow)
        ));
    }

    #[test]
    fn rsv_bits_carried() {
        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0b100, true, b"z", false);
        let frame = parse(&mut buf, false).unwrap().unwrap();
        assert_eq!(frame.rsv, 0b100);
    }
}
