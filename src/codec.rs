//! Frame codec shared by the session and the extension stack.
use std::cell::Cell;

use ntex_bytes::{Bytes, BytesMut};
use ntex_codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::frame::Parser;
use crate::proto::OpCode;

/// A single decoded frame as it travels through the extension stack.
///
/// Extensions may rewrite the payload and flip reserved bits in both
/// directions; the codec only enforces that incoming reserved bits were
/// claimed by a negotiated extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame {
    /// Final fragment of a message
    pub fin: bool,
    /// RSV1-RSV3 bits, transported as the low three bits
    pub rsv: u8,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl WireFrame {
    /// Create an unfragmented frame without reserved bits.
    pub fn new(opcode: OpCode, payload: Bytes) -> WireFrame {
        WireFrame {
            fin: true,
            rsv: 0,
            opcode,
            payload,
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    struct Flags: u8 {
        const SERVER = 0b0000_0001;
        const CLOSED = 0b0000_0010;
    }
}

/// `WebSockets` protocol codec
#[derive(Debug)]
pub struct Codec {
    flags: Cell<Flags>,
    rsv_bits: Cell<u8>,
    max_size: usize,
}

impl Codec {
    /// Create new websocket frames decoder
    pub fn new() -> Codec {
        Codec {
            max_size: 65_536,
            rsv_bits: Cell::new(0),
            flags: Cell::new(Flags::SERVER),
        }
    }

    /// Set max frame size
    ///
    /// By default max size is set to 64kb
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set decoder to client mode.
    ///
    /// By default decoder works in server mode.
    pub fn client_mode(self) -> Self {
        self.remove_flags(Flags::SERVER);
        self
    }

    /// Permit the given RSV bits on incoming data frames.
    ///
    /// Called by negotiated extensions while the stack is being configured;
    /// unclaimed bits on a decoded frame are a protocol error.
    pub fn allow_rsv(&self, bits: u8) {
        self.rsv_bits.set(self.rsv_bits.get() | (bits & 0x07));
    }

    /// Check if codec encoded `Close` frame
    pub fn is_closed(&self) -> bool {
        self.flags.get().contains(Flags::CLOSED)
    }

    fn insert_flags(&self, f: Flags) {
        let mut flags = self.flags.get();
        flags.insert(f);
        self.flags.set(flags);
    }

    fn remove_flags(&self, f: Flags) {
        let mut flags = self.flags.get();
        flags.remove(f);
        self.flags.set(flags);
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for Codec {
    type Item = WireFrame;
    type Error = ProtocolError;

    fn encode(&self, item: WireFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.opcode == OpCode::Close {
            self.insert_flags(Flags::CLOSED);
        }
        Parser::write(
            dst,
            item.opcode,
            item.rsv,
            item.fin,
            &item.payload,
            !self.flags.get().contains(Flags::SERVER),
        );
        Ok(())
    }
}

impl Decoder for Codec {
    type Item = WireFrame;
    type Error = ProtocolError;

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let server = self.flags.get().contains(Flags::SERVER);
        match Parser::parse(src, server, self.max_size)? {
            Some(frame) => {
                if frame.rsv & !self.rsv_bits.get() != 0
                    || (frame.opcode.is_control() && frame.rsv != 0)
                {
                    return Err(ProtocolError::UnexpectedRsv(frame.rsv));
                }
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}
