//! The application-facing session assembled after a successful upgrade.
use std::{cell::Cell, cell::RefCell, fmt, rc::Rc};

use ntex_bytes::{Bytes, ByteString, BytesMut};
use ntex_util::future::Either;

use crate::codec::{Codec, WireFrame};
use crate::error::{ProtocolError, UpgradeError, WsError};
use crate::handshake::{UpgradeRequest, UpgradeResponse};
use crate::io::{Connection, Transport};
use crate::proto::{CloseReason, OpCode};
use crate::stack::ExtensionStack;

/// The application object that receives connection events.
///
/// Upgrade failures are delivered here before the pending result observes
/// them, so the application can react even if it never inspects the
/// returned handle.
pub trait LocalEndpoint {
    /// Error event for a failed upgrade.
    fn on_upgrade_error(&self, err: &UpgradeError);
}

impl LocalEndpoint for () {
    fn on_upgrade_error(&self, _: &UpgradeError) {}
}

/// Complete message received from the peer. Fragmented messages are
/// reassembled before delivery; the codec does not verify utf8 encoding
/// of text frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

/// Message to send to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(ByteString),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

/// An upgraded WebSocket connection.
///
/// Owns the transport, the frame codec and the negotiated extension
/// stack. Incoming data frames pass transport -> stack -> application;
/// outgoing data frames pass application -> stack -> transport. Control
/// frames bypass the stack in both directions.
pub struct Session<T> {
    conn: Connection<T>,
    codec: Codec,
    stack: RefCell<ExtensionStack>,
    request: Rc<UpgradeRequest>,
    response: UpgradeResponse,
    fragment: RefCell<Option<(OpCode, BytesMut)>>,
    max_size: usize,
    _guard: SessionGuard,
}

impl<T: Transport> Session<T> {
    pub(crate) fn new(
        conn: Connection<T>,
        codec: Codec,
        stack: ExtensionStack,
        request: Rc<UpgradeRequest>,
        response: UpgradeResponse,
        max_size: usize,
        guard: SessionGuard,
    ) -> Session<T> {
        Session {
            conn,
            codec,
            request,
            response,
            max_size,
            stack: RefCell::new(stack),
            fragment: RefCell::new(None),
            _guard: guard,
        }
    }

    /// The request this session was negotiated from.
    pub fn request(&self) -> &UpgradeRequest {
        &self.request
    }

    /// The server's handshake response.
    pub fn response(&self) -> &UpgradeResponse {
        &self.response
    }

    /// The sub-protocol the server selected, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.response.protocol()
    }

    /// Negotiated extension names, transport-adjacent first.
    pub fn extensions(&self) -> Vec<String> {
        self.stack
            .borrow()
            .names()
            .iter()
            .map(|name| name.to_string())
            .collect()
    }

    /// Receive the next message. `Ok(None)` means the peer closed the
    /// transport cleanly.
    pub async fn recv(&self) -> Result<Option<Frame>, WsError> {
        loop {
            let frame = match self.conn.recv(&self.codec).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(Either::Left(err)) => return Err(WsError::Protocol(err)),
                Err(Either::Right(err)) => return Err(WsError::Disconnected(Some(err))),
            };

            let frame = if frame.opcode.is_control() {
                frame
            } else {
                self.stack.borrow_mut().incoming(frame)?
            };

            match frame.opcode {
                OpCode::Ping => return Ok(Some(Frame::Ping(frame.payload))),
                OpCode::Pong => return Ok(Some(Frame::Pong(frame.payload))),
                OpCode::Close => {
                    return Ok(Some(Frame::Close(CloseReason::parse(&frame.payload))))
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.borrow().is_some() {
                        return Err(ProtocolError::ContinuationStarted.into());
                    }
                    if frame.fin {
                        return Ok(Some(data_frame(frame.opcode, frame.payload)));
                    }
                    let mut buf = BytesMut::with_capacity(frame.payload.len());
                    buf.extend_from_slice(&frame.payload);
                    *self.fragment.borrow_mut() = Some((frame.opcode, buf));
                }
                OpCode::Continue => {
                    let fragment = self.fragment.borrow_mut().take();
                    let Some((opcode, mut buf)) = fragment else {
                        return Err(ProtocolError::ContinuationNotStarted.into());
                    };
                    if buf.len() + frame.payload.len() > self.max_size {
                        return Err(ProtocolError::Overflow.into());
                    }
                    buf.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return Ok(Some(data_frame(opcode, buf.freeze())));
                    }
                    *self.fragment.borrow_mut() = Some((opcode, buf));
                }
            }
        }
    }

    /// Encode and send a message to the peer.
    pub async fn send(&self, msg: Message) -> Result<(), WsError> {
        let frame = match msg {
            Message::Text(text) => WireFrame::new(OpCode::Text, text.into_bytes()),
            Message::Binary(bin) => WireFrame::new(OpCode::Binary, bin),
            Message::Ping(data) => WireFrame::new(OpCode::Ping, data),
            Message::Pong(data) => WireFrame::new(OpCode::Pong, data),
            Message::Close(reason) => {
                WireFrame::new(OpCode::Close, CloseReason::encode(reason.as_ref()))
            }
        };

        let frame = if frame.opcode.is_control() {
            frame
        } else {
            self.stack.borrow_mut().outgoing(frame)?
        };

        match self.conn.send(frame, &self.codec).await {
            Ok(()) => Ok(()),
            Err(Either::Left(err)) => Err(WsError::Protocol(err)),
            Err(Either::Right(err)) => Err(WsError::Disconnected(Some(err))),
        }
    }

    /// Send a close frame, if one was not sent yet, and close the
    /// transport.
    pub async fn close(&self, reason: Option<CloseReason>) -> Result<(), WsError> {
        if !self.codec.is_closed() {
            self.send(Message::Close(reason)).await?;
        }
        self.conn.close();
        Ok(())
    }

    /// Access the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.conn.get_ref()
    }
}

fn data_frame(opcode: OpCode, payload: Bytes) -> Frame {
    match opcode {
        OpCode::Text => Frame::Text(payload),
        _ => Frame::Binary(payload),
    }
}

impl<T> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("stack", &self.stack.borrow())
            .finish()
    }
}

/// Marks the session as a managed child of its owning client; releases
/// the registration when the session goes away.
pub(crate) struct SessionGuard {
    sessions: Rc<Cell<usize>>,
}

impl SessionGuard {
    pub(crate) fn register(sessions: Rc<Cell<usize>>) -> SessionGuard {
        sessions.set(sessions.get() + 1);
        SessionGuard { sessions }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.set(self.sessions.get().saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use ntex_http::{HeaderMap, Uri};

    use super::*;
    use crate::frame::Parser;
    use crate::testing::{self, TestIo};

    fn session(io: TestIo) -> Session<TestIo> {
        let request = Rc::new(UpgradeRequest::new(
            Uri::try_from("ws://localhost/").unwrap(),
            Vec::new(),
            Vec::new(),
            HeaderMap::new(),
            Rc::new(()),
        ));
        let head = {
            let mut buf = BytesMut::new();
            buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n\r\n");
            use ntex_codec::Decoder;
            crate::handshake::HandshakeCodec
                .decode(&mut buf)
                .unwrap()
                .unwrap()
        };
        Session::new(
            Connection::new(io),
            Codec::new().client_mode(),
            ExtensionStack::empty(),
            request,
            UpgradeResponse::new(head, Vec::new(), None),
            65_536,
            SessionGuard::register(Rc::new(Cell::new(0))),
        )
    }

    #[ntex::test]
    async fn reassembles_fragments() {
        let (client, server) = testing::pair();
        let session = session(client);

        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Text, 0, false, b"hel", false);
        Parser::write(&mut buf, OpCode::Continue, 0, false, b"lo ", false);
        Parser::write(&mut buf, OpCode::Continue, 0, true, b"there", false);
        server.write(&buf[..]);

        let frame = session.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Text(Bytes::from_static(b"hello there")));
    }

    #[ntex::test]
    async fn control_frames_interleave_with_fragments() {
        let (client, server) = testing::pair();
        let session = session(client);

        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Binary, 0, false, b"ab", false);
        Parser::write(&mut buf, OpCode::Ping, 0, true, b"hb", false);
        Parser::write(&mut buf, OpCode::Continue, 0, true, b"cd", false);
        server.write(&buf[..]);

        assert_eq!(
            session.recv().await.unwrap().unwrap(),
            Frame::Ping(Bytes::from_static(b"hb"))
        );
        assert_eq!(
            session.recv().await.unwrap().unwrap(),
            Frame::Binary(Bytes::from_static(b"abcd"))
        );
    }

    #[ntex::test]
    async fn continuation_without_start_is_rejected() {
        let (client, server) = testing::pair();
        let session = session(client);

        let mut buf = BytesMut::new();
        Parser::write(&mut buf, OpCode::Continue, 0, true, b"oops", false);
        server.write(&buf[..]);

        assert!(matches!(
            session.recv().await,
            Err(WsError::Protocol(ProtocolError::ContinuationNotStarted))
        ));
    }

    #[ntex::test]
    async fn send_masks_frames() {
        let (client, server) = testing::pair();
        let session = session(client);

        session
            .send(Message::Text(ByteString::from("hi")))
            .await
            .unwrap();

        let mut written = server.read_any();
        let frame = Parser::parse(&mut written, true, 65_536).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[ntex::test]
    async fn close_sends_close_frame_once() {
        let (client, server) = testing::pair();
        let session = session(client);

        session
            .close(Some(crate::proto::CloseCode::Normal.into()))
            .await
            .unwrap();
        session.close(None).await.unwrap();

        let mut written = server.read_any();
        let frame = Parser::parse(&mut written, true, 65_536).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Close);
        assert!(written.is_empty());
    }
}
