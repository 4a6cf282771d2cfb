//! Byte transport abstraction and the framed connection built on it.
use std::{cell::RefCell, fmt, io};

use ntex_bytes::BytesMut;
use ntex_codec::{Decoder, Encoder};
use ntex_util::future::Either;

/// An established, bidirectional byte transport.
///
/// The connection establishment, event loop, and TLS all live behind this
/// trait; the upgrade machinery only needs to move bytes and to close.
pub trait Transport: 'static {
    /// Read available bytes into `buf`. `Ok(0)` means the peer closed.
    async fn read(&self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Write all of `src` to the peer.
    async fn write(&self, src: &[u8]) -> io::Result<()>;

    /// Close both directions.
    fn close(&self);
}

/// Framed view over a transport.
///
/// `recv`/`send` work with any codec, and the read buffer belongs to the
/// connection rather than to a codec. That makes the protocol hand-off
/// after a successful upgrade a plain codec swap: bytes that arrived
/// behind the handshake response stay buffered here and are decoded by
/// whichever codec is used next.
pub struct Connection<T> {
    io: T,
    buf: RefCell<BytesMut>,
}

impl<T: Transport> Connection<T> {
    pub fn new(io: T) -> Connection<T> {
        Connection {
            io,
            buf: RefCell::new(BytesMut::with_capacity(4096)),
        }
    }

    /// Read the io stream and decode one codec item.
    ///
    /// `Ok(None)` means the peer closed cleanly between items.
    pub async fn recv<U>(
        &self,
        codec: &U,
    ) -> Result<Option<U::Item>, Either<U::Error, io::Error>>
    where
        U: Decoder,
    {
        loop {
            if let Some(item) = codec
                .decode(&mut self.buf.borrow_mut())
                .map_err(Either::Left)?
            {
                return Ok(Some(item));
            }

            let mut buf = self.buf.take();
            let result = self.io.read(&mut buf).await;
            self.buf.replace(buf);

            match result {
                Ok(0) => {
                    return if self.buf.borrow().is_empty() {
                        Ok(None)
                    } else {
                        Err(Either::Right(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "transport closed inside a frame",
                        )))
                    };
                }
                Ok(_) => continue,
                Err(err) => return Err(Either::Right(err)),
            }
        }
    }

    /// Encode an item and write it to the peer.
    pub async fn send<U>(
        &self,
        item: U::Item,
        codec: &U,
    ) -> Result<(), Either<U::Error, io::Error>>
    where
        U: Encoder,
    {
        let mut dst = BytesMut::new();
        codec.encode(item, &mut dst).map_err(Either::Left)?;
        self.io.write(&dst).await.map_err(Either::Right)
    }

    /// Close the underlying transport.
    pub fn close(&self) {
        self.io.close();
    }

    /// Access the underlying transport.
    pub fn get_ref(&self) -> &T {
        &self.io
    }
}

impl<T> fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("buffered", &self.buf.borrow().len())
            .finish()
    }
}
