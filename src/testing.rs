//! In-memory transport for tests.
use std::{cell::Cell, cell::RefCell, future::poll_fn, io, rc::Rc, task::Poll};

use ntex_bytes::BytesMut;
use ntex_util::task::LocalWaker;

use crate::io::Transport;

#[derive(Debug, Default)]
struct Pipe {
    buf: RefCell<BytesMut>,
    waker: LocalWaker,
    closed: Cell<bool>,
}

impl Pipe {
    fn push(&self, data: &[u8]) {
        self.buf.borrow_mut().extend_from_slice(data);
        self.waker.wake();
    }

    fn drain(&self) -> BytesMut {
        let mut buf = self.buf.borrow_mut();
        let len = buf.len();
        buf.split_to(len)
    }
}

/// One side of an in-memory duplex transport.
///
/// Bytes written by one side become readable on the other. The test side
/// of a connection can script traffic with the synchronous helpers while
/// the side under test is driven through the [`Transport`] trait.
#[derive(Debug)]
pub struct TestIo {
    rx: Rc<Pipe>,
    tx: Rc<Pipe>,
}

/// Create a connected transport pair.
pub fn pair() -> (TestIo, TestIo) {
    let a = Rc::new(Pipe::default());
    let b = Rc::new(Pipe::default());
    (
        TestIo {
            rx: a.clone(),
            tx: b.clone(),
        },
        TestIo { rx: b, tx: a },
    )
}

impl TestIo {
    /// Queue bytes for the peer to read.
    pub fn write<T: AsRef<[u8]>>(&self, data: T) {
        self.tx.push(data.as_ref());
    }

    /// Drain everything the peer has written so far.
    pub fn read_any(&self) -> BytesMut {
        self.rx.drain()
    }

    /// Wait until the peer writes something, then drain it.
    pub async fn recv(&self) -> BytesMut {
        poll_fn(|cx| {
            if self.rx.buf.borrow().is_empty() && !self.rx.closed.get() {
                self.rx.waker.register(cx.waker());
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        })
        .await;
        self.rx.drain()
    }

    /// Check whether either side closed the connection.
    pub fn is_closed(&self) -> bool {
        self.rx.closed.get() || self.tx.closed.get()
    }
}

impl Transport for TestIo {
    async fn read(&self, buf: &mut BytesMut) -> io::Result<usize> {
        poll_fn(|cx| {
            let mut src = self.rx.buf.borrow_mut();
            if !src.is_empty() {
                let len = src.len();
                buf.extend_from_slice(&src.split_to(len));
                Poll::Ready(Ok(len))
            } else if self.rx.closed.get() {
                Poll::Ready(Ok(0))
            } else {
                self.rx.waker.register(cx.waker());
                Poll::Pending
            }
        })
        .await
    }

    async fn write(&self, src: &[u8]) -> io::Result<()> {
        if self.tx.closed.get() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer is closed"));
        }
        self.tx.push(src);
        Ok(())
    }

    fn close(&self) {
        self.rx.closed.set(true);
        self.tx.closed.set(true);
        self.rx.waker.wake();
        self.tx.waker.wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[ntex::test]
    async fn duplex() {
        let (client, server) = pair();

        client.write(b"to server");
        assert_eq!(&server.recv().await[..], b"to server");

        server.write(b"to client");
        let mut buf = BytesMut::new();
        let n = Transport::read(&client, &mut buf).await.unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf[..], b"to client");
    }

    #[ntex::test]
    async fn close_is_observed_as_eof() {
        let (client, server) = pair();
        Transport::close(&server);
        assert!(client.is_closed());

        let mut buf = BytesMut::new();
        assert_eq!(Transport::read(&client, &mut buf).await.unwrap(), 0);
        assert!(Transport::write(&client, b"x").await.is_err());
    }
}
