//! WebSocket client upgrade protocol.
//!
//! Turns an established HTTP/1.1 client connection into a framed,
//! bidirectional WebSocket connection: build the RFC 6455 opening
//! handshake, validate the server's accept, negotiate extensions against a
//! registry and assemble the frame pipeline that takes over the transport.
//!
//! To connect, build a [`WsClient`], then call
//! [`connect()`](WsClient::connect) with an established [`Transport`];
//! on success the resulting [`Session`] sends and receives complete
//! messages through the negotiated extension stack.
#![allow(async_fn_in_trait)]

mod client;
mod codec;
mod extension;
mod frame;
mod handshake;
mod io;
mod proto;
mod session;
mod stack;

pub mod error;
pub mod pending;
pub mod testing;

pub use self::client::{WsClient, WsClientBuilder};
pub use self::codec::{Codec, WireFrame};
pub use self::error::{ProtocolError, RequestError, UpgradeError, WsError};
pub use self::extension::{
    ConfigError, Extension, ExtensionConfig, ExtensionFactory, ExtensionRegistry,
    IdentityFactory,
};
pub use self::handshake::{UpgradeRequest, UpgradeResponse};
pub use self::io::{Connection, Transport};
pub use self::pending::{Completion, PendingUpgrade};
pub use self::proto::{hash_key, CloseCode, CloseReason, OpCode};
pub use self::session::{Frame, LocalEndpoint, Message, Session};
pub use self::stack::ExtensionStack;
