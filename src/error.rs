//! Upgrade and protocol errors.
use std::io;

use ntex_http::{error::Error as HttpError, header::HeaderValue, StatusCode};
use thiserror::Error;

/// Errors produced while performing the client upgrade handshake.
///
/// Every connect attempt terminates with at most one of these; nothing is
/// retried internally.
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// The upgrade request itself is malformed, caller error
    #[error("invalid upgrade request: {0}")]
    InvalidArgument(#[from] RequestError),
    /// The transport could not establish or complete the exchange
    #[error("connection failure: {0:?}")]
    ConnectionFailure(Option<io::Error>),
    /// Server declined the upgrade with a non-101 response
    #[error("upgrade rejected by server: {status}")]
    UpgradeRejected {
        status: StatusCode,
        reason: Option<String>,
    },
    /// Response status was 101 but the `Upgrade` header is not "websocket"
    #[error("upgrade response is not a websocket accept")]
    ProtocolMismatch,
    /// `Sec-WebSocket-Accept` header absent or not matching the sent key
    #[error("invalid challenge response: expected {expected}, received {received:?}")]
    AcceptHashMismatch {
        expected: String,
        received: Option<HeaderValue>,
    },
    /// Server negotiated an extension the client cannot honor
    #[error("unsupported extension negotiated by server: {name:?}")]
    UnsupportedExtension { name: String },
    /// Session pipeline could not be wired after a valid handshake
    #[error("failed to assemble session pipeline: {0}")]
    AssemblyFailure(String),
}

/// Reasons an upgrade request is rejected before anything is sent.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("missing url scheme")]
    MissingScheme,
    #[error("url scheme must be \"ws\" or \"wss\"")]
    UnknownScheme,
    #[error("missing host name")]
    MissingHost,
    #[error("url parse error: {0}")]
    Http(#[from] HttpError),
}

/// Websocket protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Received an unmasked frame from client
    #[error("received an unmasked frame from client")]
    UnmaskedFrame,
    /// Received a masked frame from server
    #[error("received a masked frame from server")]
    MaskedFrame,
    /// Encountered invalid opcode
    #[error("invalid opcode: {0}")]
    InvalidOpcode(u8),
    /// Invalid control frame length
    #[error("invalid control frame length: {0}")]
    InvalidLength(usize),
    /// Control frames must not be fragmented
    #[error("fragmented control frame")]
    FragmentedControl,
    /// A payload reached size limit
    #[error("payload reached size limit")]
    Overflow,
    /// Frame carries reserved bits no negotiated extension claimed
    #[error("unexpected reserved bits: {0:#05b}")]
    UnexpectedRsv(u8),
    /// Continuation is not started
    #[error("continuation is not started")]
    ContinuationNotStarted,
    /// Received new continuation but it is already started
    #[error("received new continuation but it is already started")]
    ContinuationStarted,
}

/// Errors surfaced by an upgraded session.
#[derive(Debug, Error)]
pub enum WsError {
    /// Ws protocol level error
    #[error("{0}")]
    Protocol(#[from] ProtocolError),
    /// Peer has been disconnected
    #[error("peer has been disconnected: {0:?}")]
    Disconnected(Option<io::Error>),
}
