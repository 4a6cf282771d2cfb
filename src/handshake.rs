//! Opening handshake: request construction, wire codec and response
//! validation.
use std::{fmt, io, rc::Rc};

use base64::{engine::general_purpose::STANDARD as base64, Engine};
use nanorand::{Rng, WyRand};
use ntex_bytes::BytesMut;
use ntex_codec::{Decoder, Encoder};
use ntex_http::header::{self, HeaderName, HeaderValue};
use ntex_http::{HeaderMap, StatusCode, Uri};

use crate::error::UpgradeError;
use crate::extension::ExtensionConfig;
use crate::proto;
use crate::session::LocalEndpoint;

const MAX_HEADERS: usize = 96;
const MAX_BUFFER_SIZE: usize = 32_768;

/// A finalized upgrade request.
///
/// Built once per connect attempt and never mutated afterwards; the
/// generated key is retained for validating the server's accept hash.
pub struct UpgradeRequest {
    uri: Uri,
    key: String,
    extensions: Vec<ExtensionConfig>,
    protocols: Vec<String>,
    headers: HeaderMap,
    endpoint: Rc<dyn LocalEndpoint>,
}

impl UpgradeRequest {
    pub(crate) fn new(
        uri: Uri,
        extensions: Vec<ExtensionConfig>,
        protocols: Vec<String>,
        headers: HeaderMap,
        endpoint: Rc<dyn LocalEndpoint>,
    ) -> UpgradeRequest {
        UpgradeRequest {
            uri,
            key: gen_key(),
            extensions,
            protocols,
            headers,
            endpoint,
        }
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The `Sec-WebSocket-Key` value sent with this request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extensions offered to the server, in preference order.
    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }

    /// Sub-protocols offered to the server, in preference order.
    pub fn protocols(&self) -> &[String] {
        &self.protocols
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn endpoint(&self) -> &Rc<dyn LocalEndpoint> {
        &self.endpoint
    }
}

impl fmt::Debug for UpgradeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeRequest")
            .field("uri", &self.uri)
            .field("extensions", &self.extensions)
            .field("protocols", &self.protocols)
            .finish()
    }
}

// Generate a random key for the `Sec-WebSocket-Key` header.
// a base64-encoded (see Section 4 of [RFC4648]) value that,
// when decoded, is 16 bytes in length (RFC 6455)
fn gen_key() -> String {
    let mut sec_key: [u8; 16] = [0; 16];
    WyRand::new().fill(&mut sec_key);
    base64.encode(sec_key)
}

/// Status line and headers of the server's handshake response.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
}

/// The server's answer to an upgrade request, after negotiation.
#[derive(Debug)]
pub struct UpgradeResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
    extensions: Vec<ExtensionConfig>,
    protocol: Option<String>,
}

impl UpgradeResponse {
    pub(crate) fn new(
        head: ResponseHead,
        extensions: Vec<ExtensionConfig>,
        protocol: Option<String>,
    ) -> UpgradeResponse {
        UpgradeResponse {
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            extensions,
            protocol,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Extensions the server accepted, in stack order.
    pub fn extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }

    /// The sub-protocol the server selected, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}

/// HTTP/1.1 codec for the one-shot handshake exchange.
#[derive(Debug, Default)]
pub(crate) struct HandshakeCodec;

impl Encoder for HandshakeCodec {
    type Item = Rc<UpgradeRequest>;
    type Error = io::Error;

    fn encode(&self, req: Self::Item, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let path = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        dst.reserve(256);
        dst.extend_from_slice(b"GET ");
        dst.extend_from_slice(path.as_bytes());
        dst.extend_from_slice(b" HTTP/1.1\r\n");

        if !req.headers.contains_key(header::HOST) {
            dst.extend_from_slice(b"host: ");
            dst.extend_from_slice(req.uri.host().unwrap_or_default().as_bytes());
            if let Some(port) = req.uri.port_u16() {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(port.to_string().as_bytes());
            }
            dst.extend_from_slice(b"\r\n");
        }

        for (name, value) in req.headers.iter() {
            // the required upgrade set below always wins
            if is_reserved(name) {
                continue;
            }
            write_header(dst, name.as_str().as_bytes(), value.as_bytes());
        }

        write_header(dst, b"upgrade", b"websocket");
        write_header(dst, b"connection", b"Upgrade");
        write_header(dst, b"sec-websocket-key", req.key.as_bytes());
        write_header(dst, b"sec-websocket-version", b"13");
        // no-cache headers guard against intermediaries rewriting
        // "Connection: upgrade" in the response
        write_header(dst, b"pragma", b"no-cache");
        write_header(dst, b"cache-control", b"no-cache");

        for extension in &req.extensions {
            write_header(
                dst,
                b"sec-websocket-extensions",
                extension.to_string().as_bytes(),
            );
        }
        for protocol in &req.protocols {
            write_header(dst, b"sec-websocket-protocol", protocol.as_bytes());
        }

        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

fn is_reserved(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "upgrade"
            | "connection"
            | "sec-websocket-key"
            | "sec-websocket-version"
            | "sec-websocket-extensions"
            | "sec-websocket-protocol"
            | "pragma"
            | "cache-control"
    )
}

fn write_header(dst: &mut BytesMut, name: &[u8], value: &[u8]) {
    dst.extend_from_slice(name);
    dst.extend_from_slice(b": ");
    dst.extend_from_slice(value);
    dst.extend_from_slice(b"\r\n");
}

impl Decoder for HandshakeCodec {
    type Item = ResponseHead;
    type Error = io::Error;

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (head, consumed) = {
            let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut res = httparse::Response::new(&mut parsed);

            match res.parse(&src[..]).map_err(invalid_data)? {
                httparse::Status::Complete(len) => {
                    if res.version != Some(1) {
                        return Err(invalid_data("unsupported http version"));
                    }
                    let status = res
                        .code
                        .and_then(|code| StatusCode::from_u16(code).ok())
                        .ok_or_else(|| invalid_data("invalid status code"))?;
                    let reason = res
                        .reason
                        .filter(|reason| !reason.is_empty())
                        .map(str::to_string);

                    let mut headers = HeaderMap::new();
                    for h in res.headers.iter() {
                        let name = HeaderName::from_bytes(h.name.as_bytes())
                            .map_err(invalid_data)?;
                        let value =
                            HeaderValue::from_bytes(h.value).map_err(invalid_data)?;
                        headers.append(name, value);
                    }

                    (
                        ResponseHead {
                            status,
                            reason,
                            headers,
                        },
                        len,
                    )
                }
                httparse::Status::Partial => {
                    return if src.len() >= MAX_BUFFER_SIZE {
                        Err(invalid_data("handshake response too large"))
                    } else {
                        Ok(None)
                    };
                }
            }
        };

        let _ = src.split_to(consumed);
        Ok(Some(head))
    }
}

fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Verify that the response is a genuine WebSocket accept for `key`.
///
/// Check order: status, `Upgrade` header, accept hash. Anything else in
/// the response is not this function's concern.
pub(crate) fn validate(key: &str, head: &ResponseHead) -> Result<(), UpgradeError> {
    if head.status != StatusCode::SWITCHING_PROTOCOLS {
        return Err(UpgradeError::UpgradeRejected {
            status: head.status,
            reason: head
                .reason
                .clone()
                .or_else(|| head.status.canonical_reason().map(str::to_string)),
        });
    }

    let upgrade = head
        .headers
        .get(&header::UPGRADE)
        .and_then(|hdr| hdr.to_str().ok());
    if !matches!(upgrade, Some(value) if value.eq_ignore_ascii_case("websocket")) {
        log::trace!("invalid upgrade header: {upgrade:?}");
        return Err(UpgradeError::ProtocolMismatch);
    }

    let expected = proto::hash_key(key.as_bytes());
    match head.headers.get(&header::SEC_WEBSOCKET_ACCEPT) {
        Some(hdr) if matches!(hdr.to_str(), Ok(value) if value.trim().eq_ignore_ascii_case(&expected)) => {
            Ok(())
        }
        received => {
            log::trace!(
                "invalid challenge response: expected: {expected} received: {received:?}"
            );
            Err(UpgradeError::AcceptHashMismatch {
                expected,
                received: received.cloned(),
            })
        }
    }
}
