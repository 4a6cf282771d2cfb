//! Websockets client
use std::{cell::Cell, fmt, rc::Rc};

use base64::{engine::general_purpose::STANDARD as base64, Engine};
use ntex_http::error::Error as HttpError;
use ntex_http::header::{self, HeaderName, HeaderValue, AUTHORIZATION};
use ntex_http::{HeaderMap, Uri};

use crate::codec::Codec;
use crate::error::{RequestError, UpgradeError};
use crate::extension::{ExtensionConfig, ExtensionRegistry};
use crate::handshake::{self, HandshakeCodec, UpgradeRequest, UpgradeResponse};
use crate::io::{Connection, Transport};
use crate::pending;
use crate::session::{LocalEndpoint, Session, SessionGuard};
use crate::stack::ExtensionStack;

/// `WebSocket` upgrade client.
///
/// Holds the finalized request options, the shared extension registry and
/// the set of sessions it manages. One client runs any number of
/// independent connect operations.
pub struct WsClient {
    uri: Uri,
    headers: HeaderMap,
    extensions: Vec<ExtensionConfig>,
    protocols: Vec<String>,
    registry: Rc<ExtensionRegistry>,
    max_size: usize,
    sessions: Rc<Cell<usize>>,
}

/// `WebSocket` client builder
pub struct WsClientBuilder {
    inner: Option<Inner>,
    err: Option<HttpError>,
    origin: Option<HeaderValue>,
}

struct Inner {
    uri: Uri,
    headers: HeaderMap,
    extensions: Vec<ExtensionConfig>,
    protocols: Vec<String>,
    registry: Option<Rc<ExtensionRegistry>>,
    max_size: usize,
}

impl WsClient {
    /// Create new websocket client builder
    pub fn build<U>(uri: U) -> WsClientBuilder
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
    {
        WsClientBuilder::new(uri)
    }

    /// Shared extension registry.
    pub fn registry(&self) -> &ExtensionRegistry {
        &self.registry
    }

    /// Number of sessions currently managed by this client.
    pub fn sessions(&self) -> usize {
        self.sessions.get()
    }

    /// Perform the upgrade handshake over an established transport.
    ///
    /// `endpoint` receives an error event if the upgrade fails; the same
    /// failure then rejects the returned result. Success registers the
    /// session with this client until it goes away.
    pub async fn connect<T, E>(&self, io: T, endpoint: E) -> Result<Session<T>, UpgradeError>
    where
        T: Transport,
        E: LocalEndpoint + 'static,
    {
        let endpoint: Rc<dyn LocalEndpoint> = Rc::new(endpoint);
        let request = Rc::new(UpgradeRequest::new(
            self.uri.clone(),
            self.extensions.clone(),
            self.protocols.clone(),
            self.headers.clone(),
            endpoint,
        ));

        let (tx, rx) = pending::pair();
        match self.upgrade(io, request.clone()).await {
            Ok(session) => {
                let _ = tx.resolve(session);
            }
            Err(err) => {
                // the error event reaches the endpoint before the pending
                // result rejects
                request.endpoint().on_upgrade_error(&err);
                let _ = tx.reject(err);
            }
        }
        rx.await
    }

    async fn upgrade<T: Transport>(
        &self,
        io: T,
        request: Rc<UpgradeRequest>,
    ) -> Result<Session<T>, UpgradeError> {
        let conn = Connection::new(io);
        let codec = HandshakeCodec;

        log::trace!("opening ws connection to {:?}", request.uri());
        conn.send(request.clone(), &codec)
            .await
            .map_err(|err| UpgradeError::ConnectionFailure(Some(err.into_inner())))?;

        log::trace!("waiting for ws handshake response");
        let head = match conn.recv(&codec).await {
            Ok(Some(head)) => head,
            Ok(None) => return Err(UpgradeError::ConnectionFailure(None)),
            Err(err) => {
                return Err(UpgradeError::ConnectionFailure(Some(err.into_inner())))
            }
        };
        log::trace!("ws handshake response is received: {:?}", head.status);

        handshake::validate(request.key(), &head)?;
        log::trace!("ws handshake response verification is completed");

        let mut accepted = Vec::new();
        for value in head.headers.get_all(&header::SEC_WEBSOCKET_EXTENSIONS) {
            let value = value.to_str().map_err(|_| {
                UpgradeError::UnsupportedExtension {
                    name: "<non-ascii header value>".to_string(),
                }
            })?;
            accepted.extend(ExtensionConfig::parse_list(value).map_err(|_| {
                UpgradeError::UnsupportedExtension {
                    name: value.to_string(),
                }
            })?);
        }

        let frame_codec = Codec::new().max_size(self.max_size).client_mode();
        let stack = ExtensionStack::negotiate(
            &self.registry,
            request.extensions(),
            &accepted,
            &frame_codec,
        )?;

        let protocol = head
            .headers
            .get(&header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let response = UpgradeResponse::new(head, accepted, protocol);

        // hand-off: same transport and read buffer, frames decoded from
        // here on
        let guard = SessionGuard::register(self.sessions.clone());
        Ok(Session::new(
            conn,
            frame_codec,
            stack,
            request,
            response,
            self.max_size,
            guard,
        ))
    }
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nWsClient GET:{}", self.uri)?;
        writeln!(f, "  headers:")?;
        for (key, val) in self.headers.iter() {
            writeln!(f, "    {key:?}: {val:?}")?;
        }
        Ok(())
    }
}

impl WsClientBuilder {
    fn new<U>(uri: U) -> WsClientBuilder
    where
        Uri: TryFrom<U>,
        <Uri as TryFrom<U>>::Error: Into<HttpError>,
    {
        let (uri, err) = match Uri::try_from(uri) {
            Ok(uri) => (uri, None),
            Err(e) => (Uri::default(), Some(e.into())),
        };

        WsClientBuilder {
            err,
            origin: None,
            inner: Some(Inner {
                uri,
                headers: HeaderMap::new(),
                extensions: Vec::new(),
                protocols: Vec::new(),
                registry: None,
                max_size: 65_536,
            }),
        }
    }

    /// Set supported websocket protocols, in preference order.
    pub fn protocols<U, V>(&mut self, protos: U) -> &mut Self
    where
        U: IntoIterator<Item = V>,
        V: AsRef<str>,
    {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            parts.protocols = protos
                .into_iter()
                .map(|proto| proto.as_ref().to_string())
                .collect();
        }
        self
    }

    /// Offer an extension to the server. Offers are sent in the order they
    /// were added.
    pub fn extension(&mut self, config: ExtensionConfig) -> &mut Self {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            parts.extensions.push(config);
        }
        self
    }

    /// Use a shared extension registry instead of the default one.
    pub fn registry(&mut self, registry: Rc<ExtensionRegistry>) -> &mut Self {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            parts.registry = Some(registry);
        }
        self
    }

    /// Set request Origin
    pub fn origin<V, E>(&mut self, origin: V) -> &mut Self
    where
        HeaderValue: TryFrom<V, Error = E>,
        HttpError: From<E>,
    {
        match HeaderValue::try_from(origin) {
            Ok(value) => self.origin = Some(value),
            Err(e) => self.err = Some(e.into()),
        }
        self
    }

    /// Set max frame size
    ///
    /// By default max size is set to 64kb
    pub fn max_frame_size(&mut self, size: usize) -> &mut Self {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            parts.max_size = size;
        }
        self
    }

    /// Append a header.
    ///
    /// Header gets appended to existing header.
    /// To override header use `set_header()` method.
    pub fn header<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
        <HeaderName as TryFrom<K>>::Error: Into<HttpError>,
        <HeaderValue as TryFrom<V>>::Error: Into<HttpError>,
    {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            match HeaderName::try_from(key) {
                Ok(key) => match HeaderValue::try_from(value) {
                    Ok(value) => {
                        parts.headers.append(key, value);
                    }
                    Err(e) => self.err = Some(e.into()),
                },
                Err(e) => self.err = Some(e.into()),
            }
        }
        self
    }

    /// Insert a header, replaces existing header.
    pub fn set_header<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
        <HeaderName as TryFrom<K>>::Error: Into<HttpError>,
        <HeaderValue as TryFrom<V>>::Error: Into<HttpError>,
    {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            match HeaderName::try_from(key) {
                Ok(key) => match HeaderValue::try_from(value) {
                    Ok(value) => {
                        parts.headers.insert(key, value);
                    }
                    Err(e) => self.err = Some(e.into()),
                },
                Err(e) => self.err = Some(e.into()),
            }
        }
        self
    }

    /// Insert a header only if it is not yet set.
    pub fn set_header_if_none<K, V>(&mut self, key: K, value: V) -> &mut Self
    where
        HeaderName: TryFrom<K>,
        HeaderValue: TryFrom<V>,
        <HeaderName as TryFrom<K>>::Error: Into<HttpError>,
        <HeaderValue as TryFrom<V>>::Error: Into<HttpError>,
    {
        if let Some(parts) = parts(&mut self.inner, &self.err) {
            match HeaderName::try_from(key) {
                Ok(key) => {
                    if !parts.headers.contains_key(&key) {
                        match HeaderValue::try_from(value) {
                            Ok(value) => {
                                parts.headers.insert(key, value);
                            }
                            Err(e) => self.err = Some(e.into()),
                        }
                    }
                }
                Err(e) => self.err = Some(e.into()),
            }
        }
        self
    }

    /// Set HTTP basic authorization header
    pub fn basic_auth<U>(&mut self, username: U, password: Option<&str>) -> &mut Self
    where
        U: fmt::Display,
    {
        let auth = match password {
            Some(password) => format!("{username}:{password}"),
            None => format!("{username}:"),
        };
        self.header(AUTHORIZATION, format!("Basic {}", base64.encode(auth)))
    }

    /// Set HTTP bearer authentication header
    pub fn bearer_auth<U>(&mut self, token: U) -> &mut Self
    where
        U: fmt::Display,
    {
        self.header(AUTHORIZATION, format!("Bearer {token}"))
    }

    /// This method construct new `WsClientBuilder`
    pub fn take(&mut self) -> WsClientBuilder {
        WsClientBuilder {
            inner: self.inner.take(),
            err: self.err.take(),
            origin: self.origin.take(),
        }
    }

    /// Complete building process and construct websockets client.
    pub fn finish(&mut self) -> Result<WsClient, UpgradeError> {
        if let Some(e) = self.err.take() {
            return Err(RequestError::Http(e).into());
        }

        let mut inner = self.inner.take().expect("cannot reuse WsClient builder");

        // validate uri
        let uri = &inner.uri;
        if uri.scheme().is_none() {
            return Err(RequestError::MissingScheme.into());
        }
        match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("ws") => (),
            Some(scheme) if scheme.eq_ignore_ascii_case("wss") => (),
            _ => return Err(RequestError::UnknownScheme.into()),
        }
        if uri.host().is_none() {
            return Err(RequestError::MissingHost.into());
        }

        if let Some(origin) = self.origin.take() {
            inner.headers.insert(header::ORIGIN, origin);
        }

        Ok(WsClient {
            uri: inner.uri,
            headers: inner.headers,
            extensions: inner.extensions,
            protocols: inner.protocols,
            registry: inner
                .registry
                .unwrap_or_else(|| Rc::new(ExtensionRegistry::default())),
            max_size: inner.max_size,
            sessions: Rc::new(Cell::new(0)),
        })
    }
}

#[inline]
fn parts<'a>(
    parts: &'a mut Option<Inner>,
    err: &Option<HttpError>,
) -> Option<&'a mut Inner> {
    if err.is_some() {
        return None;
    }
    parts.as_mut()
}

impl fmt::Debug for WsClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref parts) = self.inner {
            writeln!(f, "\nWsClientBuilder GET:{}", parts.uri)?;
            writeln!(f, "  headers:")?;
            for (key, val) in parts.headers.iter() {
                writeln!(f, "    {key:?}: {val:?}")?;
            }
        } else {
            writeln!(f, "WsClientBuilder(Consumed)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(uri: &str) -> Result<WsClient, UpgradeError> {
        WsClient::build(uri).finish()
    }

    #[test]
    fn basic_errs() {
        let err = build("localhost").unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InvalidArgument(RequestError::MissingScheme)
        ));
        let err = build("unknown://localhost").unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InvalidArgument(RequestError::UnknownScheme)
        ));
        let err = build("http://localhost").unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InvalidArgument(RequestError::UnknownScheme)
        ));
        let err = build("ws:///test").unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InvalidArgument(RequestError::MissingHost)
        ));
        let err = build("/").unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InvalidArgument(RequestError::MissingScheme)
        ));

        assert!(build("WSS://localhost").is_ok());
    }

    #[test]
    fn test_debug() {
        let mut builder = WsClient::build("ws://localhost")
            .header("x-test", "111")
            .take();
        let repr = format!("{builder:?}");
        assert!(repr.contains("WsClientBuilder"));
        assert!(repr.contains("x-test"));

        let client = builder.finish().unwrap();
        let repr = format!("{client:?}");
        assert!(repr.contains("WsClient"));
        assert!(repr.contains("x-test"));
    }

    #[test]
    fn header_override() {
        let client = WsClient::build("ws://localhost")
            .header(header::CONTENT_TYPE, "111")
            .set_header(header::CONTENT_TYPE, "222")
            .finish()
            .unwrap();

        assert_eq!(
            client
                .headers
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "222"
        );
    }

    #[test]
    fn basic_auth() {
        let client = WsClient::build("ws://localhost")
            .basic_auth("username", Some("password"))
            .finish()
            .unwrap();
        assert_eq!(
            client
                .headers
                .get(header::AUTHORIZATION)
                .unwrap()
                .to_str()
                .unwrap(),
            "Basic dXNlcm5hbWU6cGFzc3dvcmQ="
        );

        let client = WsClient::build("ws://localhost")
            .basic_auth("username", None)
            .finish()
            .unwrap();
        assert_eq!(
            client
                .headers
                .get(header::AUTHORIZATION)
                .unwrap()
                .to_str()
                .unwrap(),
            "Basic dXNlcm5hbWU6"
        );
    }

    #[test]
    fn bearer_auth() {
        let client = WsClient::build("ws://localhost")
            .bearer_auth("someS3cr3tAutht0k3n")
            .finish()
            .unwrap();
        assert_eq!(
            client
                .headers
                .get(header::AUTHORIZATION)
                .unwrap()
                .to_str()
                .unwrap(),
            "Bearer someS3cr3tAutht0k3n"
        );
    }

    #[test]
    fn basics() {
        let mut builder = WsClient::build("wss://localhost/")
            .origin("test-origin")
            .max_frame_size(100)
            .protocols(["v1", "v2"])
            .extension(ExtensionConfig::new("identity"))
            .set_header_if_none(header::CONTENT_TYPE, "json")
            .set_header_if_none(header::CONTENT_TYPE, "text")
            .take();
        assert_eq!(
            builder.origin.as_ref().unwrap().to_str().unwrap(),
            "test-origin"
        );
        assert_eq!(builder.inner.as_ref().unwrap().max_size, 100);
        assert_eq!(
            builder.inner.as_ref().unwrap().protocols,
            ["v1".to_string(), "v2".to_string()]
        );

        let client = builder.finish().unwrap();
        assert_eq!(
            client.headers.get(header::CONTENT_TYPE).unwrap(),
            &HeaderValue::from_static("json")
        );
        assert_eq!(
            client.headers.get(header::ORIGIN).unwrap(),
            &HeaderValue::from_static("test-origin")
        );
        assert_eq!(client.sessions(), 0);
        assert!(client.registry().contains("identity"));
    }
}
