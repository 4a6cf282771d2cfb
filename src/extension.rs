//! Named extension configuration and the client-side extension registry.
use std::fmt;

use thiserror::Error;

use crate::codec::{Codec, WireFrame};
use crate::error::{ProtocolError, UpgradeError};

/// A single `Sec-WebSocket-Extensions` token: an extension name with an
/// ordered parameter list.
///
/// Matching during negotiation is by name; parameters are carried through
/// unmodified for the extension implementation to interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    name: String,
    params: Vec<(String, Option<String>)>,
}

/// Malformed extension configuration token.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("empty extension name")]
    EmptyName,
    #[error("empty extension parameter name")]
    EmptyParam,
    #[error("unbalanced quotes in extension parameters")]
    UnbalancedQuote,
}

impl ExtensionConfig {
    /// Create a config with no parameters.
    pub fn new<T: Into<String>>(name: T) -> ExtensionConfig {
        ExtensionConfig {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn param<K, V>(mut self, name: K, value: Option<V>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.params.push((name.into(), value.map(Into::into)));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, Option<String>)] {
        &self.params
    }

    /// Look up a parameter value by name.
    pub fn get_param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_deref())
    }

    /// Parse a single `name;param=value;...` token. Parameter values may be
    /// quoted strings with backslash escapes.
    pub fn parse(token: &str) -> Result<ExtensionConfig, ConfigError> {
        let parts = split_quoted(token, ';')?;
        let name = parts[0].trim();
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let mut params = Vec::new();
        for part in &parts[1..] {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    if key.is_empty() {
                        return Err(ConfigError::EmptyParam);
                    }
                    params.push((key.to_string(), Some(unquote(value))));
                }
                None => params.push((part.to_string(), None)),
            }
        }

        Ok(ExtensionConfig {
            name: name.to_string(),
            params,
        })
    }

    /// Parse a comma-separated `Sec-WebSocket-Extensions` header value into
    /// the configs it carries, preserving order.
    pub fn parse_list(value: &str) -> Result<Vec<ExtensionConfig>, ConfigError> {
        let mut configs = Vec::new();
        for token in split_quoted(value, ',')? {
            if token.trim().is_empty() {
                continue;
            }
            configs.push(ExtensionConfig::parse(token)?);
        }
        Ok(configs)
    }
}

impl fmt::Display for ExtensionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (key, value) in &self.params {
            write!(f, ";{key}")?;
            if let Some(value) = value {
                if is_token(value) {
                    write!(f, "={value}")?;
                } else {
                    write!(f, "=\"")?;
                    for ch in value.chars() {
                        if ch == '"' || ch == '\\' {
                            write!(f, "\\")?;
                        }
                        write!(f, "{ch}")?;
                    }
                    write!(f, "\"")?;
                }
            }
        }
        Ok(())
    }
}

/// Split `input` on `sep`, treating quoted regions as opaque.
fn split_quoted(input: &str, sep: char) -> Result<Vec<&str>, ConfigError> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escape = false;
    for (idx, ch) in input.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if quoted => escape = true,
            '"' => quoted = !quoted,
            ch if ch == sep && !quoted => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => (),
        }
    }
    if quoted {
        return Err(ConfigError::UnbalancedQuote);
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
        let mut out = String::with_capacity(value.len() - 2);
        let mut escape = false;
        for ch in value[1..value.len() - 1].chars() {
            if escape {
                out.push(ch);
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else {
                out.push(ch);
            }
        }
        out
    } else {
        value.to_string()
    }
}

fn is_token(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|ch| {
            ch.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(ch)
        })
}

/// One negotiated layer of the extension stack.
///
/// Data frames pass through `on_incoming`/`on_outgoing`; control frames
/// never enter the stack. `configure` runs once against the frame codec
/// before the stack goes live, which is where an extension claims the RSV
/// bits it owns.
pub trait Extension: fmt::Debug {
    fn name(&self) -> &str;

    /// Configure the wire-level parser/generator for this extension.
    fn configure(&mut self, codec: &Codec) -> Result<(), UpgradeError> {
        let _ = codec;
        Ok(())
    }

    /// Transform a frame arriving from the transport.
    fn on_incoming(&mut self, frame: WireFrame) -> Result<WireFrame, ProtocolError>;

    /// Transform a frame leaving the application.
    fn on_outgoing(&mut self, frame: WireFrame) -> Result<WireFrame, ProtocolError>;
}

/// Creates extension instances from server-accepted configurations.
pub trait ExtensionFactory {
    fn name(&self) -> &str;

    /// Instantiate the extension for one negotiated config.
    fn create(&self, config: &ExtensionConfig) -> Result<Box<dyn Extension>, UpgradeError>;
}

/// The set of extensions this client is able to negotiate.
///
/// Read-only once handed to a client; shared by reference between all
/// in-flight upgrades.
pub struct ExtensionRegistry {
    factories: Vec<Box<dyn ExtensionFactory>>,
}

impl ExtensionRegistry {
    /// Create an empty registry.
    pub fn new() -> ExtensionRegistry {
        ExtensionRegistry {
            factories: Vec::new(),
        }
    }

    /// Register a factory, replacing a previous registration with the same
    /// name.
    pub fn register<F>(&mut self, factory: F)
    where
        F: ExtensionFactory + 'static,
    {
        self.factories.retain(|f| f.name() != factory.name());
        self.factories.push(Box::new(factory));
    }

    /// Check whether an extension name is available.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&dyn ExtensionFactory> {
        self.factories
            .iter()
            .find(|factory| factory.name() == name)
            .map(|factory| factory.as_ref())
    }

    /// Registered extension names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|f| f.name())
    }
}

impl Default for ExtensionRegistry {
    /// Registry with the built-in `identity` extension.
    fn default() -> ExtensionRegistry {
        let mut registry = ExtensionRegistry::new();
        registry.register(IdentityFactory);
        registry
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|fa| fa.name()))
            .finish()
    }
}

/// The `identity` extension: negotiable, transforms nothing.
#[derive(Debug, Default)]
pub struct IdentityFactory;

impl ExtensionFactory for IdentityFactory {
    fn name(&self) -> &str {
        "identity"
    }

    fn create(&self, _: &ExtensionConfig) -> Result<Box<dyn Extension>, UpgradeError> {
        Ok(Box::new(Identity))
    }
}

#[derive(Debug)]
struct Identity;

impl Extension for Identity {
    fn name(&self) -> &str {
        "identity"
    }

    fn on_incoming(&mut self, frame: WireFrame) -> Result<WireFrame, ProtocolError> {
        Ok(frame)
    }

    fn on_outgoing(&mut self, frame: WireFrame) -> Result<WireFrame, ProtocolError> {
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain() {
        let config = ExtensionConfig::parse("permessage-deflate").unwrap();
        assert_eq!(config.name(), "permessage-deflate");
        assert!(config.params().is_empty());
    }

    #[test]
    fn parse_params() {
        let config = ExtensionConfig::parse(
            "permessage-deflate; client_max_window_bits=10; server_no_context_takeover",
        )
        .unwrap();
        assert_eq!(config.name(), "permessage-deflate");
        assert_eq!(config.get_param("client_max_window_bits"), Some(Some("10")));
        assert_eq!(config.get_param("server_no_context_takeover"), Some(None));
        assert_eq!(config.get_param("missing"), None);
    }

    #[test]
    fn parse_quoted_value() {
        let config = ExtensionConfig::parse(r#"x-vendor; note="semi;colon, and \"quote\"""#)
            .unwrap();
        assert_eq!(
            config.get_param("note"),
            Some(Some(r#"semi;colon, and "quote""#))
        );
    }

    #[test]
    fn parse_list_preserves_order() {
        let configs =
            ExtensionConfig::parse_list("first; a=1, second, third; b=\"x,y\"").unwrap();
        let names: Vec<&str> = configs.iter().map(ExtensionConfig::name).collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert_eq!(configs[2].get_param("b"), Some(Some("x,y")));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            ExtensionConfig::parse("; a=1"),
            Err(ConfigError::EmptyName)
        );
        assert_eq!(
            ExtensionConfig::parse("ext; =1"),
            Err(ConfigError::EmptyParam)
        );
        assert_eq!(
            ExtensionConfig::parse("ext; a=\"unterminated"),
            Err(ConfigError::UnbalancedQuote)
        );
    }

    #[test]
    fn display_roundtrip() {
        let config = ExtensionConfig::new("permessage-deflate")
            .param("server_no_context_takeover", None::<String>)
            .param("client_max_window_bits", Some("10"));
        let text = config.to_string();
        assert_eq!(
            text,
            "permessage-deflate;server_no_context_takeover;client_max_window_bits=10"
        );
        assert_eq!(ExtensionConfig::parse(&text).unwrap(), config);

        let quoted = ExtensionConfig::new("x-vendor").param("note", Some("a,b;c"));
        assert_eq!(quoted.to_string(), "x-vendor;note=\"a,b;c\"");
        assert_eq!(ExtensionConfig::parse(&quoted.to_string()).unwrap(), quoted);
    }

    #[test]
    fn registry_replaces_by_name() {
        let mut registry = ExtensionRegistry::new();
        assert!(!registry.contains("identity"));
        registry.register(IdentityFactory);
        registry.register(IdentityFactory);
        assert_eq!(registry.names().count(), 1);
        assert!(registry.contains("identity"));
    }

    #[test]
    fn default_registry_has_identity() {
        let registry = ExtensionRegistry::default();
        assert!(registry.contains("identity"));
    }
}
