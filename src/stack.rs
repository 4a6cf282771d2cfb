//! Ordered extension stack assembly and frame routing.
use std::fmt;

use crate::codec::{Codec, WireFrame};
use crate::error::{ProtocolError, UpgradeError};
use crate::extension::{Extension, ExtensionConfig, ExtensionRegistry};

/// The ordered chain of negotiated extensions between the transport and the
/// session.
///
/// Layer 0 is transport-adjacent. Incoming frames traverse layers first to
/// last before the session sees them; outgoing frames traverse last to
/// first before the codec writes them, so the layering is symmetric in both
/// directions.
pub struct ExtensionStack {
    layers: Vec<Box<dyn Extension>>,
}

impl ExtensionStack {
    /// Build the stack from the server's accepted configurations.
    ///
    /// Order is server-dictated and preserved. Every accepted name must be
    /// known to the registry and must have been offered by the client; a
    /// server introducing anything else is a protocol violation. Offered
    /// extensions the server did not accept are simply absent.
    pub fn negotiate(
        registry: &ExtensionRegistry,
        offered: &[ExtensionConfig],
        accepted: &[ExtensionConfig],
        codec: &Codec,
    ) -> Result<ExtensionStack, UpgradeError> {
        let mut layers = Vec::with_capacity(accepted.len());
        for config in accepted {
            let factory = registry.get(config.name()).ok_or_else(|| {
                UpgradeError::UnsupportedExtension {
                    name: config.name().to_string(),
                }
            })?;
            if !offered.iter().any(|offer| offer.name() == config.name()) {
                return Err(UpgradeError::UnsupportedExtension {
                    name: config.name().to_string(),
                });
            }

            let mut extension = factory.create(config)?;
            extension.configure(codec)?;
            layers.push(extension);
        }

        Ok(ExtensionStack { layers })
    }

    /// Stack with no layers, for sessions negotiated without extensions.
    pub fn empty() -> ExtensionStack {
        ExtensionStack { layers: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Layer names from transport-adjacent to application-adjacent.
    pub fn names(&self) -> Vec<&str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }

    /// Run a frame arriving from the transport through the stack.
    pub(crate) fn incoming(&mut self, mut frame: WireFrame) -> Result<WireFrame, ProtocolError> {
        for layer in self.layers.iter_mut() {
            frame = layer.on_incoming(frame)?;
        }
        Ok(frame)
    }

    /// Run a frame leaving the application through the stack.
    pub(crate) fn outgoing(&mut self, mut frame: WireFrame) -> Result<WireFrame, ProtocolError> {
        for layer in self.layers.iter_mut().rev() {
            frame = layer.on_outgoing(frame)?;
        }
        Ok(frame)
    }
}

impl fmt::Debug for ExtensionStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionStack")
            .field("layers", &self.names())
            .finish()
    }
}
