//! The remote manifest: the authoritative listing of synced contacts.

use crate::error::{from_cbor, to_cbor, ProtocolError, ProtocolResult};
use crate::ids::{ContactIdentifier, ManifestVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A versioned listing of every contact identifier in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    version: ManifestVersion,
    identifiers: Vec<ContactIdentifier>,
}

impl Manifest {
    /// Starts building a manifest for `version`.
    pub fn builder(version: ManifestVersion) -> ManifestBuilder {
        ManifestBuilder::new(version)
    }

    /// Returns the manifest version.
    #[must_use]
    pub fn version(&self) -> ManifestVersion {
        self.version
    }

    /// Returns the listed identifiers in manifest order.
    #[must_use]
    pub fn identifiers(&self) -> &[ContactIdentifier] {
        &self.identifiers
    }

    /// Returns true if the manifest lists `identifier`.
    #[must_use]
    pub fn contains(&self, identifier: &ContactIdentifier) -> bool {
        self.identifiers.contains(identifier)
    }

    /// Returns the number of listed identifiers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    /// Returns true if the manifest lists nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR and re-validates the manifest.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let decoded: Manifest = from_cbor(bytes)?;
        ManifestBuilder::new(decoded.version)
            .identifiers(decoded.identifiers)
            .build()
    }
}

/// Builder for [`Manifest`].
///
/// # Example
///
/// ```
/// use contact_sync_protocol::{ContactIdentifier, Manifest, ManifestVersion};
///
/// let manifest = Manifest::builder(ManifestVersion::new(3))
///     .identifier(ContactIdentifier::from_bytes([1; 16]))
///     .build()
///     .unwrap();
/// assert_eq!(manifest.len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    version: ManifestVersion,
    identifiers: Vec<ContactIdentifier>,
}

impl ManifestBuilder {
    /// Creates a builder for `version`.
    pub fn new(version: ManifestVersion) -> Self {
        Self {
            version,
            identifiers: Vec::new(),
        }
    }

    /// Adds one identifier.
    pub fn identifier(mut self, identifier: ContactIdentifier) -> Self {
        self.identifiers.push(identifier);
        self
    }

    /// Adds a sequence of identifiers.
    pub fn identifiers(mut self, identifiers: impl IntoIterator<Item = ContactIdentifier>) -> Self {
        self.identifiers.extend(identifiers);
        self
    }

    /// Validates and builds the manifest.
    ///
    /// # Errors
    ///
    /// Returns `InvalidManifest` if the version is zero or an identifier is
    /// listed twice.
    pub fn build(self) -> ProtocolResult<Manifest> {
        if self.version == ManifestVersion::ZERO {
            return Err(ProtocolError::InvalidManifest(
                "version 0 is reserved for an empty store".into(),
            ));
        }

        let mut seen = HashSet::with_capacity(self.identifiers.len());
        for identifier in &self.identifiers {
            if !seen.insert(identifier) {
                return Err(ProtocolError::InvalidManifest(format!(
                    "duplicate identifier {identifier}"
                )));
            }
        }

        Ok(Manifest {
            version: self.version,
            identifiers: self.identifiers,
        })
    }
}
