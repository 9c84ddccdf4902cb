//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors produced while building, validating or coding protocol values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A manifest could not be built.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A contact record failed validation.
    #[error("invalid contact record: {0}")]
    InvalidRecord(String),

    /// A contact identifier had the wrong length or format.
    #[error("invalid contact identifier: {0}")]
    InvalidIdentifier(String),

    /// Failed to encode a value to CBOR.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {0}")]
    Decoding(String),
}

/// Encodes a serde value as CBOR.
pub(crate) fn to_cbor<T: serde::Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::ser::into_writer(value, &mut bytes)
        .map_err(|e| ProtocolError::Encoding(e.to_string()))?;
    Ok(bytes)
}

/// Decodes a serde value from CBOR.
pub(crate) fn from_cbor<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| ProtocolError::Decoding(e.to_string()))
}
