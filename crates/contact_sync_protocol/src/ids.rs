//! Identifier types shared by the local and remote record spaces.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of a [`ContactIdentifier`] in bytes.
pub const CONTACT_IDENTIFIER_LEN: usize = 16;

/// Opaque local identifier of a contact-bearing account.
///
/// Stable for the lifetime of the contact and never reused while it exists.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Creates an account id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque remote identifier of a contact record.
///
/// Generated client-side when an account is first synced and persisted
/// from then on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactIdentifier([u8; CONTACT_IDENTIFIER_LEN]);

impl ContactIdentifier {
    /// Wraps raw identifier bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; CONTACT_IDENTIFIER_LEN]) -> Self {
        Self(bytes)
    }

    /// Generates a new uniformly random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; CONTACT_IDENTIFIER_LEN] {
        &self.0
    }

    /// Parses an identifier from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns an error if the slice is not exactly 16 bytes.
    pub fn try_from_slice(bytes: &[u8]) -> ProtocolResult<Self> {
        let array: [u8; CONTACT_IDENTIFIER_LEN] = bytes.try_into().map_err(|_| {
            ProtocolError::InvalidIdentifier(format!(
                "expected {CONTACT_IDENTIFIER_LEN} bytes, found {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Parses an identifier from 32 lowercase or uppercase hex digits.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex of the right length.
    pub fn from_hex(hex: &str) -> ProtocolResult<Self> {
        if hex.len() != CONTACT_IDENTIFIER_LEN * 2 || !hex.is_ascii() {
            return Err(ProtocolError::InvalidIdentifier(format!(
                "expected {} hex digits",
                CONTACT_IDENTIFIER_LEN * 2
            )));
        }

        let mut bytes = [0u8; CONTACT_IDENTIFIER_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| {
                ProtocolError::InvalidIdentifier(format!("invalid hex digit in {hex}"))
            })?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for ContactIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContactIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContactIdentifier({self})")
    }
}

/// Version stamped on a remote manifest.
///
/// Versions only move forward; the remote store accepts a manifest only
/// if it is exactly one past the version it currently holds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ManifestVersion(u64);

impl ManifestVersion {
    /// Version of an empty remote store (no manifest written yet).
    pub const ZERO: Self = Self(0);

    /// Creates a version.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the numeric version.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next candidate version.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for ManifestVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for ManifestVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_hex_display() {
        let id = ContactIdentifier::from_bytes([0xAB; 16]);
        assert_eq!(id.to_string(), "ab".repeat(16));
        assert_eq!(ContactIdentifier::from_hex(&id.to_string()).unwrap(), id);
        assert_eq!(
            ContactIdentifier::from_hex(&"AB".repeat(16)).unwrap(),
            id
        );
    }

    #[test]
    fn identifier_rejects_bad_input() {
        assert!(ContactIdentifier::from_hex("abc").is_err());
        assert!(ContactIdentifier::from_hex(&"zz".repeat(16)).is_err());
        assert!(ContactIdentifier::try_from_slice(&[1, 2, 3]).is_err());
        assert!(ContactIdentifier::try_from_slice(&[7u8; 16]).is_ok());
    }

    #[test]
    fn generated_identifiers_differ() {
        let a = ContactIdentifier::generate();
        let b = ContactIdentifier::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn version_ordering() {
        let v = ManifestVersion::new(4);
        assert_eq!(v.next(), ManifestVersion::new(5));
        assert!(v < v.next());
        assert_eq!(ManifestVersion::ZERO.next().get(), 1);
        assert_eq!(ManifestVersion::new(u64::MAX).next().get(), u64::MAX);
        assert_eq!(v.to_string(), "v4");
    }

    #[test]
    fn account_id_conversions() {
        let id: AccountId = "acct-1".into();
        assert_eq!(id.as_str(), "acct-1");
        assert_eq!(id, AccountId::from(String::from("acct-1")));
        assert_eq!(id.to_string(), "acct-1");
    }
}
