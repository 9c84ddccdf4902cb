//! Contact records exchanged with the remote store.

use crate::error::{from_cbor, to_cbor, ProtocolError, ProtocolResult};
use crate::ids::ContactIdentifier;
use serde::{Deserialize, Serialize};

/// Length of a profile key in bytes.
pub const PROFILE_KEY_LEN: usize = 32;

/// Immutable wire snapshot of one contact's synchronizable fields.
///
/// A record is built on demand for a single backup and never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    /// Remote identifier this record is stored under.
    pub identifier: ContactIdentifier,
    /// Service identifier of the contact, if known.
    pub service_id: Option<String>,
    /// E.164 phone number of the contact, if known.
    pub phone_number: Option<String>,
    /// Given name from the contact's profile.
    pub given_name: Option<String>,
    /// Family name from the contact's profile.
    pub family_name: Option<String>,
    /// Profile key, if shared with us.
    pub profile_key: Option<Vec<u8>>,
    /// Whether the contact is blocked.
    pub blocked: bool,
    /// Whether the contact has been approved to message us.
    pub whitelisted: bool,
}

impl ContactRecord {
    /// Creates an otherwise empty record for `identifier`.
    pub fn new(identifier: ContactIdentifier) -> Self {
        Self {
            identifier,
            service_id: None,
            phone_number: None,
            given_name: None,
            family_name: None,
            profile_key: None,
            blocked: false,
            whitelisted: false,
        }
    }

    /// Sets the service identifier.
    pub fn with_service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    /// Sets the phone number.
    pub fn with_phone_number(mut self, phone_number: impl Into<String>) -> Self {
        self.phone_number = Some(phone_number.into());
        self
    }

    /// Sets the profile names.
    pub fn with_names(
        mut self,
        given_name: impl Into<String>,
        family_name: Option<String>,
    ) -> Self {
        self.given_name = Some(given_name.into());
        self.family_name = family_name;
        self
    }

    /// Sets the profile key.
    pub fn with_profile_key(mut self, key: Vec<u8>) -> Self {
        self.profile_key = Some(key);
        self
    }

    /// Sets the blocked flag.
    pub fn with_blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }

    /// Sets the whitelisted flag.
    pub fn with_whitelisted(mut self, whitelisted: bool) -> Self {
        self.whitelisted = whitelisted;
        self
    }

    /// Checks that the record can identify a contact.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if the record has neither a service id nor a
    /// phone number, if either is blank, or if the profile key has the
    /// wrong length.
    pub fn validate(&self) -> ProtocolResult<()> {
        let has_text =
            |value: &Option<String>| value.as_deref().is_some_and(|s| !s.trim().is_empty());

        if !has_text(&self.service_id) && !has_text(&self.phone_number) {
            return Err(ProtocolError::InvalidRecord(format!(
                "record {} has no service id or phone number",
                self.identifier
            )));
        }

        if let Some(phone) = &self.phone_number {
            let digits = phone.strip_prefix('+').unwrap_or(phone);
            if !phone.starts_with('+')
                || digits.is_empty()
                || !digits.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(ProtocolError::InvalidRecord(format!(
                    "record {} has malformed phone number",
                    self.identifier
                )));
            }
        }

        if let Some(key) = &self.profile_key {
            if key.len() != PROFILE_KEY_LEN {
                return Err(ProtocolError::InvalidRecord(format!(
                    "record {} has a {}-byte profile key",
                    self.identifier,
                    key.len()
                )));
            }
        }

        Ok(())
    }

    /// Returns true if both records carry the same synchronizable fields,
    /// ignoring the identifier they are stored under.
    #[must_use]
    pub fn same_fields(&self, other: &ContactRecord) -> bool {
        self.service_id == other.service_id
            && self.phone_number == other.phone_number
            && self.given_name == other.given_name
            && self.family_name == other.family_name
            && self.profile_key == other.profile_key
            && self.blocked == other.blocked
            && self.whitelisted == other.whitelisted
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR. Decoding does not validate; see [`Self::validate`].
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}
