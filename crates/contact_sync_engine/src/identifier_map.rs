//! Bidirectional mapping between local accounts and remote identifiers.

use crate::error::{SyncError, SyncResult};
use contact_sync_protocol::{AccountId, ContactIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of resolving the remote identifier for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedIdentifier {
    /// The account was already synced under this identifier.
    Existing(ContactIdentifier),
    /// The account had no identifier; this one was just allocated for it.
    NewlyAllocated(ContactIdentifier),
}

impl ResolvedIdentifier {
    /// Returns the identifier regardless of how it was obtained.
    #[must_use]
    pub fn identifier(self) -> ContactIdentifier {
        match self {
            ResolvedIdentifier::Existing(id) | ResolvedIdentifier::NewlyAllocated(id) => id,
        }
    }

    /// Returns true if the identifier was allocated by this resolution.
    #[must_use]
    pub fn is_new(self) -> bool {
        matches!(self, ResolvedIdentifier::NewlyAllocated(_))
    }
}

/// A bijection between [`AccountId`]s and [`ContactIdentifier`]s.
///
/// # Invariants
///
/// - No two accounts share an identifier
/// - No account has more than one identifier
///
/// Every mutating method preserves both; inserting a pair displaces any
/// existing mapping of either side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierMap {
    by_account: BTreeMap<AccountId, ContactIdentifier>,
    by_identifier: BTreeMap<ContactIdentifier, AccountId>,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    account: AccountId,
    identifier: ContactIdentifier,
}

impl IdentifierMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of mapped accounts.
    pub fn len(&self) -> usize {
        self.by_account.len()
    }

    /// Returns true if nothing is mapped.
    pub fn is_empty(&self) -> bool {
        self.by_account.is_empty()
    }

    /// Returns the identifier mapped to `account`.
    pub fn identifier_for(&self, account: &AccountId) -> Option<ContactIdentifier> {
        self.by_account.get(account).copied()
    }

    /// Returns the account mapped to `identifier`.
    pub fn account_for(&self, identifier: &ContactIdentifier) -> Option<&AccountId> {
        self.by_identifier.get(identifier)
    }

    /// Maps `account` to `identifier`, displacing any previous mapping of
    /// either. Returns the identifier the account had before, if different.
    pub fn insert(
        &mut self,
        account: AccountId,
        identifier: ContactIdentifier,
    ) -> Option<ContactIdentifier> {
        if let Some(owner) = self.by_identifier.get(&identifier) {
            if owner != &account {
                let owner = owner.clone();
                self.by_account.remove(&owner);
            }
        }

        let previous = self.by_account.insert(account.clone(), identifier);
        if let Some(previous) = previous {
            if previous != identifier {
                self.by_identifier.remove(&previous);
            }
        }
        self.by_identifier.insert(identifier, account);

        previous.filter(|p| *p != identifier)
    }

    /// Removes the mapping of `account`, returning its identifier.
    pub fn remove_account(&mut self, account: &AccountId) -> Option<ContactIdentifier> {
        let identifier = self.by_account.remove(account)?;
        self.by_identifier.remove(&identifier);
        Some(identifier)
    }

    /// Returns the identifier for `account`, allocating and inserting a
    /// fresh random one if the account has never been synced.
    pub fn resolve_or_allocate(&mut self, account: &AccountId) -> ResolvedIdentifier {
        if let Some(existing) = self.identifier_for(account) {
            return ResolvedIdentifier::Existing(existing);
        }

        let mut identifier = ContactIdentifier::generate();
        while self.by_identifier.contains_key(&identifier) {
            identifier = ContactIdentifier::generate();
        }
        self.insert(account.clone(), identifier);
        ResolvedIdentifier::NewlyAllocated(identifier)
    }

    /// Iterates over `(account, identifier)` pairs in account order.
    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &ContactIdentifier)> {
        self.by_account.iter()
    }

    /// Iterates over all mapped identifiers in account order.
    pub fn identifiers(&self) -> impl Iterator<Item = ContactIdentifier> + '_ {
        self.by_account.values().copied()
    }

    /// Checks that both directions agree.
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.by_account.len() != self.by_identifier.len() {
            return Err(format!(
                "{} accounts but {} identifiers",
                self.by_account.len(),
                self.by_identifier.len()
            ));
        }
        for (account, identifier) in &self.by_account {
            if self.by_identifier.get(identifier) != Some(account) {
                return Err(format!(
                    "identifier {identifier} does not map back to account {account}"
                ));
            }
        }
        Ok(())
    }

    /// Encodes the map for storage.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let entries: Vec<StoredEntry> = self
            .by_account
            .iter()
            .map(|(account, identifier)| StoredEntry {
                account: account.clone(),
                identifier: *identifier,
            })
            .collect();

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&entries, &mut bytes)
            .map_err(|e| SyncError::Serialization(format!("identifier map: {e}")))?;
        Ok(bytes)
    }

    /// Decodes a stored map, rejecting anything that is not a bijection.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let entries: Vec<StoredEntry> = ciborium::de::from_reader(bytes)
            .map_err(|e| SyncError::Corrupted(format!("identifier map: {e}")))?;

        let mut map = Self::new();
        for entry in entries {
            if map.by_account.contains_key(&entry.account) {
                return Err(SyncError::Corrupted(format!(
                    "identifier map lists account {} twice",
                    entry.account
                )));
            }
            if map.by_identifier.contains_key(&entry.identifier) {
                return Err(SyncError::Corrupted(format!(
                    "identifier map lists identifier {} twice",
                    entry.identifier
                )));
            }
            map.insert(entry.account, entry.identifier);
        }
        Ok(map)
    }
}
