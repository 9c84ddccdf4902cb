//! The pending change set: local intent not yet reflected remotely.

use crate::error::{SyncError, SyncResult};
use contact_sync_protocol::{AccountId, ChangeState};
use std::collections::BTreeMap;

/// Per-account change states awaiting a backup.
///
/// Absence means [`ChangeState::Unchanged`]; setting an account to
/// `Unchanged` removes its entry, so the set never stores it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingChangeSet {
    changes: BTreeMap<AccountId, ChangeState>,
}

impl PendingChangeSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the state of `account`.
    pub fn state_of(&self, account: &AccountId) -> ChangeState {
        self.changes.get(account).copied().unwrap_or_default()
    }

    /// Sets the state of `account`. The last write for an account wins.
    pub fn set(&mut self, account: AccountId, state: ChangeState) {
        if state.is_pending() {
            self.changes.insert(account, state);
        } else {
            self.changes.remove(&account);
        }
    }

    /// Marks every account in `accounts` as updated.
    pub fn mark_updated<'a>(&mut self, accounts: impl IntoIterator<Item = &'a AccountId>) {
        for account in accounts {
            self.set(account.clone(), ChangeState::Updated);
        }
    }

    /// Marks every account in `accounts` as deleted.
    pub fn mark_deleted<'a>(&mut self, accounts: impl IntoIterator<Item = &'a AccountId>) {
        for account in accounts {
            self.set(account.clone(), ChangeState::Deleted);
        }
    }

    /// Clears the entry for `account`.
    pub fn clear(&mut self, account: &AccountId) -> ChangeState {
        self.changes.remove(account).unwrap_or_default()
    }

    /// Returns accounts with the given state, in account order.
    pub fn accounts_with(&self, state: ChangeState) -> Vec<AccountId> {
        self.changes
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(account, _)| account.clone())
            .collect()
    }

    /// Iterates over all entries in account order.
    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, ChangeState)> {
        self.changes.iter().map(|(account, state)| (account, *state))
    }

    /// Returns the number of pending entries.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Returns true if every entry of `self` is also pending in `other`.
    pub fn is_subset_of(&self, other: &PendingChangeSet) -> bool {
        self.changes
            .iter()
            .all(|(account, state)| other.state_of(account) == *state)
    }

    /// Encodes the set for storage as a map of account to state code.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let codes: BTreeMap<&AccountId, u8> = self
            .changes
            .iter()
            .map(|(account, state)| (account, state.to_code()))
            .collect();

        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&codes, &mut bytes)
            .map_err(|e| SyncError::Serialization(format!("change map: {e}")))?;
        Ok(bytes)
    }

    /// Decodes a stored set. Unknown and `Unchanged` codes are dropped.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let mut set = Self::new();
        for (account, code) in Self::decode_codes(bytes)? {
            match ChangeState::from_code(code) {
                Some(state) => set.set(account, state),
                None => tracing::warn!(%account, code, "dropping unknown change state"),
            }
        }
        Ok(set)
    }

    /// Decodes the raw stored state codes without interpreting them.
    pub(crate) fn decode_codes(bytes: &[u8]) -> SyncResult<BTreeMap<AccountId, u8>> {
        ciborium::de::from_reader(bytes)
            .map_err(|e| SyncError::Corrupted(format!("change map: {e}")))
    }
}
