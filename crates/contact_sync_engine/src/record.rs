//! Local collaborators that turn accounts into records and back.

use crate::error::SyncResult;
use contact_sync_protocol::{AccountId, ContactIdentifier, ContactRecord};

/// Outcome of merging one remote record into local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The record is malformed and is ignored.
    Invalid,
    /// Local state for this account is newer; it must be pushed again.
    NeedsUpdate(AccountId),
    /// The record now describes this account.
    Resolved(AccountId),
}

/// Builds wire records from local account state.
pub trait RecordBuilder: Send + Sync {
    /// Snapshots the synchronizable fields of `account` into a record stored
    /// under `identifier`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SyncError::Build`] if the account cannot be read.
    /// The failure only affects this account.
    fn build(&self, account: &AccountId, identifier: ContactIdentifier)
        -> SyncResult<ContactRecord>;
}

/// Applies remote records to local account state.
pub trait RecordMerger: Send + Sync {
    /// Merges `record` into local state and reports which account it
    /// belongs to.
    fn merge_with_existing(&self, record: &ContactRecord) -> MergeOutcome;
}
