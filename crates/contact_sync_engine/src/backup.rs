//! Backup planning.
//!
//! A plan is computed from a snapshot of the sync state without touching
//! storage or the network. It holds the candidate manifest, the records to
//! push and the snapshot to commit if the remote accepts.

use crate::error::SyncResult;
use crate::identifier_map::ResolvedIdentifier;
use crate::persistence::SyncSnapshot;
use crate::record::RecordBuilder;
use contact_sync_protocol::{
    AccountId, ChangeState, ContactIdentifier, ContactRecord, Manifest, ManifestVersion,
};
use std::collections::BTreeMap;

/// Consecutive build failures per account, kept for the life of an engine.
#[derive(Debug, Clone, Default)]
pub struct BuildFailures {
    ceiling: Option<u32>,
    counts: BTreeMap<AccountId, u32>,
}

impl BuildFailures {
    /// Creates a tracker that abandons an account after `ceiling`
    /// consecutive failures, or never if `None`.
    pub fn new(ceiling: Option<u32>) -> Self {
        Self {
            ceiling,
            counts: BTreeMap::new(),
        }
    }

    /// Records a failure and returns true if the account should be
    /// abandoned.
    pub fn record_failure(&mut self, account: &AccountId) -> bool {
        let count = self.counts.entry(account.clone()).or_insert(0);
        *count += 1;
        match self.ceiling {
            Some(ceiling) if *count >= ceiling => {
                self.counts.remove(account);
                true
            }
            _ => false,
        }
    }

    /// Forgets failures of an account whose record was built.
    pub fn record_success(&mut self, account: &AccountId) {
        self.counts.remove(account);
    }

    /// Returns the current failure count of an account.
    pub fn count(&self, account: &AccountId) -> u32 {
        self.counts.get(account).copied().unwrap_or(0)
    }
}

/// Everything a backup attempt sends and, on acceptance, commits.
#[derive(Debug, Clone)]
pub struct BackupPlan {
    /// State to commit once the remote accepts the manifest.
    pub snapshot: SyncSnapshot,
    /// Candidate manifest, one version past the local one.
    pub manifest: Manifest,
    /// Records built for pending updates.
    pub records: Vec<ContactRecord>,
    /// Identifiers of deleted accounts to remove remotely.
    pub deleted: Vec<ContactIdentifier>,
    /// Accounts whose record could not be built; they stay pending.
    pub failed: Vec<AccountId>,
    /// Accounts dropped after too many consecutive build failures.
    pub abandoned: Vec<AccountId>,
}

/// Plans a backup from `snapshot`.
///
/// Pending entries are cleared optimistically: the returned snapshot is
/// only committed after the remote accepts the manifest.
///
/// # Errors
///
/// Returns [`crate::SyncError::Serialization`] if the manifest cannot be
/// built.
pub fn plan_backup<B>(
    mut snapshot: SyncSnapshot,
    builder: &B,
    failures: &mut BuildFailures,
) -> SyncResult<BackupPlan>
where
    B: RecordBuilder + ?Sized,
{
    let mut records = Vec::new();
    let mut deleted = Vec::new();
    let mut failed = Vec::new();
    let mut abandoned = Vec::new();

    for account in snapshot.pending.accounts_with(ChangeState::Updated) {
        let resolved = snapshot.identifier_map.resolve_or_allocate(&account);

        match builder.build(&account, resolved.identifier()) {
            Ok(record) => {
                failures.record_success(&account);
                snapshot.pending.clear(&account);
                records.push(record);
            }
            Err(error) => {
                if let ResolvedIdentifier::NewlyAllocated(_) = resolved {
                    snapshot.identifier_map.remove_account(&account);
                }

                if failures.record_failure(&account) {
                    tracing::error!(%account, %error, "abandoning pending update");
                    snapshot.pending.clear(&account);
                    abandoned.push(account);
                } else {
                    tracing::warn!(%account, %error, "failed to build record");
                    failed.push(account);
                }
            }
        }
    }

    for account in snapshot.pending.accounts_with(ChangeState::Deleted) {
        if let Some(identifier) = snapshot.identifier_map.remove_account(&account) {
            deleted.push(identifier);
        }
        snapshot.pending.clear(&account);
    }

    let version = ManifestVersion::new(snapshot.version.map_or(0, ManifestVersion::get)).next();
    let manifest = Manifest::builder(version)
        .identifiers(snapshot.identifier_map.identifiers())
        .build()?;

    Ok(BackupPlan {
        snapshot,
        manifest,
        records,
        deleted,
        failed,
        abandoned,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact_book::{LocalContact, MemoryContactBook};

    fn account(name: &str) -> AccountId {
        AccountId::new(name)
    }

    fn id(n: u8) -> ContactIdentifier {
        ContactIdentifier::from_bytes([n; 16])
    }

    fn book() -> MemoryContactBook {
        let book = MemoryContactBook::new();
        book.upsert("a1", LocalContact::with_service_id("svc-1"));
        book.upsert("a2", LocalContact::with_service_id("svc-2"));
        book
    }

    #[test]
    fn update_allocates_identifier_and_clears_pending() {
        let mut snapshot = SyncSnapshot::default();
        snapshot.pending.mark_updated([&account("a1")]);

        let plan = plan_backup(snapshot, &book(), &mut BuildFailures::default()).unwrap();

        let identifier = plan.snapshot.identifier_map.identifier_for(&account("a1")).unwrap();
        assert_eq!(plan.manifest.version(), ManifestVersion::new(1));
        assert_eq!(plan.manifest.identifiers(), &[identifier]);
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.records[0].identifier, identifier);
        assert!(plan.snapshot.pending.is_empty());
    }

    #[test]
    fn existing_identifier_is_reused() {
        let mut snapshot = SyncSnapshot::default();
        snapshot.identifier_map.insert(account("a1"), id(1));
        snapshot.version = Some(ManifestVersion::new(6));
        snapshot.pending.mark_updated([&account("a1")]);

        let plan = plan_backup(snapshot, &book(), &mut BuildFailures::default()).unwrap();
        assert_eq!(plan.manifest.version(), ManifestVersion::new(7));
        assert_eq!(plan.records[0].identifier, id(1));
    }

    #[test]
    fn deletion_of_never_synced_account_only_drops_pending() {
        let mut snapshot = SyncSnapshot::default();
        snapshot.version = Some(ManifestVersion::new(2));
        snapshot.pending.mark_deleted([&account("a9")]);

        let plan = plan_backup(snapshot, &book(), &mut BuildFailures::default()).unwrap();
        assert!(plan.deleted.is_empty());
        assert!(plan.snapshot.pending.is_empty());
        assert!(plan.manifest.is_empty());
        assert_eq!(plan.manifest.version(), ManifestVersion::new(3));
    }

    #[test]
    fn deletion_removes_mapping() {
        let mut snapshot = SyncSnapshot::default();
        snapshot.identifier_map.insert(account("a1"), id(1));
        snapshot.identifier_map.insert(account("a2"), id(2));
        snapshot.version = Some(ManifestVersion::new(1));
        snapshot.pending.mark_deleted([&account("a1")]);

        let plan = plan_backup(snapshot, &book(), &mut BuildFailures::default()).unwrap();
        assert_eq!(plan.deleted, vec![id(1)]);
        assert_eq!(plan.manifest.identifiers(), &[id(2)]);
        assert_eq!(plan.snapshot.identifier_map.identifier_for(&account("a1")), None);
    }

    #[test]
    fn build_failure_is_isolated() {
        let book = book();
        book.fail_builds_for("a2");

        let mut snapshot = SyncSnapshot::default();
        snapshot.identifier_map.insert(account("a1"), id(1));
        snapshot.version = Some(ManifestVersion::new(4));
        snapshot.pending.mark_updated([&account("a1"), &account("a2")]);

        let plan = plan_backup(snapshot, &book, &mut BuildFailures::default()).unwrap();
        assert_eq!(plan.records.len(), 1);
        assert_eq!(plan.failed, vec![account("a2")]);
        assert_eq!(plan.snapshot.pending.state_of(&account("a2")), ChangeState::Updated);
        assert_eq!(plan.snapshot.pending.state_of(&account("a1")), ChangeState::Unchanged);
        // the failed account's fresh identifier is released
        assert_eq!(plan.snapshot.identifier_map.identifier_for(&account("a2")), None);
        assert_eq!(plan.manifest.identifiers(), &[id(1)]);
    }

    #[test]
    fn failure_ceiling_abandons_account() {
        let book = book();
        book.fail_builds_for("a1");
        let mut failures = BuildFailures::new(Some(2));

        let mut snapshot = SyncSnapshot::default();
        snapshot.pending.mark_updated([&account("a1")]);

        let first = plan_backup(snapshot.clone(), &book, &mut failures).unwrap();
        assert_eq!(first.failed, vec![account("a1")]);
        assert_eq!(failures.count(&account("a1")), 1);

        let second = plan_backup(snapshot, &book, &mut failures).unwrap();
        assert!(second.failed.is_empty());
        assert_eq!(second.abandoned, vec![account("a1")]);
        assert!(second.snapshot.pending.is_empty());
    }

    #[test]
    fn success_resets_failure_count() {
        let mut failures = BuildFailures::new(Some(3));
        failures.record_failure(&account("a1"));
        failures.record_failure(&account("a1"));
        failures.record_success(&account("a1"));
        assert_eq!(failures.count(&account("a1")), 0);
        assert!(!BuildFailures::new(None).record_failure(&account("a1")));
    }
}
