//! Durable sync state.
//!
//! The identifier map, pending change set and manifest version live under
//! three keys of one collection and are always read and written together,
//! inside a single transaction.

use crate::error::SyncResult;
use crate::identifier_map::IdentifierMap;
use crate::pending::PendingChangeSet;
use contact_sync_protocol::{ChangeState, ManifestVersion};
use contact_sync_storage::KvStore;
use std::sync::Arc;

/// Collection holding the sync state.
pub const SYNC_COLLECTION: &str = "contact_sync";
/// Key of the encoded identifier map.
pub const IDENTIFIER_MAP_KEY: &str = "identifier_map";
/// Key of the encoded pending change map.
pub const CHANGE_MAP_KEY: &str = "change_map";
/// Key of the manifest version.
pub const MANIFEST_VERSION_KEY: &str = "manifest_version";

/// A consistent view of the whole sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSnapshot {
    /// Account to remote identifier mapping.
    pub identifier_map: IdentifierMap,
    /// Changes not yet pushed.
    pub pending: PendingChangeSet,
    /// Last manifest version observed, `None` before the first restore or
    /// backup.
    pub version: Option<ManifestVersion>,
}

impl SyncSnapshot {
    fn decode(
        identifier_map: Option<&[u8]>,
        change_map: Option<&[u8]>,
        version: Option<u64>,
    ) -> SyncResult<Self> {
        Ok(Self {
            identifier_map: identifier_map
                .map(IdentifierMap::decode)
                .transpose()?
                .unwrap_or_default(),
            pending: change_map
                .map(PendingChangeSet::decode)
                .transpose()?
                .unwrap_or_default(),
            version: version.map(ManifestVersion::new),
        })
    }
}

/// Reads and writes [`SyncSnapshot`]s in a [`KvStore`].
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    store: Arc<KvStore>,
}

impl SyncStateStore {
    /// Wraps a key-value store.
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Loads the committed state in one read transaction.
    pub fn load(&self) -> SyncResult<SyncSnapshot> {
        self.store.read(|txn| {
            SyncSnapshot::decode(
                txn.get(SYNC_COLLECTION, IDENTIFIER_MAP_KEY),
                txn.get(SYNC_COLLECTION, CHANGE_MAP_KEY),
                txn.get_u64(SYNC_COLLECTION, MANIFEST_VERSION_KEY)?,
            )
        })
    }

    /// Returns the committed manifest version.
    pub fn manifest_version(&self) -> SyncResult<Option<ManifestVersion>> {
        let version = self
            .store
            .read(|txn| txn.get_u64(SYNC_COLLECTION, MANIFEST_VERSION_KEY))?;
        Ok(version.map(ManifestVersion::new))
    }

    /// Atomically replaces the committed state with `snapshot`.
    pub fn commit(&self, snapshot: &SyncSnapshot) -> SyncResult<()> {
        let identifier_map = snapshot.identifier_map.encode()?;
        let change_map = snapshot.pending.encode()?;

        self.store.write(|txn| {
            txn.set(SYNC_COLLECTION, IDENTIFIER_MAP_KEY, identifier_map);
            txn.set(SYNC_COLLECTION, CHANGE_MAP_KEY, change_map);
            match snapshot.version {
                Some(version) => txn.set_u64(SYNC_COLLECTION, MANIFEST_VERSION_KEY, version.get()),
                None => {
                    txn.remove(SYNC_COLLECTION, MANIFEST_VERSION_KEY);
                }
            }
            Ok(())
        })
    }

    /// Checks the committed state and returns every problem found.
    ///
    /// Unlike [`Self::load`], this reports stored entries that loading
    /// would silently drop: unknown change codes and explicit `Unchanged`
    /// entries.
    pub fn verify(&self) -> SyncResult<Vec<String>> {
        self.store.read(|txn| {
            let mut problems = Vec::new();

            if let Some(bytes) = txn.get(SYNC_COLLECTION, IDENTIFIER_MAP_KEY) {
                match IdentifierMap::decode(bytes) {
                    Ok(map) => {
                        if let Err(problem) = map.check_invariants() {
                            problems.push(format!("identifier map: {problem}"));
                        }
                    }
                    Err(error) => problems.push(error.to_string()),
                }
            }

            if let Some(bytes) = txn.get(SYNC_COLLECTION, CHANGE_MAP_KEY) {
                match PendingChangeSet::decode_codes(bytes) {
                    Ok(codes) => {
                        for (account, code) in codes {
                            match ChangeState::from_code(code) {
                                None => problems.push(format!(
                                    "change map: account {account} has unknown state code {code}"
                                )),
                                Some(ChangeState::Unchanged) => problems.push(format!(
                                    "change map: account {account} is stored as unchanged"
                                )),
                                Some(_) => {}
                            }
                        }
                    }
                    Err(error) => problems.push(error.to_string()),
                }
            }

            if let Err(error) = txn.get_u64(SYNC_COLLECTION, MANIFEST_VERSION_KEY) {
                problems.push(error.to_string());
            }

            Ok(problems)
        })
    }

    /// Applies `f` to the pending change set inside one write transaction.
    ///
    /// Returns the set as committed.
    pub fn update_pending(
        &self,
        f: impl FnOnce(&mut PendingChangeSet),
    ) -> SyncResult<PendingChangeSet> {
        self.store.write(|txn| {
            let mut pending = txn
                .get(SYNC_COLLECTION, CHANGE_MAP_KEY)
                .map(PendingChangeSet::decode)
                .transpose()?
                .unwrap_or_default();

            f(&mut pending);

            txn.set(SYNC_COLLECTION, CHANGE_MAP_KEY, pending.encode()?);
            Ok(pending)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contact_sync_protocol::{AccountId, ContactIdentifier};
    use contact_sync_storage::{InMemoryBackend, StorageError};
    use std::collections::BTreeMap;

    fn state_store() -> SyncStateStore {
        SyncStateStore::new(Arc::new(KvStore::in_memory()))
    }

    #[test]
    fn empty_store_loads_default() {
        let store = state_store();
        assert_eq!(store.load().unwrap(), SyncSnapshot::default());
        assert_eq!(store.manifest_version().unwrap(), None);
    }

    #[test]
    fn commit_then_load() {
        let store = state_store();
        let mut snapshot = SyncSnapshot::default();
        snapshot
            .identifier_map
            .insert(AccountId::new("a1"), ContactIdentifier::from_bytes([1; 16]));
        snapshot.pending.set(AccountId::new("a2"), ChangeState::Deleted);
        snapshot.version = Some(ManifestVersion::new(5));

        store.commit(&snapshot).unwrap();
        assert_eq!(store.load().unwrap(), snapshot);
        assert_eq!(store.manifest_version().unwrap(), Some(ManifestVersion::new(5)));
    }

    #[test]
    fn update_pending_is_read_modify_write() {
        let store = state_store();
        store
            .update_pending(|p| p.mark_updated([&AccountId::new("a1")]))
            .unwrap();
        let pending = store
            .update_pending(|p| p.mark_deleted([&AccountId::new("a2")]))
            .unwrap();

        assert_eq!(pending.len(), 2);
        assert_eq!(store.load().unwrap().pending, pending);
    }

    #[test]
    fn failed_commit_leaves_state_untouched() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = SyncStateStore::new(Arc::new(KvStore::open(Arc::clone(&backend)).unwrap()));

        let mut snapshot = SyncSnapshot::default();
        snapshot.version = Some(ManifestVersion::new(1));
        store.commit(&snapshot).unwrap();

        backend.reject_next_persists(1);
        snapshot.version = Some(ManifestVersion::new(2));
        let err = store.commit(&snapshot).unwrap_err();
        assert!(matches!(
            err,
            crate::SyncError::Storage(StorageError::PersistRejected(_))
        ));
        assert_eq!(store.manifest_version().unwrap(), Some(ManifestVersion::new(1)));
    }

    #[test]
    fn verify_reports_dropped_entries() {
        let kv = Arc::new(KvStore::in_memory());
        let codes: BTreeMap<AccountId, u8> =
            [(AccountId::new("a1"), 0), (AccountId::new("a2"), 9), (AccountId::new("a3"), 2)]
                .into_iter()
                .collect();
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&codes, &mut bytes).unwrap();
        kv.write(|txn| {
            txn.set(SYNC_COLLECTION, CHANGE_MAP_KEY, bytes);
            Ok::<_, StorageError>(())
        })
        .unwrap();

        let store = SyncStateStore::new(kv);
        let problems = store.verify().unwrap();
        assert_eq!(problems.len(), 2);
        assert!(problems[0].contains("a1"));
        assert!(problems[1].contains("unknown state code 9"));
        assert_eq!(store.load().unwrap().pending.len(), 1);
    }

    #[test]
    fn verify_accepts_committed_state() {
        let store = state_store();
        let mut snapshot = SyncSnapshot::default();
        snapshot
            .identifier_map
            .insert(AccountId::new("a1"), ContactIdentifier::from_bytes([1; 16]));
        snapshot.pending.set(AccountId::new("a1"), ChangeState::Updated);
        store.commit(&snapshot).unwrap();

        assert!(store.verify().unwrap().is_empty());
    }

    #[test]
    fn corrupted_blob_is_reported() {
        let kv = Arc::new(KvStore::in_memory());
        kv.write(|txn| {
            txn.set(SYNC_COLLECTION, IDENTIFIER_MAP_KEY, vec![0xFF]);
            Ok::<_, StorageError>(())
        })
        .unwrap();

        let store = SyncStateStore::new(kv);
        assert!(matches!(store.load(), Err(crate::SyncError::Corrupted(_))));
    }
}
