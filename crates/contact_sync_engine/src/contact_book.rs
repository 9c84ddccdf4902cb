//! In-memory contact book implementing both record collaborators.

use crate::error::{SyncError, SyncResult};
use crate::record::{MergeOutcome, RecordBuilder, RecordMerger};
use contact_sync_protocol::{AccountId, ContactIdentifier, ContactRecord};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Synchronizable fields of one local contact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalContact {
    /// Service identifier.
    pub service_id: Option<String>,
    /// E.164 phone number.
    pub phone_number: Option<String>,
    /// Given name.
    pub given_name: Option<String>,
    /// Family name.
    pub family_name: Option<String>,
    /// Profile key.
    pub profile_key: Option<Vec<u8>>,
    /// Blocked flag.
    pub blocked: bool,
    /// Whitelisted flag.
    pub whitelisted: bool,
}

impl LocalContact {
    /// Creates a contact known by service identifier.
    pub fn with_service_id(service_id: impl Into<String>) -> Self {
        Self {
            service_id: Some(service_id.into()),
            ..Self::default()
        }
    }

    /// Creates a contact known by phone number.
    pub fn with_phone_number(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: Some(phone_number.into()),
            ..Self::default()
        }
    }

    /// Sets the given name.
    pub fn named(mut self, given_name: impl Into<String>) -> Self {
        self.given_name = Some(given_name.into());
        self
    }

    /// Sets the blocked flag.
    pub fn blocked(mut self, blocked: bool) -> Self {
        self.blocked = blocked;
        self
    }

    /// Copies the fields of a remote record.
    pub fn from_record(record: &ContactRecord) -> Self {
        Self {
            service_id: record.service_id.clone(),
            phone_number: record.phone_number.clone(),
            given_name: record.given_name.clone(),
            family_name: record.family_name.clone(),
            profile_key: record.profile_key.clone(),
            blocked: record.blocked,
            whitelisted: record.whitelisted,
        }
    }

    /// Snapshots the contact into a record stored under `identifier`.
    pub fn to_record(&self, identifier: ContactIdentifier) -> ContactRecord {
        ContactRecord {
            identifier,
            service_id: self.service_id.clone(),
            phone_number: self.phone_number.clone(),
            given_name: self.given_name.clone(),
            family_name: self.family_name.clone(),
            profile_key: self.profile_key.clone(),
            blocked: self.blocked,
            whitelisted: self.whitelisted,
        }
    }
}

/// Local contacts keyed by account, with build failure injection.
///
/// Remote records are matched to local accounts by service identifier, then
/// by phone number. When a matched account's fields differ, the local copy
/// wins and the account is reported as needing an update. An unmatched
/// record creates a new account named after its service identifier or phone
/// number.
#[derive(Debug, Default)]
pub struct MemoryContactBook {
    contacts: RwLock<BTreeMap<AccountId, LocalContact>>,
    failing: RwLock<BTreeSet<AccountId>>,
    builds: AtomicU64,
}

impl MemoryContactBook {
    /// Creates an empty contact book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a contact.
    pub fn upsert(&self, account: impl Into<AccountId>, contact: LocalContact) {
        self.contacts.write().insert(account.into(), contact);
    }

    /// Removes a contact.
    pub fn remove(&self, account: &AccountId) -> Option<LocalContact> {
        self.contacts.write().remove(account)
    }

    /// Returns a contact.
    pub fn contact(&self, account: &AccountId) -> Option<LocalContact> {
        self.contacts.read().get(account).cloned()
    }

    /// Returns the number of contacts.
    pub fn len(&self) -> usize {
        self.contacts.read().len()
    }

    /// Returns true if the book has no contacts.
    pub fn is_empty(&self) -> bool {
        self.contacts.read().is_empty()
    }

    /// Makes every build for `account` fail until [`Self::heal`] is called.
    pub fn fail_builds_for(&self, account: impl Into<AccountId>) {
        self.failing.write().insert(account.into());
    }

    /// Stops failing builds for `account`.
    pub fn heal(&self, account: &AccountId) {
        self.failing.write().remove(account);
    }

    /// Returns the number of build attempts, successful or not.
    pub fn build_count(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn find_account(&self, record: &ContactRecord) -> Option<AccountId> {
        let contacts = self.contacts.read();
        let find = |value: &Option<String>,
                    field: fn(&LocalContact) -> Option<&str>|
         -> Option<AccountId> {
            let value = value.as_deref()?;
            contacts
                .iter()
                .find(|(_, contact)| field(contact) == Some(value))
                .map(|(account, _)| account.clone())
        };

        find(&record.service_id, |c| c.service_id.as_deref())
            .or_else(|| find(&record.phone_number, |c| c.phone_number.as_deref()))
    }
}

impl RecordBuilder for MemoryContactBook {
    fn build(
        &self,
        account: &AccountId,
        identifier: ContactIdentifier,
    ) -> SyncResult<ContactRecord> {
        self.builds.fetch_add(1, Ordering::Relaxed);

        if self.failing.read().contains(account) {
            return Err(SyncError::build(account.clone(), "contact unavailable"));
        }

        self.contacts
            .read()
            .get(account)
            .map(|contact| contact.to_record(identifier))
            .ok_or_else(|| SyncError::build(account.clone(), "no such contact"))
    }
}

impl RecordMerger for MemoryContactBook {
    fn merge_with_existing(&self, record: &ContactRecord) -> MergeOutcome {
        if let Err(error) = record.validate() {
            tracing::debug!(identifier = %record.identifier, %error, "ignoring invalid record");
            return MergeOutcome::Invalid;
        }

        if let Some(account) = self.find_account(record) {
            let contacts = self.contacts.read();
            let differs = contacts
                .get(&account)
                .is_some_and(|local| !local.to_record(record.identifier).same_fields(record));
            return if differs {
                MergeOutcome::NeedsUpdate(account)
            } else {
                MergeOutcome::Resolved(account)
            };
        }

        let name = record
            .service_id
            .clone()
            .or_else(|| record.phone_number.clone())
            .unwrap_or_else(|| record.identifier.to_string());
        let account = AccountId::new(name);
        self.contacts
            .write()
            .insert(account.clone(), LocalContact::from_record(record));
        MergeOutcome::Resolved(account)
    }
}
