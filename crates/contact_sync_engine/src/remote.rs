//! Remote store abstraction and an in-memory reference implementation.

use crate::error::{SyncError, SyncResult};
use contact_sync_protocol::{ContactIdentifier, ContactRecord, Manifest, ManifestVersion};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

/// Result of a compare-and-swap manifest update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestUpdate {
    /// The manifest and records were stored.
    Accepted,
    /// Another device wrote first; this is the manifest it wrote.
    Conflict(Manifest),
}

/// The remote versioned store shared by a user's devices.
///
/// This trait abstracts the network service. Timeouts are the
/// implementation's concern; the engine never cancels a call in flight.
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetches the current manifest, or `None` if nothing was ever stored.
    fn fetch_manifest(&self) -> impl Future<Output = SyncResult<Option<Manifest>>> + Send;

    /// Fetches the records stored under `identifiers`.
    ///
    /// The result may be in any order and may omit identifiers with no
    /// record.
    fn fetch_contacts(
        &self,
        identifiers: &[ContactIdentifier],
    ) -> impl Future<Output = SyncResult<Vec<ContactRecord>>> + Send;

    /// Stores `manifest`, `records` and removes `deleted` in one step if
    /// `manifest.version()` is exactly one past the stored version.
    fn update_manifest(
        &self,
        manifest: &Manifest,
        records: Vec<ContactRecord>,
        deleted: Vec<ContactIdentifier>,
    ) -> impl Future<Output = SyncResult<ManifestUpdate>> + Send;
}

/// Counts of calls made against a [`MemoryRemoteStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCalls {
    /// `fetch_manifest` calls.
    pub fetch_manifest: u64,
    /// `fetch_contacts` calls.
    pub fetch_contacts: u64,
    /// `update_manifest` calls.
    pub update_manifest: u64,
}

impl RemoteCalls {
    /// Returns the total number of calls.
    pub fn total(&self) -> u64 {
        self.fetch_manifest + self.fetch_contacts + self.update_manifest
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    manifest: Option<Manifest>,
    records: BTreeMap<ContactIdentifier, ContactRecord>,
}

/// An in-memory remote store with compare-and-swap semantics.
///
/// Supports failure injection for testing: transient and fatal errors,
/// lost acknowledgements, stray records and artificial latency.
#[derive(Debug, Default)]
pub struct MemoryRemoteStore {
    state: Mutex<RemoteState>,
    stray_records: Mutex<Vec<ContactRecord>>,
    fail_next: AtomicU32,
    fail_fatal: AtomicBool,
    lose_next_ack: AtomicBool,
    latency: Mutex<Option<Duration>>,
    fetch_manifest_calls: AtomicU64,
    fetch_contacts_calls: AtomicU64,
    update_manifest_calls: AtomicU64,
}

impl MemoryRemoteStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the stored manifest and records, as another device would.
    ///
    /// Records not listed in `manifest` are discarded.
    pub fn install(&self, manifest: Manifest, records: Vec<ContactRecord>) {
        let mut state = self.state.lock();
        state.records = records
            .into_iter()
            .filter(|record| manifest.contains(&record.identifier))
            .map(|record| (record.identifier, record))
            .collect();
        state.manifest = Some(manifest);
    }

    /// Returns the stored manifest.
    pub fn manifest(&self) -> Option<Manifest> {
        self.state.lock().manifest.clone()
    }

    /// Returns the stored manifest version.
    pub fn version(&self) -> Option<ManifestVersion> {
        self.state.lock().manifest.as_ref().map(Manifest::version)
    }

    /// Returns the record stored under `identifier`.
    pub fn record(&self, identifier: &ContactIdentifier) -> Option<ContactRecord> {
        self.state.lock().records.get(identifier).cloned()
    }

    /// Returns every stored record in identifier order.
    pub fn records(&self) -> Vec<ContactRecord> {
        self.state.lock().records.values().cloned().collect()
    }

    /// Makes the next `count` calls fail with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Makes every call fail with a non-retryable error until reset.
    pub fn set_fatal(&self, fatal: bool) {
        self.fail_fatal.store(fatal, Ordering::SeqCst);
    }

    /// Applies the next accepted update but reports a retryable error, as if
    /// the acknowledgement were lost in transit.
    pub fn lose_next_ack(&self) {
        self.lose_next_ack.store(true, Ordering::SeqCst);
    }

    /// Returns `records` from every `fetch_contacts` call, listed or not.
    pub fn add_stray_records(&self, records: Vec<ContactRecord>) {
        self.stray_records.lock().extend(records);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Returns call counts so far.
    pub fn calls(&self) -> RemoteCalls {
        RemoteCalls {
            fetch_manifest: self.fetch_manifest_calls.load(Ordering::SeqCst),
            fetch_contacts: self.fetch_contacts_calls.load(Ordering::SeqCst),
            update_manifest: self.update_manifest_calls.load(Ordering::SeqCst),
        }
    }

    async fn begin_call(&self, counter: &AtomicU64) -> SyncResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if self.fail_fatal.load(Ordering::SeqCst) {
            return Err(SyncError::remote_fatal("remote rejected request"));
        }

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::remote_retryable("remote unavailable"));
        }
        Ok(())
    }
}

impl RemoteStore for MemoryRemoteStore {
    async fn fetch_manifest(&self) -> SyncResult<Option<Manifest>> {
        self.begin_call(&self.fetch_manifest_calls).await?;
        Ok(self.manifest())
    }

    async fn fetch_contacts(
        &self,
        identifiers: &[ContactIdentifier],
    ) -> SyncResult<Vec<ContactRecord>> {
        self.begin_call(&self.fetch_contacts_calls).await?;

        let mut records: Vec<ContactRecord> = {
            let state = self.state.lock();
            identifiers
                .iter()
                .filter_map(|identifier| state.records.get(identifier).cloned())
                .collect()
        };
        records.extend(self.stray_records.lock().iter().cloned());
        Ok(records)
    }

    async fn update_manifest(
        &self,
        manifest: &Manifest,
        records: Vec<ContactRecord>,
        deleted: Vec<ContactIdentifier>,
    ) -> SyncResult<ManifestUpdate> {
        self.begin_call(&self.update_manifest_calls).await?;

        {
            let mut state = self.state.lock();
            if let Some(current) = &state.manifest {
                if manifest.version() != current.version().next() {
                    tracing::debug!(
                        current = %current.version(),
                        candidate = %manifest.version(),
                        "rejecting stale manifest"
                    );
                    return Ok(ManifestUpdate::Conflict(current.clone()));
                }
            }

            for identifier in &deleted {
                state.records.remove(identifier);
            }
            for record in records {
                state.records.insert(record.identifier, record);
            }
            state.records.retain(|identifier, _| manifest.contains(identifier));
            state.manifest = Some(manifest.clone());
        }

        if self.lose_next_ack.swap(false, Ordering::SeqCst) {
            return Err(SyncError::remote_retryable("acknowledgement lost"));
        }
        Ok(ManifestUpdate::Accepted)
    }
}
