//! The sync operation: a single worker that executes all units of work.
//!
//! Units run strictly in the order they were enqueued, one at a time. Only
//! the worker reads or writes the sync state, so a unit always sees the
//! effects of every unit before it.

use crate::backup::{plan_backup, BackupPlan, BuildFailures};
use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::merge::{apply_merge, MergeReport};
use crate::persistence::SyncStateStore;
use crate::record::{RecordBuilder, RecordMerger};
use crate::remote::{ManifestUpdate, RemoteStore};
use crate::scheduler::BackupScheduler;
use contact_sync_protocol::{AccountId, Manifest, ManifestVersion};
use contact_sync_storage::KvStore;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// The kind of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Marking accounts as updated.
    RecordUpdates,
    /// Marking accounts as deleted.
    RecordDeletions,
    /// Pushing pending changes.
    Backup,
    /// Fetching the remote manifest on first run.
    Restore,
}

impl OperationKind {
    /// Returns a short name for logs and errors.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::RecordUpdates => "record-updates",
            OperationKind::RecordDeletions => "record-deletions",
            OperationKind::Backup => "backup",
            OperationKind::Restore => "restore",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The observable state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// Waiting for work.
    Idle,
    /// Executing an attempt.
    Running(OperationKind),
    /// Waiting out the backoff before the given attempt (1-indexed).
    Retrying {
        /// The unit being retried.
        kind: OperationKind,
        /// The attempt about to run.
        attempt: u32,
    },
    /// The last unit succeeded.
    Succeeded(OperationKind),
    /// The last unit failed terminally.
    Failed(OperationKind),
    /// The worker has exited.
    Stopped,
}

impl OperationState {
    /// Returns true while a unit is executing or waiting to retry.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OperationState::Running(_) | OperationState::Retrying { .. }
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Units that succeeded.
    pub operations_completed: u64,
    /// Units that failed terminally.
    pub operations_failed: u64,
    /// Backups accepted by the remote.
    pub backups_committed: u64,
    /// Backup conflicts resolved by merging.
    pub conflicts_merged: u64,
    /// Restores that merged a remote manifest.
    pub restores_merged: u64,
    /// Attempts retried after a retryable error.
    pub retries: u64,
    /// Records that could not be built.
    pub build_failures: u64,
    /// Accounts dropped after too many build failures.
    pub accounts_abandoned: u64,
    /// Records pushed in committed backups.
    pub records_pushed: u64,
    /// Identifiers removed in committed backups.
    pub identifiers_deleted: u64,
    /// Last terminal error message.
    pub last_error: Option<String>,
}

/// Result of a backup unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupReport {
    /// The remote accepted the manifest and local state was committed.
    Committed {
        /// The version now stored locally and remotely.
        version: ManifestVersion,
        /// Records pushed.
        pushed: usize,
        /// Identifiers removed remotely.
        deleted: usize,
        /// Accounts that stay pending because their record failed to build.
        failed: Vec<AccountId>,
        /// Accounts dropped after too many build failures.
        abandoned: Vec<AccountId>,
    },
    /// Another device wrote first. Its manifest was merged and a follow-up
    /// backup was enqueued.
    Merged(MergeReport),
}

/// Result of a restore unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreReport {
    /// A manifest version is already recorded; nothing was fetched.
    AlreadyRestored(ManifestVersion),
    /// The remote has never stored a manifest.
    NoRemoteManifest,
    /// The remote manifest was merged.
    Merged(MergeReport),
}

type Responder<T> = oneshot::Sender<SyncResult<T>>;

enum Envelope {
    RecordUpdates(Vec<AccountId>, Responder<usize>),
    RecordDeletions(Vec<AccountId>, Responder<usize>),
    Backup(Option<Responder<BackupReport>>),
    Restore(Responder<RestoreReport>),
    Shutdown,
}

/// A pending result of an enqueued unit of work.
#[must_use = "a ticket does nothing unless awaited"]
#[derive(Debug)]
pub struct SyncTicket<T> {
    rx: oneshot::Receiver<SyncResult<T>>,
}

impl<T> SyncTicket<T> {
    /// Waits for the unit to finish.
    ///
    /// Resolves to [`SyncError::EngineStopped`] if the engine stopped before
    /// the unit ran.
    pub async fn wait(self) -> SyncResult<T> {
        self.rx.await.unwrap_or(Err(SyncError::EngineStopped))
    }
}

struct Shared {
    stats: RwLock<SyncStats>,
    state: watch::Sender<OperationState>,
}

impl Shared {
    fn set_state(&self, state: OperationState) {
        self.state.send_replace(state);
    }
}

/// Tracks attempts of one unit and applies the retry policy.
struct Attempts {
    kind: OperationKind,
    retry: RetryConfig,
    attempt: u32,
    shared: Arc<Shared>,
}

impl Attempts {
    fn new(kind: OperationKind, retry: &RetryConfig, shared: &Arc<Shared>) -> Self {
        Self {
            kind,
            retry: retry.clone(),
            attempt: 0,
            shared: Arc::clone(shared),
        }
    }

    /// Waits out the backoff, if any, and starts the next attempt.
    async fn begin(&mut self) {
        let delay = self.retry.delay_for_attempt(self.attempt);
        self.attempt += 1;

        if !delay.is_zero() {
            self.shared.set_state(OperationState::Retrying {
                kind: self.kind,
                attempt: self.attempt,
            });
            tokio::time::sleep(delay).await;
        }

        tracing::debug!(kind = %self.kind, attempt = self.attempt, "starting attempt");
        self.shared.set_state(OperationState::Running(self.kind));
    }

    /// Returns `Ok` if the unit should be attempted again, or the terminal
    /// error.
    fn failed(&self, error: SyncError) -> SyncResult<()> {
        if !error.is_retryable() {
            return Err(error);
        }

        if self.attempt >= self.retry.max_attempts.max(1) {
            return Err(SyncError::RetriesExhausted {
                kind: self.kind.as_str(),
                attempts: self.attempt,
                last: Box::new(error),
            });
        }

        tracing::warn!(
            kind = %self.kind,
            attempt = self.attempt,
            %error,
            "attempt failed, retrying"
        );
        self.shared.stats.write().retries += 1;
        Ok(())
    }
}

struct Worker<R, C> {
    config: SyncConfig,
    state: SyncStateStore,
    remote: Arc<R>,
    contacts: Arc<C>,
    failures: BuildFailures,
    shared: Arc<Shared>,
    queue: mpsc::WeakUnboundedSender<Envelope>,
}

impl<R, C> Worker<R, C>
where
    R: RemoteStore,
    C: RecordBuilder + RecordMerger + 'static,
{
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::RecordUpdates(accounts, reply) => {
                    let result = self.record(OperationKind::RecordUpdates, &accounts).await;
                    self.finish(OperationKind::RecordUpdates, result, Some(reply));
                }
                Envelope::RecordDeletions(accounts, reply) => {
                    let result = self.record(OperationKind::RecordDeletions, &accounts).await;
                    self.finish(OperationKind::RecordDeletions, result, Some(reply));
                }
                Envelope::Backup(reply) => {
                    let result = self.backup().await;
                    self.finish(OperationKind::Backup, result, reply);
                }
                Envelope::Restore(reply) => {
                    let result = self.restore().await;
                    self.finish(OperationKind::Restore, result, Some(reply));
                }
                Envelope::Shutdown => break,
            }
        }

        rx.close();
        self.shared.set_state(OperationState::Stopped);
        tracing::debug!("sync worker stopped");
    }

    fn finish<T>(&self, kind: OperationKind, result: SyncResult<T>, reply: Option<Responder<T>>) {
        match &result {
            Ok(_) => {
                self.shared.stats.write().operations_completed += 1;
                self.shared.set_state(OperationState::Succeeded(kind));
                tracing::debug!(%kind, "operation succeeded");
            }
            Err(error) => {
                {
                    let mut stats = self.shared.stats.write();
                    stats.operations_failed += 1;
                    stats.last_error = Some(error.to_string());
                }
                self.shared.set_state(OperationState::Failed(kind));
                tracing::error!(%kind, %error, "operation failed");
            }
        }

        if let Some(reply) = reply {
            // The caller may have dropped its ticket.
            let _ = reply.send(result);
        }
    }

    async fn record(&mut self, kind: OperationKind, accounts: &[AccountId]) -> SyncResult<usize> {
        let mut attempts = Attempts::new(kind, &self.config.retry, &self.shared);
        loop {
            attempts.begin().await;
            let result = self.state.update_pending(|pending| match kind {
                OperationKind::RecordDeletions => pending.mark_deleted(accounts),
                _ => pending.mark_updated(accounts),
            });
            match result {
                Ok(pending) => {
                    tracing::debug!(
                        %kind,
                        accounts = accounts.len(),
                        pending = pending.len(),
                        "recorded changes"
                    );
                    return Ok(accounts.len());
                }
                Err(error) => attempts.failed(error)?,
            }
        }
    }

    async fn backup(&mut self) -> SyncResult<BackupReport> {
        let mut attempts = Attempts::new(OperationKind::Backup, &self.config.retry, &self.shared);
        loop {
            attempts.begin().await;
            match self.backup_once().await {
                Ok(report) => return Ok(report),
                Err(error) => attempts.failed(error)?,
            }
        }
    }

    async fn backup_once(&mut self) -> SyncResult<BackupReport> {
        let snapshot = self.state.load()?;
        // Failure counts only advance once the remote accepts this plan.
        let mut failures = self.failures.clone();
        let BackupPlan {
            snapshot,
            manifest,
            records,
            deleted,
            failed,
            abandoned,
        } = plan_backup(snapshot, self.contacts.as_ref(), &mut failures)?;

        let pushed = records.len();
        let removed = deleted.len();
        let version = manifest.version();

        match self.remote.update_manifest(&manifest, records, deleted).await? {
            ManifestUpdate::Accepted => {
                self.state.commit(&snapshot)?;
                self.failures = failures;
                {
                    let mut stats = self.shared.stats.write();
                    stats.build_failures += (failed.len() + abandoned.len()) as u64;
                    stats.accounts_abandoned += abandoned.len() as u64;
                    stats.backups_committed += 1;
                    stats.records_pushed += pushed as u64;
                    stats.identifiers_deleted += removed as u64;
                }
                tracing::info!(%version, pushed, deleted = removed, "backup committed");
                Ok(BackupReport::Committed {
                    version,
                    pushed,
                    deleted: removed,
                    failed,
                    abandoned,
                })
            }
            ManifestUpdate::Conflict(current) if current.version() < version => {
                // Merging cannot advance past the local version, so a
                // follow-up would be rejected the same way.
                Err(SyncError::remote_fatal(format!(
                    "remote manifest {} is behind local state (candidate {version})",
                    current.version()
                )))
            }
            ManifestUpdate::Conflict(current) => {
                tracing::info!(
                    candidate = %version,
                    remote = %current.version(),
                    "backup conflicted, merging remote manifest"
                );
                let report = self.merge(current).await?;
                self.shared.stats.write().conflicts_merged += 1;
                self.enqueue_follow_up();
                Ok(BackupReport::Merged(report))
            }
        }
    }

    async fn restore(&mut self) -> SyncResult<RestoreReport> {
        let mut attempts = Attempts::new(OperationKind::Restore, &self.config.retry, &self.shared);
        loop {
            attempts.begin().await;
            match self.restore_once().await {
                Ok(report) => return Ok(report),
                Err(error) => attempts.failed(error)?,
            }
        }
    }

    async fn restore_once(&mut self) -> SyncResult<RestoreReport> {
        if let Some(version) = self.state.manifest_version()? {
            tracing::debug!(%version, "manifest already restored");
            return Ok(RestoreReport::AlreadyRestored(version));
        }

        let Some(manifest) = self.remote.fetch_manifest().await? else {
            tracing::info!("no remote manifest to restore");
            return Ok(RestoreReport::NoRemoteManifest);
        };

        let report = self.merge(manifest).await?;
        self.shared.stats.write().restores_merged += 1;
        Ok(RestoreReport::Merged(report))
    }

    async fn merge(&mut self, manifest: Manifest) -> SyncResult<MergeReport> {
        let records = self.remote.fetch_contacts(manifest.identifiers()).await?;

        let mut snapshot = self.state.load()?;
        let report = apply_merge(&mut snapshot, &manifest, records, self.contacts.as_ref());
        self.state.commit(&snapshot)?;

        tracing::info!(
            version = %report.version,
            resolved = report.resolved,
            needs_update = report.needs_update,
            invalid = report.invalid,
            missing = report.missing,
            "merged remote manifest"
        );
        Ok(report)
    }

    fn enqueue_follow_up(&self) {
        if let Some(queue) = self.queue.upgrade() {
            if queue.send(Envelope::Backup(None)).is_err() {
                tracing::debug!("queue closed, dropping follow-up backup");
            }
        }
    }
}

/// Entry point for starting a sync engine.
pub struct SyncEngine;

impl SyncEngine {
    /// Spawns the worker and returns a handle to it.
    ///
    /// `contacts` builds records for local accounts and merges remote
    /// records into them.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn spawn<R, C>(
        config: SyncConfig,
        store: Arc<KvStore>,
        remote: Arc<R>,
        contacts: Arc<C>,
    ) -> SyncHandle
    where
        R: RemoteStore,
        C: RecordBuilder + RecordMerger + 'static,
    {
        let runtime = Handle::current();
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(OperationState::Idle);

        let shared = Arc::new(Shared {
            stats: RwLock::new(SyncStats::default()),
            state: state_tx,
        });

        let worker = Worker {
            failures: BuildFailures::new(config.max_build_failures),
            config: config.clone(),
            state: SyncStateStore::new(store),
            remote,
            contacts,
            shared: Arc::clone(&shared),
            queue: tx.downgrade(),
        };
        let task = runtime.spawn(worker.run(rx));

        let timer_queue = tx.clone();
        let scheduler = BackupScheduler::new(config.backup_delay, runtime, move || {
            if timer_queue.send(Envelope::Backup(None)).is_err() {
                tracing::debug!("queue closed, dropping scheduled backup");
            }
        });

        SyncHandle {
            inner: Arc::new(HandleInner {
                queue: tx,
                scheduler,
                state: state_rx,
                shared,
                closed: AtomicBool::new(false),
                worker: Mutex::new(Some(task)),
            }),
        }
    }
}

struct HandleInner {
    queue: mpsc::UnboundedSender<Envelope>,
    scheduler: BackupScheduler,
    state: watch::Receiver<OperationState>,
    shared: Arc<Shared>,
    closed: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// A cloneable handle to a running sync engine.
///
/// Enqueueing never blocks and never fails; the returned ticket reports the
/// outcome.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<HandleInner>,
}

impl SyncHandle {
    fn enqueue<T>(&self, make: impl FnOnce(Responder<T>) -> Envelope) -> SyncTicket<T> {
        let (reply, rx) = oneshot::channel();
        if self.inner.closed.load(Ordering::SeqCst) {
            return SyncTicket { rx };
        }
        // A send error drops the responder, which resolves the ticket.
        let _ = self.inner.queue.send(make(reply));
        SyncTicket { rx }
    }

    /// Enqueues marking `accounts` as updated and arms the backup timer.
    ///
    /// A later deletion of the same account overrides this.
    pub fn record_pending_updates(
        &self,
        accounts: impl IntoIterator<Item = AccountId>,
    ) -> SyncTicket<usize> {
        let accounts: Vec<AccountId> = accounts.into_iter().collect();
        let ticket = self.enqueue(|reply| Envelope::RecordUpdates(accounts, reply));
        self.backup_pending_changes();
        ticket
    }

    /// Enqueues marking `accounts` as deleted and arms the backup timer.
    pub fn record_pending_deletions(
        &self,
        accounts: impl IntoIterator<Item = AccountId>,
    ) -> SyncTicket<usize> {
        let accounts: Vec<AccountId> = accounts.into_iter().collect();
        let ticket = self.enqueue(|reply| Envelope::RecordDeletions(accounts, reply));
        self.backup_pending_changes();
        ticket
    }

    /// Arms the debounced backup timer. Returns false if it was already
    /// armed or the engine is shut down.
    pub fn backup_pending_changes(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.scheduler.arm()
    }

    /// Returns true if a scheduled backup is pending.
    pub fn backup_scheduled(&self) -> bool {
        self.inner.scheduler.is_armed()
    }

    /// Enqueues a backup immediately.
    pub fn backup_now(&self) -> SyncTicket<BackupReport> {
        self.enqueue(|reply| Envelope::Backup(Some(reply)))
    }

    /// Enqueues a restore. It only contacts the remote if no manifest
    /// version has been recorded yet.
    pub fn restore_manifest_if_necessary(&self) -> SyncTicket<RestoreReport> {
        self.enqueue(Envelope::Restore)
    }

    /// Returns the current worker state.
    pub fn state(&self) -> OperationState {
        *self.inner.state.borrow()
    }

    /// Returns a receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.inner.state.clone()
    }

    /// Returns a copy of the current statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.shared.stats.read().clone()
    }

    /// Stops the engine.
    ///
    /// Units enqueued before this call still run; the call returns once the
    /// worker has exited. Units enqueued afterwards resolve to
    /// [`SyncError::EngineStopped`].
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.scheduler.clear();
        let _ = self.inner.queue.send(Envelope::Shutdown);

        let task = self.inner.worker.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::error!(%error, "sync worker panicked");
            }
        }
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandle")
            .field("state", &self.state())
            .field("scheduler", &self.inner.scheduler)
            .finish()
    }
}
