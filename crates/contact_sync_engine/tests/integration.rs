//! Integration tests for the sync engine against in-memory collaborators.

use contact_sync_engine::{
    BackupReport, LocalContact, MemoryContactBook, MemoryRemoteStore, OperationState,
    RestoreReport, RetryConfig, SyncConfig, SyncEngine, SyncError, SyncHandle, SyncSnapshot,
    SyncStateStore,
};
use contact_sync_protocol::{
    AccountId, ChangeState, ContactIdentifier, ContactRecord, Manifest, ManifestVersion,
};
use contact_sync_storage::{FileBackend, InMemoryBackend, KvStore};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    handle: SyncHandle,
    kv: Arc<KvStore>,
    remote: Arc<MemoryRemoteStore>,
    book: Arc<MemoryContactBook>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SyncConfig::new())
    }

    fn with_config(config: SyncConfig) -> Self {
        Self::with(
            config,
            Arc::new(KvStore::in_memory()),
            Arc::new(MemoryRemoteStore::new()),
        )
    }

    fn with(config: SyncConfig, kv: Arc<KvStore>, remote: Arc<MemoryRemoteStore>) -> Self {
        let book = Arc::new(MemoryContactBook::new());
        for n in 1..=5 {
            book.upsert(format!("a{n}"), LocalContact::with_service_id(format!("svc-{n}")));
        }

        let handle = SyncEngine::spawn(
            config,
            Arc::clone(&kv),
            Arc::clone(&remote),
            Arc::clone(&book),
        );
        Self {
            handle,
            kv,
            remote,
            book,
        }
    }

    fn snapshot(&self) -> SyncSnapshot {
        SyncStateStore::new(Arc::clone(&self.kv)).load().unwrap()
    }

    async fn record_updates(&self, names: &[&str]) {
        self.handle
            .record_pending_updates(names.iter().map(|n| AccountId::new(*n)))
            .wait()
            .await
            .unwrap();
    }

    async fn backup(&self) -> BackupReport {
        self.handle.backup_now().wait().await.unwrap()
    }
}

fn account(name: &str) -> AccountId {
    AccountId::new(name)
}

#[tokio::test(start_paused = true)]
async fn update_is_committed() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    assert_eq!(h.snapshot().pending.state_of(&account("a1")), ChangeState::Updated);

    let report = h.backup().await;
    assert!(matches!(
        report,
        BackupReport::Committed { pushed: 1, deleted: 0, .. }
    ));

    let snapshot = h.snapshot();
    assert!(snapshot.pending.is_empty());
    let identifier = snapshot.identifier_map.identifier_for(&account("a1")).unwrap();
    assert_eq!(snapshot.version, Some(ManifestVersion::new(1)));

    let record = h.remote.record(&identifier).unwrap();
    assert_eq!(record.service_id.as_deref(), Some("svc-1"));
    assert_eq!(h.remote.manifest().unwrap().identifiers(), &[identifier]);

    // a second update bumps the version by exactly one
    h.record_updates(&["a1"]).await;
    h.backup().await;
    assert_eq!(h.snapshot().version, Some(ManifestVersion::new(2)));
    assert_eq!(
        h.snapshot().identifier_map.identifier_for(&account("a1")),
        Some(identifier)
    );
}

#[tokio::test(start_paused = true)]
async fn deleting_unsynced_account_issues_no_remote_deletion() {
    let h = Harness::new();
    h.handle
        .record_pending_deletions([account("a2")])
        .wait()
        .await
        .unwrap();

    let report = h.backup().await;
    assert!(matches!(report, BackupReport::Committed { deleted: 0, .. }));
    assert_eq!(h.snapshot().pending.state_of(&account("a2")), ChangeState::Unchanged);
}

#[tokio::test(start_paused = true)]
async fn deleting_synced_account_removes_remote_record() {
    let h = Harness::new();
    h.record_updates(&["a1", "a2"]).await;
    h.backup().await;
    let identifier = h.snapshot().identifier_map.identifier_for(&account("a2")).unwrap();

    h.handle
        .record_pending_deletions([account("a2")])
        .wait()
        .await
        .unwrap();
    let report = h.backup().await;

    assert!(matches!(report, BackupReport::Committed { deleted: 1, .. }));
    assert!(h.remote.record(&identifier).is_none());
    assert!(!h.remote.manifest().unwrap().contains(&identifier));
    assert_eq!(h.snapshot().identifier_map.identifier_for(&account("a2")), None);
    assert_eq!(h.handle.stats().identifiers_deleted, 1);
}

#[tokio::test(start_paused = true)]
async fn deletion_overrides_earlier_update() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    h.handle
        .record_pending_deletions([account("a1")])
        .wait()
        .await
        .unwrap();

    assert_eq!(h.snapshot().pending.state_of(&account("a1")), ChangeState::Deleted);
    let report = h.backup().await;
    assert!(matches!(report, BackupReport::Committed { pushed: 0, .. }));
    assert!(h.remote.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn conflict_merges_newer_manifest_and_backs_up_again() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    h.backup().await;
    let a1 = h.snapshot().identifier_map.identifier_for(&account("a1")).unwrap();

    // another device writes version 3 with a contact we have never seen
    let foreign = ContactIdentifier::from_bytes([0xAB; 16]);
    h.remote.install(
        Manifest::builder(ManifestVersion::new(3))
            .identifiers([a1, foreign])
            .build()
            .unwrap(),
        vec![
            ContactRecord::new(a1).with_service_id("svc-1"),
            ContactRecord::new(foreign)
                .with_service_id("svc-9")
                .with_names("Grace", None),
        ],
    );

    h.record_updates(&["a2"]).await;
    let calls_before = h.remote.calls();
    let report = h.backup().await;

    let BackupReport::Merged(merge) = report else {
        panic!("expected a merge, got {report:?}");
    };
    assert_eq!(merge.version, ManifestVersion::new(3));
    assert_eq!(merge.resolved, 2);
    assert_eq!(h.remote.calls().fetch_contacts, calls_before.fetch_contacts + 1);

    let snapshot = h.snapshot();
    assert_eq!(snapshot.version, Some(ManifestVersion::new(3)));
    assert_eq!(
        snapshot.identifier_map.account_for(&foreign),
        Some(&account("svc-9"))
    );
    assert_eq!(snapshot.pending.state_of(&account("a2")), ChangeState::Updated);
    assert!(h.book.contact(&account("svc-9")).is_some());

    // the follow-up backup was queued first and pushes a2
    h.backup().await;
    let snapshot = h.snapshot();
    assert!(snapshot.pending.is_empty());
    assert_eq!(snapshot.version, Some(ManifestVersion::new(5)));

    let manifest = h.remote.manifest().unwrap();
    assert_eq!(manifest.len(), 3);
    let a2 = snapshot.identifier_map.identifier_for(&account("a2")).unwrap();
    assert!(manifest.contains(&a1) && manifest.contains(&a2) && manifest.contains(&foreign));
    assert_eq!(h.handle.stats().conflicts_merged, 1);
}

#[tokio::test(start_paused = true)]
async fn restore_is_skipped_once_version_is_known() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    h.backup().await;

    let before = h.remote.calls();
    let report = h.handle.restore_manifest_if_necessary().wait().await.unwrap();

    assert_eq!(report, RestoreReport::AlreadyRestored(ManifestVersion::new(1)));
    assert_eq!(h.remote.calls(), before);
}

#[tokio::test(start_paused = true)]
async fn restore_merges_remote_manifest() {
    let remote = Arc::new(MemoryRemoteStore::new());
    let identifier = ContactIdentifier::from_bytes([7; 16]);
    remote.install(
        Manifest::builder(ManifestVersion::new(8))
            .identifier(identifier)
            .build()
            .unwrap(),
        vec![ContactRecord::new(identifier).with_service_id("svc-3")],
    );

    let h = Harness::with(SyncConfig::new(), Arc::new(KvStore::in_memory()), remote);
    let report = h.handle.restore_manifest_if_necessary().wait().await.unwrap();

    assert!(matches!(report, RestoreReport::Merged(merge) if merge.resolved == 1));
    let snapshot = h.snapshot();
    assert_eq!(snapshot.version, Some(ManifestVersion::new(8)));
    assert_eq!(snapshot.identifier_map.identifier_for(&account("a3")), Some(identifier));
    assert!(snapshot.pending.is_empty());

    // restoring from an empty remote leaves the version unset
    let empty = Harness::new();
    let report = empty.handle.restore_manifest_if_necessary().wait().await.unwrap();
    assert_eq!(report, RestoreReport::NoRemoteManifest);
    assert_eq!(empty.snapshot().version, None);
}

#[tokio::test(start_paused = true)]
async fn build_failure_is_isolated_to_one_account() {
    let h = Harness::new();
    h.book.fail_builds_for("a3");
    h.record_updates(&["a3", "a4"]).await;

    let report = h.backup().await;
    let BackupReport::Committed { pushed, failed, .. } = report else {
        panic!("expected a commit, got {report:?}");
    };
    assert_eq!(pushed, 1);
    assert_eq!(failed, vec![account("a3")]);

    let snapshot = h.snapshot();
    assert_eq!(snapshot.pending.state_of(&account("a3")), ChangeState::Updated);
    assert_eq!(snapshot.pending.state_of(&account("a4")), ChangeState::Unchanged);
    assert_eq!(snapshot.identifier_map.identifier_for(&account("a3")), None);
    let a4 = snapshot.identifier_map.identifier_for(&account("a4")).unwrap();
    assert_eq!(h.remote.manifest().unwrap().identifiers(), &[a4]);

    // the next backup picks a3 up once it builds again
    h.book.heal(&account("a3"));
    h.backup().await;
    assert!(h.snapshot().pending.is_empty());
    assert_eq!(h.snapshot().identifier_map.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn build_failure_ceiling_abandons_account() {
    let config = SyncConfig::new().with_max_build_failures(2);
    let h = Harness::with_config(config);
    h.book.fail_builds_for("a3");
    h.record_updates(&["a3"]).await;

    h.backup().await;
    assert_eq!(h.snapshot().pending.state_of(&account("a3")), ChangeState::Updated);

    let report = h.backup().await;
    assert!(matches!(
        report,
        BackupReport::Committed { ref abandoned, .. } if abandoned == &vec![account("a3")]
    ));
    assert!(h.snapshot().pending.is_empty());
    assert_eq!(h.handle.stats().accounts_abandoned, 1);
}

#[tokio::test(start_paused = true)]
async fn lost_acknowledgement_converges_without_duplicates() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    h.remote.lose_next_ack();

    // the retry sees its own write as a conflict and merges it
    let report = h.backup().await;
    assert!(matches!(report, BackupReport::Merged(_)));
    let after_merge = h.snapshot();
    assert_eq!(after_merge.pending.state_of(&account("a1")), ChangeState::Updated);

    h.backup().await;
    let snapshot = h.snapshot();
    assert!(snapshot.pending.is_empty());

    let identifier = snapshot.identifier_map.identifier_for(&account("a1")).unwrap();
    let records = h.remote.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].identifier, identifier);
    assert_eq!(h.handle.stats().retries, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_local_commit_keeps_pending_changes() {
    let backend = Arc::new(InMemoryBackend::new());
    let kv = Arc::new(KvStore::open(Arc::clone(&backend)).unwrap());
    let config = SyncConfig::new().with_retry(RetryConfig::no_retry());
    let h = Harness::with(config, Arc::clone(&kv), Arc::new(MemoryRemoteStore::new()));

    h.record_updates(&["a1"]).await;
    let before = h.snapshot();

    backend.reject_next_persists(1);
    let err = h.handle.backup_now().wait().await.unwrap_err();
    assert!(err.to_string().contains("backup failed after 1 attempts"));
    assert_eq!(h.snapshot(), before);

    // the remote already has version 1, so the next backup merges it
    assert!(matches!(h.backup().await, BackupReport::Merged(_)));
    h.backup().await;
    assert!(h.snapshot().pending.is_empty());
    assert_eq!(h.remote.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn version_never_decreases() {
    let h = Harness::new();
    let mut last = 0;
    for round in 0..4 {
        h.record_updates(&["a1", "a2"]).await;
        if round == 2 {
            h.remote.fail_next(1);
        }
        h.backup().await;
        let version = h.snapshot().version.unwrap().get();
        assert!(version > last);
        last = version;
    }
    assert_eq!(h.remote.version(), Some(ManifestVersion::new(last)));
}

#[tokio::test(start_paused = true)]
async fn conflict_with_older_manifest_fails_without_looping() {
    let h = Harness::new();
    for _ in 0..5 {
        h.record_updates(&["a1"]).await;
        h.backup().await;
    }
    let a1 = h.snapshot().identifier_map.identifier_for(&account("a1")).unwrap();
    assert_eq!(h.snapshot().version, Some(ManifestVersion::new(5)));

    // the remote was rolled back to an older manifest
    h.remote.install(
        Manifest::builder(ManifestVersion::new(2))
            .identifier(a1)
            .build()
            .unwrap(),
        vec![ContactRecord::new(a1).with_service_id("svc-1")],
    );
    h.record_updates(&["a1"]).await;
    let before = h.remote.calls();

    let err = h.handle.backup_now().wait().await.unwrap_err();
    assert!(matches!(err, SyncError::Remote { retryable: false, .. }));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.remote.calls().total(), before.total() + 1);
    assert_eq!(h.remote.version(), Some(ManifestVersion::new(2)));

    let snapshot = h.snapshot();
    assert_eq!(snapshot.version, Some(ManifestVersion::new(5)));
    assert_eq!(snapshot.pending.state_of(&account("a1")), ChangeState::Updated);
    assert_eq!(h.handle.stats().conflicts_merged, 0);
}

#[tokio::test(start_paused = true)]
async fn conflict_at_candidate_version_is_merged_once() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    h.backup().await;
    let a1 = h.snapshot().identifier_map.identifier_for(&account("a1")).unwrap();

    // another device already wrote the version we are about to propose
    let foreign = ContactIdentifier::from_bytes([0xCD; 16]);
    h.remote.install(
        Manifest::builder(ManifestVersion::new(2))
            .identifiers([a1, foreign])
            .build()
            .unwrap(),
        vec![
            ContactRecord::new(a1).with_service_id("svc-1"),
            ContactRecord::new(foreign).with_service_id("svc-4"),
        ],
    );
    h.remote.add_stray_records(vec![
        ContactRecord::new(ContactIdentifier::from_bytes([0xEE; 16])).with_service_id("svc-5"),
    ]);

    h.record_updates(&["a2"]).await;
    let BackupReport::Merged(merge) = h.backup().await else {
        panic!("expected a merge");
    };
    assert_eq!(merge.version, ManifestVersion::new(2));
    assert_eq!(merge.resolved, 2);
    assert_eq!(merge.ignored, 1);

    let snapshot = h.snapshot();
    assert_eq!(snapshot.identifier_map.identifier_for(&account("a4")), Some(foreign));
    assert_eq!(snapshot.identifier_map.identifier_for(&account("a5")), None);

    // the queued follow-up commits on top of the merged manifest
    h.backup().await;
    assert!(h.snapshot().pending.is_empty());
    assert_eq!(h.remote.manifest().unwrap().len(), 3);
    assert_eq!(h.handle.stats().conflicts_merged, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_merge_fetch_is_retried_without_touching_state() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;
    h.backup().await;
    let a1 = h.snapshot().identifier_map.identifier_for(&account("a1")).unwrap();

    h.remote.install(
        Manifest::builder(ManifestVersion::new(3))
            .identifier(a1)
            .build()
            .unwrap(),
        vec![ContactRecord::new(a1).with_service_id("svc-1")],
    );
    h.record_updates(&["a2"]).await;
    let committed = h.kv.snapshot();
    let before = h.remote.calls();

    h.remote.set_latency(Some(Duration::from_secs(1)));
    let backup = h.handle.backup_now();

    // the conflict is back and the record fetch is in flight
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.remote.calls().fetch_contacts, before.fetch_contacts + 1);
    h.remote.fail_next(1);

    // the fetch failed and the unit waits out its backoff
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        h.handle.state(),
        OperationState::Retrying { attempt: 2, .. }
    ));
    assert_eq!(h.kv.snapshot(), committed);

    let report = backup.wait().await.unwrap();
    assert!(matches!(
        report,
        BackupReport::Merged(merge) if merge.version == ManifestVersion::new(3)
    ));
    assert_eq!(h.remote.calls().fetch_contacts, before.fetch_contacts + 2);
    assert_eq!(h.handle.stats().retries, 1);
    assert_eq!(h.snapshot().pending.state_of(&account("a2")), ChangeState::Updated);
}

#[tokio::test(start_paused = true)]
async fn change_recorded_during_backup_is_kept() {
    let h = Harness::new();
    h.record_updates(&["a1"]).await;

    h.remote.set_latency(Some(Duration::from_secs(1)));
    let backup = h.handle.backup_now();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.remote.calls().update_manifest, 1);

    let recorded = h.handle.record_pending_updates([account("a2")]);
    let report = backup.wait().await.unwrap();
    assert!(matches!(report, BackupReport::Committed { pushed: 1, .. }));
    recorded.wait().await.unwrap();

    let snapshot = h.snapshot();
    assert_eq!(snapshot.pending.state_of(&account("a1")), ChangeState::Unchanged);
    assert_eq!(snapshot.pending.state_of(&account("a2")), ChangeState::Updated);
    assert_eq!(snapshot.identifier_map.identifier_for(&account("a2")), None);
}

#[tokio::test(start_paused = true)]
async fn transient_errors_do_not_count_as_build_failures() {
    let h = Harness::with_config(SyncConfig::new().with_max_build_failures(3));
    h.book.fail_builds_for("a3");
    h.record_updates(&["a3"]).await;
    h.remote.fail_next(2);

    let report = h.backup().await;
    let BackupReport::Committed {
        failed, abandoned, ..
    } = report
    else {
        panic!("expected a commit, got {report:?}");
    };
    assert_eq!(failed, vec![account("a3")]);
    assert!(abandoned.is_empty());
    assert_eq!(h.snapshot().pending.state_of(&account("a3")), ChangeState::Updated);

    let stats = h.handle.stats();
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.build_failures, 1);
    assert_eq!(stats.accounts_abandoned, 0);

    // two more committed backups reach the ceiling
    h.backup().await;
    let report = h.backup().await;
    assert!(matches!(
        report,
        BackupReport::Committed { ref abandoned, .. } if abandoned == &vec![account("a3")]
    ));
}

#[tokio::test(start_paused = true)]
async fn retries_use_backoff() {
    let config = SyncConfig::new().with_retry(RetryConfig::new(4).without_jitter());
    let h = Harness::with_config(config);
    h.record_updates(&["a1"]).await;
    h.remote.fail_next(3);

    let start = tokio::time::Instant::now();
    h.backup().await;
    // 1s + 2s + 4s
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_secs(8));
    assert_eq!(h.remote.calls().update_manifest, 4);
}

#[tokio::test(start_paused = true)]
async fn state_is_observable() {
    let h = Harness::new();
    let mut states = h.handle.subscribe();
    assert_eq!(*states.borrow(), OperationState::Idle);

    h.record_updates(&["a1"]).await;
    states.changed().await.unwrap();
    assert!(!h.handle.state().is_active());
}

#[tokio::test(start_paused = true)]
async fn scheduled_backup_is_coalesced() {
    let config = SyncConfig::new().with_backup_delay(Duration::from_secs(600));
    let h = Harness::with_config(config);

    h.record_updates(&["a1"]).await;
    h.record_updates(&["a2"]).await;
    assert!(!h.handle.backup_pending_changes());
    assert!(h.handle.backup_scheduled());

    tokio::time::sleep(Duration::from_secs(601)).await;
    // drain the queue behind the scheduled backup
    h.handle.restore_manifest_if_necessary().wait().await.unwrap();

    assert_eq!(h.remote.calls().update_manifest, 1);
    assert!(h.snapshot().pending.is_empty());
    assert!(!h.handle.backup_scheduled());
}

#[tokio::test(start_paused = true)]
async fn state_survives_restart_with_file_backend() {
    let dir = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryRemoteStore::new());

    {
        let kv = Arc::new(KvStore::open(FileBackend::open(dir.path()).unwrap()).unwrap());
        let h = Harness::with(SyncConfig::new(), kv, Arc::clone(&remote));
        h.record_updates(&["a1"]).await;
        h.backup().await;
        h.record_updates(&["a2"]).await;
        h.handle.shutdown().await;
    }

    let kv = Arc::new(KvStore::open(FileBackend::open(dir.path()).unwrap()).unwrap());
    let h = Harness::with(SyncConfig::new(), Arc::clone(&kv), remote);
    let snapshot = h.snapshot();
    assert_eq!(snapshot.version, Some(ManifestVersion::new(1)));
    assert!(snapshot.identifier_map.identifier_for(&account("a1")).is_some());
    assert_eq!(snapshot.pending.state_of(&account("a2")), ChangeState::Updated);

    h.backup().await;
    assert!(h.snapshot().pending.is_empty());
    assert_eq!(h.remote.version(), Some(ManifestVersion::new(2)));
}

#[tokio::test(start_paused = true)]
async fn work_queued_before_shutdown_still_runs() {
    let h = Harness::new();
    let update = h.handle.record_pending_updates([account("a1")]);
    let backup = h.handle.backup_now();
    h.handle.shutdown().await;

    assert_eq!(update.wait().await.unwrap(), 1);
    assert!(matches!(backup.wait().await.unwrap(), BackupReport::Committed { .. }));
    assert!(h
        .handle
        .record_pending_updates([account("a2")])
        .wait()
        .await
        .is_err());
    assert_eq!(h.snapshot().pending.state_of(&account("a2")), ChangeState::Unchanged);
}
