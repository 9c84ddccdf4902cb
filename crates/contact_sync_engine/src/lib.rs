//! # Contact Sync Engine
//!
//! Keeps a local contact collection consistent with a remote, versioned
//! manifest shared across a user's devices.
//!
//! This crate provides:
//! - Identifier map (local account to remote identifier bijection)
//! - Pending change set (local intent not yet pushed)
//! - Durable sync state over a [`contact_sync_storage::KvStore`]
//! - Backup planning and compare-and-swap push
//! - Per-record conflict resolution on manifest conflicts
//! - A serialized sync operation worker with retry and backoff
//! - A debounced backup scheduler
//!
//! ## Architecture
//!
//! All state mutation happens on one worker task. Callers enqueue units of
//! work through a [`SyncHandle`] and may await the returned ticket:
//!
//! 1. Record pending updates or deletions
//! 2. Back up: build records, bump the manifest version, push
//! 3. On conflict: fetch the remote manifest, merge it, back up again
//!
//! ## Key Invariants
//!
//! - The identifier map is a bijection
//! - The local manifest version never decreases
//! - A pending change is cleared only after the remote accepted it
//! - A failed attempt leaves durable state exactly as before

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod config;
mod contact_book;
mod error;
mod identifier_map;
mod merge;
mod operation;
mod pending;
mod persistence;
mod record;
mod remote;
mod scheduler;

pub use backup::{plan_backup, BackupPlan, BuildFailures};
pub use config::{RetryConfig, SyncConfig, DEFAULT_BACKUP_DELAY, DEFAULT_MAX_ATTEMPTS};
pub use contact_book::{LocalContact, MemoryContactBook};
pub use error::{SyncError, SyncResult};
pub use identifier_map::{IdentifierMap, ResolvedIdentifier};
pub use merge::{apply_merge, MergeReport};
pub use operation::{
    BackupReport, OperationKind, OperationState, RestoreReport, SyncEngine, SyncHandle, SyncStats,
    SyncTicket,
};
pub use pending::PendingChangeSet;
pub use persistence::{
    SyncSnapshot, SyncStateStore, CHANGE_MAP_KEY, IDENTIFIER_MAP_KEY, MANIFEST_VERSION_KEY,
    SYNC_COLLECTION,
};
pub use record::{MergeOutcome, RecordBuilder, RecordMerger};
pub use remote::{ManifestUpdate, MemoryRemoteStore, RemoteCalls, RemoteStore};
pub use scheduler::BackupScheduler;
