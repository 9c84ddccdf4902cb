//! Merging a remote manifest into local state.

use crate::persistence::SyncSnapshot;
use crate::record::{MergeOutcome, RecordMerger};
use contact_sync_protocol::{
    ChangeState, ContactIdentifier, ContactRecord, Manifest, ManifestVersion,
};
use std::collections::BTreeSet;

/// Summary of one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Version stored after the merge.
    pub version: ManifestVersion,
    /// Records mapped to a local account.
    pub resolved: usize,
    /// Accounts whose local state must be pushed again.
    pub needs_update: usize,
    /// Records the merger rejected.
    pub invalid: usize,
    /// Manifest identifiers the remote returned no record for.
    pub missing: usize,
    /// Records not listed in the manifest, or listed twice.
    pub ignored: usize,
}

/// Applies `manifest` and its fetched `records` to `snapshot`.
///
/// Each listed identifier is merged at most once. The stored version
/// becomes the larger of the local and manifest versions. Local mappings
/// the manifest does not mention are kept.
pub fn apply_merge<M>(
    snapshot: &mut SyncSnapshot,
    manifest: &Manifest,
    records: Vec<ContactRecord>,
    merger: &M,
) -> MergeReport
where
    M: RecordMerger + ?Sized,
{
    let mut report = MergeReport::default();
    let mut seen: BTreeSet<ContactIdentifier> = BTreeSet::new();

    for record in records {
        if !manifest.contains(&record.identifier) || !seen.insert(record.identifier) {
            tracing::debug!(
                identifier = %record.identifier,
                "ignoring unlisted or duplicate record"
            );
            report.ignored += 1;
            continue;
        }

        match merger.merge_with_existing(&record) {
            MergeOutcome::Invalid => report.invalid += 1,
            MergeOutcome::NeedsUpdate(account) => {
                snapshot.pending.set(account, ChangeState::Updated);
                report.needs_update += 1;
            }
            MergeOutcome::Resolved(account) => {
                snapshot.identifier_map.insert(account, record.identifier);
                report.resolved += 1;
            }
        }
    }

    report.missing = manifest.len() - seen.len();
    if report.missing > 0 {
        tracing::warn!(
            missing = report.missing,
            version = %manifest.version(),
            "manifest lists identifiers without records"
        );
    }

    let version = match snapshot.version {
        Some(local) if local > manifest.version() => {
            tracing::warn!(
                %local,
                remote = %manifest.version(),
                "remote manifest is older than local state"
            );
            local
        }
        _ => manifest.version(),
    };
    snapshot.version = Some(version);
    report.version = version;

    report
}
