//! Inspect command implementation.

use super::open_state;
use contact_sync_engine::SyncSnapshot;
use contact_sync_protocol::ChangeState;
use serde::Serialize;
use std::path::Path;

/// Sync state inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// State directory path.
    pub path: String,
    /// Last observed manifest version, if any.
    pub manifest_version: Option<u64>,
    /// Synced accounts and their remote identifiers.
    pub identifiers: Vec<MappedAccount>,
    /// Changes not yet backed up.
    pub pending: Vec<PendingEntry>,
}

/// One identifier map entry.
#[derive(Debug, Serialize)]
pub struct MappedAccount {
    /// Local account.
    pub account: String,
    /// Remote identifier as hex.
    pub identifier: String,
}

/// One pending change.
#[derive(Debug, Serialize)]
pub struct PendingEntry {
    /// Local account.
    pub account: String,
    /// `updated` or `deleted`.
    pub state: &'static str,
}

impl InspectResult {
    /// Summarizes a loaded snapshot.
    pub fn from_snapshot(path: &Path, snapshot: &SyncSnapshot) -> Self {
        Self {
            path: path.display().to_string(),
            manifest_version: snapshot.version.map(|v| v.get()),
            identifiers: snapshot
                .identifier_map
                .iter()
                .map(|(account, identifier)| MappedAccount {
                    account: account.to_string(),
                    identifier: identifier.to_string(),
                })
                .collect(),
            pending: snapshot
                .pending
                .iter()
                .map(|(account, state)| PendingEntry {
                    account: account.to_string(),
                    state: state_name(state),
                })
                .collect(),
        }
    }
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = open_state(path)?.load()?;
    let result = InspectResult::from_snapshot(path, &snapshot);

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn state_name(state: ChangeState) -> &'static str {
    match state {
        ChangeState::Unchanged => "unchanged",
        ChangeState::Updated => "updated",
        ChangeState::Deleted => "deleted",
    }
}

fn print_text_output(result: &InspectResult) {
    println!("Contact Sync State");
    println!("==================");
    println!();
    println!("Path: {}", result.path);
    match result.manifest_version {
        Some(version) => println!("Manifest version: {}", version),
        None => println!("Manifest version: (never synced)"),
    }
    println!();
    println!("Identifiers ({}):", result.identifiers.len());
    for entry in &result.identifiers {
        println!("  {} -> {}", entry.account, entry.identifier);
    }
    println!();
    println!("Pending changes ({}):", result.pending.len());
    for entry in &result.pending {
        println!("  {} {}", entry.state, entry.account);
    }
}
