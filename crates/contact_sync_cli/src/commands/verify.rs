//! Verify command implementation.

use super::open_state;
use std::path::Path;

/// Runs the verify command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Verifying sync state at {:?}", path);
    println!();

    let store = open_state(path)?;
    let problems = store.verify()?;

    if problems.is_empty() {
        let snapshot = store.load()?;
        println!(
            "  {} identifiers, {} pending changes",
            snapshot.identifier_map.len(),
            snapshot.pending.len()
        );
        println!();
        println!("✓ Sync state verification passed");
        Ok(())
    } else {
        for problem in &problems {
            println!("  ERROR: {}", problem);
        }
        println!();
        println!("✗ Sync state verification failed");
        Err(format!("{} problems found", problems.len()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contact_sync_engine::SyncSnapshot;
    use contact_sync_protocol::{AccountId, ChangeState, ManifestVersion};

    #[test]
    fn verifies_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = contact_sync_storage::FileBackend::open(dir.path()).unwrap();
            let kv = std::sync::Arc::new(contact_sync_storage::KvStore::open(backend).unwrap());
            let store = contact_sync_engine::SyncStateStore::new(kv);
            let mut snapshot = SyncSnapshot::default();
            snapshot.pending.set(AccountId::new("a1"), ChangeState::Updated);
            snapshot.version = Some(ManifestVersion::new(1));
            store.commit(&snapshot).unwrap();
        }

        assert!(run(dir.path()).is_ok());
    }

    #[test]
    fn missing_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(run(dir.path()).is_err());
    }
}
