//! CLI command implementations.

pub mod inspect;
pub mod verify;

use contact_sync_engine::SyncStateStore;
use contact_sync_storage::{FileBackend, KvStore};
use std::path::Path;
use std::sync::Arc;

/// Opens the sync state stored in `path`.
///
/// Fails if the directory has no state file or another process holds it.
pub fn open_state(path: &Path) -> Result<SyncStateStore, Box<dyn std::error::Error>> {
    if !path.join("STATE").exists() {
        return Err(format!("No sync state found at {:?}", path).into());
    }

    let backend = FileBackend::open(path)?;
    tracing::debug!(state = ?backend.state_path(), "opened sync state");
    Ok(SyncStateStore::new(Arc::new(KvStore::open(backend)?)))
}
