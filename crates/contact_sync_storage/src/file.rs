//! File-based storage backend for persistent storage.
//!
//! The backend owns a directory with the following layout:
//!
//! ```text
//! <dir>/
//! ├─ LOCK        # Advisory lock for single-writer
//! └─ STATE       # Last committed image (CBOR)
//! ```

use crate::backend::KvBackend;
use crate::error::{StorageError, StorageResult};
use crate::image::KvImage;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "STATE";
const STATE_TEMP: &str = "STATE.tmp";

/// A file-based storage backend.
///
/// This backend provides persistent storage using OS file APIs.
/// Data survives process restarts.
///
/// # Durability
///
/// Every `persist` uses the write-then-rename pattern:
/// 1. Write the image to a temporary file
/// 2. Sync the temporary file to disk
/// 3. Rename it over `STATE`
/// 4. Fsync the directory so the rename itself is durable
///
/// # Thread Safety
///
/// The backend holds an exclusive lock on its directory for its whole
/// lifetime; a second `open` on the same directory (from this or another
/// process) fails with [`StorageError::Locked`].
///
/// # Example
///
/// ```no_run
/// use contact_sync_storage::{FileBackend, KvStore};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("sync-state")).unwrap();
/// let store = KvStore::open(backend).unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    _lock_file: File,
    write_guard: Mutex<()>,
}

impl FileBackend {
    /// Opens or creates a backend directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another process holds the lock (returns `Locked`)
    /// - I/O errors occur
    pub fn open(path: &Path) -> StorageResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        if !path.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("path is not a directory: {}", path.display()),
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
            write_guard: Mutex::new(()),
        })
    }

    /// Returns the backend directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the committed image file.
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.path.join(STATE_FILE)
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        let dir = File::open(&self.path)?;
        dir.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        // NTFS journaling covers rename durability
        Ok(())
    }
}

impl KvBackend for FileBackend {
    fn load(&self) -> StorageResult<KvImage> {
        let state_path = self.state_path();
        if !state_path.exists() {
            return Ok(KvImage::new());
        }

        let mut data = Vec::new();
        File::open(&state_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(KvImage::new());
        }

        KvImage::decode(&data)
    }

    fn persist(&self, image: &KvImage) -> StorageResult<()> {
        let _guard = self.write_guard.lock();
        let data = image.encode()?;

        let temp_path = self.path.join(STATE_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.state_path())?;
        self.sync_directory()?;

        tracing::trace!(bytes = data.len(), path = %self.path.display(), "persisted image");
        Ok(())
    }
}
