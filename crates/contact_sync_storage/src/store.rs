//! Transactional key-value store.

use crate::backend::KvBackend;
use crate::error::{StorageError, StorageResult};
use crate::image::KvImage;
use crate::memory::InMemoryBackend;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;

/// A key-value store with snapshot-isolated transactions.
///
/// # Semantics
///
/// - A read transaction sees the image committed when it began, no matter
///   how many writes commit while it is open.
/// - Write transactions are serialized. Each one starts from the latest
///   committed image and its changes become visible (and durable) only if
///   the closure returns `Ok` and the backend persists the new image.
/// - If the closure fails, or the backend fails to persist, nothing changes.
///
/// # Example
///
/// ```rust
/// use contact_sync_storage::{KvStore, StorageError};
///
/// let store = KvStore::in_memory();
/// store
///     .write(|txn| {
///         txn.set_u64("sync", "version", 4);
///         Ok::<_, StorageError>(())
///     })
///     .unwrap();
///
/// let version = store.read(|txn| txn.get_u64("sync", "version")).unwrap();
/// assert_eq!(version, Some(4));
/// ```
pub struct KvStore {
    backend: Box<dyn KvBackend>,
    committed: RwLock<Arc<KvImage>>,
    writer: Mutex<()>,
}

impl KvStore {
    /// Opens a store over a backend, loading its last committed image.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot load its image.
    pub fn open(backend: impl KvBackend + 'static) -> StorageResult<Self> {
        let image = backend.load()?;
        tracing::debug!(values = image.len(), "opened key-value store");
        Ok(Self {
            backend: Box::new(backend),
            committed: RwLock::new(Arc::new(image)),
            writer: Mutex::new(()),
        })
    }

    /// Creates an empty store backed by memory.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            backend: Box::new(InMemoryBackend::new()),
            committed: RwLock::new(Arc::new(KvImage::new())),
            writer: Mutex::new(()),
        }
    }

    /// Runs `f` inside a read transaction.
    pub fn read<R, E>(&self, f: impl FnOnce(&ReadTransaction) -> Result<R, E>) -> Result<R, E> {
        let txn = ReadTransaction {
            image: Arc::clone(&self.committed.read()),
        };
        f(&txn)
    }

    /// Runs `f` inside a write transaction and commits on success.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a storage error if the new image
    /// could not be persisted. In both cases the committed image is
    /// unchanged.
    pub fn write<R, E>(
        &self,
        f: impl FnOnce(&mut WriteTransaction) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StorageError>,
    {
        let _writer = self.writer.lock();
        let base = Arc::clone(&self.committed.read());

        let mut txn = WriteTransaction {
            image: KvImage::clone(&base),
            dirty: false,
        };
        let result = f(&mut txn)?;

        if txn.dirty {
            self.backend.persist(&txn.image)?;
            *self.committed.write() = Arc::new(txn.image);
        }

        Ok(result)
    }

    /// Returns a copy of the committed image.
    #[must_use]
    pub fn snapshot(&self) -> KvImage {
        KvImage::clone(&self.committed.read())
    }
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore")
            .field("values", &self.committed.read().len())
            .finish_non_exhaustive()
    }
}

/// A read-only view of one committed image.
#[derive(Debug)]
pub struct ReadTransaction {
    image: Arc<KvImage>,
}

impl ReadTransaction {
    /// Returns the raw value stored under `collection`/`key`.
    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<&[u8]> {
        self.image.get(collection, key)
    }

    /// Returns a `u64` value.
    ///
    /// # Errors
    ///
    /// Returns an error if a value exists but is not 8 bytes.
    pub fn get_u64(&self, collection: &str, key: &str) -> StorageResult<Option<u64>> {
        decode_u64(collection, key, self.get(collection, key))
    }

    /// Returns the keys of a collection.
    pub fn keys(&self, collection: &str) -> impl Iterator<Item = &str> {
        self.image.keys(collection)
    }
}

/// A pending set of changes to the store.
#[derive(Debug)]
pub struct WriteTransaction {
    image: KvImage,
    dirty: bool,
}

impl WriteTransaction {
    /// Returns the value stored under `collection`/`key`, including
    /// uncommitted writes from this transaction.
    #[must_use]
    pub fn get(&self, collection: &str, key: &str) -> Option<&[u8]> {
        self.image.get(collection, key)
    }

    /// Returns a `u64` value.
    ///
    /// # Errors
    ///
    /// Returns an error if a value exists but is not 8 bytes.
    pub fn get_u64(&self, collection: &str, key: &str) -> StorageResult<Option<u64>> {
        decode_u64(collection, key, self.get(collection, key))
    }

    /// Stores a raw value.
    pub fn set(&mut self, collection: &str, key: &str, value: Vec<u8>) {
        self.image.insert(collection, key, value);
        self.dirty = true;
    }

    /// Stores a `u64` value (little-endian).
    pub fn set_u64(&mut self, collection: &str, key: &str, value: u64) {
        self.set(collection, key, value.to_le_bytes().to_vec());
    }

    /// Removes a value. Returns true if one was present.
    pub fn remove(&mut self, collection: &str, key: &str) -> bool {
        let removed = self.image.remove(collection, key);
        self.dirty |= removed;
        removed
    }
}

fn decode_u64(collection: &str, key: &str, bytes: Option<&[u8]>) -> StorageResult<Option<u64>> {
    let Some(bytes) = bytes else {
        return Ok(None);
    };
    let array: [u8; 8] = bytes.try_into().map_err(|_| StorageError::InvalidValue {
        collection: collection.to_string(),
        key: key.to_string(),
        message: format!("expected 8 bytes, found {}", bytes.len()),
    })?;
    Ok(Some(u64::from_le_bytes(array)))
}
