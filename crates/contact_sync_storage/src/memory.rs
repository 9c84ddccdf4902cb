//! In-memory storage backend for testing.

use crate::backend::KvBackend;
use crate::error::{StorageError, StorageResult};
use crate::image::KvImage;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// An in-memory storage backend.
///
/// This backend keeps the "persisted" image in memory and is suitable for:
/// - Unit tests
/// - Integration tests that simulate restarts by reopening a store over
///   the same backend
///
/// It can also be told to reject upcoming writes, which is how tests
/// exercise the "nothing durable changes on failure" guarantee.
///
/// # Example
///
/// ```rust
/// use contact_sync_storage::{InMemoryBackend, KvBackend, KvImage};
///
/// let backend = InMemoryBackend::new();
/// let mut image = KvImage::new();
/// image.insert("c", "k", vec![1, 2, 3]);
/// backend.persist(&image).unwrap();
/// assert_eq!(backend.load().unwrap(), image);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    image: RwLock<KvImage>,
    reject_next: AtomicU32,
    persist_count: AtomicU64,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend holding a pre-existing image.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_image(image: KvImage) -> Self {
        Self {
            image: RwLock::new(image),
            ..Self::default()
        }
    }

    /// Returns a copy of the persisted image.
    #[must_use]
    pub fn image(&self) -> KvImage {
        self.image.read().clone()
    }

    /// Makes the next `count` calls to `persist` fail.
    pub fn reject_next_persists(&self, count: u32) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    /// Returns how many images were successfully persisted.
    #[must_use]
    pub fn persist_count(&self) -> u64 {
        self.persist_count.load(Ordering::SeqCst)
    }
}

impl KvBackend for InMemoryBackend {
    fn load(&self) -> StorageResult<KvImage> {
        Ok(self.image.read().clone())
    }

    fn persist(&self, image: &KvImage) -> StorageResult<()> {
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StorageError::PersistRejected(
                "in-memory backend configured to reject".into(),
            ));
        }

        *self.image.write() = image.clone();
        self.persist_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
