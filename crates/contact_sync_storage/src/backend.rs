//! Storage backend trait definition.

use crate::error::StorageResult;
use crate::image::KvImage;

/// A persistence backend for [`crate::KvStore`].
///
/// Backends are **whole-image stores**. They load the last committed image
/// on open and replace it atomically on every commit. They never interpret
/// the collections or keys they hold.
///
/// # Invariants
///
/// - `load` returns exactly the image passed to the last successful `persist`
/// - A failed `persist` leaves the previously persisted image intact
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait KvBackend: Send + Sync {
    /// Loads the last persisted image, or an empty image for a new store.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be read or decoded.
    fn load(&self) -> StorageResult<KvImage>;

    /// Atomically replaces the persisted image.
    ///
    /// After this returns successfully, the image is guaranteed to survive
    /// process termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be written. The previous image
    /// must still be loadable in that case.
    fn persist(&self, image: &KvImage) -> StorageResult<()>;
}

impl<B: KvBackend + ?Sized> KvBackend for std::sync::Arc<B> {
    fn load(&self) -> StorageResult<KvImage> {
        (**self).load()
    }

    fn persist(&self, image: &KvImage) -> StorageResult<()> {
        (**self).persist(image)
    }
}
