//! # Contact Sync Storage
//!
//! Transactional key-value storage for the contact sync engine.
//!
//! The sync engine keeps three small pieces of state (identifier map,
//! pending change map, manifest version) that must change together or not
//! at all. This crate provides the store they live in.
//!
//! ## Design Principles
//!
//! - Values are opaque bytes grouped by collection and key
//! - Reads are snapshot-isolated; writes are serialized and atomic
//! - Backends persist whole images, so a commit survives a crash entirely
//!   or not at all
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use contact_sync_storage::{KvStore, StorageError};
//!
//! let store = KvStore::in_memory();
//! store
//!     .write(|txn| {
//!         txn.set("contacts", "greeting", b"hello".to_vec());
//!         Ok::<_, StorageError>(())
//!     })
//!     .unwrap();
//! let value = store.read(|txn| {
//!     Ok::<_, StorageError>(txn.get("contacts", "greeting").map(<[u8]>::to_vec))
//! });
//! assert_eq!(value.unwrap(), Some(b"hello".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod image;
mod memory;
mod store;

pub use backend::KvBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use image::{KvImage, IMAGE_FORMAT_VERSION};
pub use memory::InMemoryBackend;
pub use store::{KvStore, ReadTransaction, WriteTransaction};
