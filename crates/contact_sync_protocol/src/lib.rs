//! # Contact Sync Protocol
//!
//! Data model and CBOR codecs for contact manifest sync.
//!
//! This crate provides:
//! - [`AccountId`] and [`ContactIdentifier`], the local and remote keys
//! - [`ManifestVersion`] and [`Manifest`], the remote collection listing
//! - [`ContactRecord`], the wire snapshot of one contact
//! - [`ChangeState`], the per-account pending change marker
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod error;
mod ids;
mod manifest;
mod record;

pub use change::ChangeState;
pub use error::{ProtocolError, ProtocolResult};
pub use ids::{AccountId, ContactIdentifier, ManifestVersion, CONTACT_IDENTIFIER_LEN};
pub use manifest::{Manifest, ManifestBuilder};
pub use record::{ContactRecord, PROFILE_KEY_LEN};
