//! # Bibsync Store
//!
//! Local storage collaborators of the sync engine.
//!
//! The engine never touches storage directly. It talks to two seams:
//!
//! - [`LocalStore`] - transactional object store driven by [`WriteRequest`]s
//! - [`FileStorage`] - attachment files and the JSON cache
//!
//! ## Available Implementations
//!
//! - [`MemoryStore`] - In-memory object store with failure injection
//! - [`DiskFileStorage`] - Files under a root directory, written atomically
//! - [`MemoryFileStorage`] - In-memory files for testing
//!
//! ## Example
//!
//! ```rust
//! use bibsync_protocol::{LibraryIdentifier, ObjectKind};
//! use bibsync_store::{LocalStore, MemoryStore, ObjectRecord, WriteRequest};
//! use serde_json::json;
//!
//! let store = MemoryStore::new();
//! let record = ObjectRecord::new(
//!     LibraryIdentifier::MY_LIBRARY,
//!     ObjectKind::Collection,
//!     "ABCD2345",
//!     json!({"name": "Reading"}),
//! );
//! store.perform(WriteRequest::SaveObject(record)).unwrap();
//! assert!(store.object(LibraryIdentifier::MY_LIBRARY, ObjectKind::Collection, "ABCD2345").is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod disk;
mod error;
mod files;
mod memory;
mod memory_files;
mod record;
mod request;
mod split;
mod store;

pub use disk::DiskFileStorage;
pub use error::{StoreError, StoreResult};
pub use files::{FileStorage, Files};
pub use memory::{MemoryStore, StoreStats};
pub use memory_files::MemoryFileStorage;
pub use record::{
    generate_key, AttachmentState, LibraryRecord, ObjectRecord, ObjectSyncState, SettingRecord,
};
pub use request::{WriteOutcome, WriteRequest};
pub use split::{split_position, MAX_POSITION_LENGTH};
pub use store::{Coordinator, LocalStore};
