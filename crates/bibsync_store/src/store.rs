//! Local store trait definition.

use crate::error::StoreResult;
use crate::record::{LibraryRecord, ObjectRecord, SettingRecord};
use crate::request::{WriteOutcome, WriteRequest};
use bibsync_protocol::{LibraryIdentifier, ObjectKind, Versions};

/// Reads and writes inside one store transaction.
///
/// Reads observe the writes performed earlier in the same transaction.
pub trait Coordinator {
    /// Returns a library.
    fn library(&self, library_id: LibraryIdentifier) -> Option<LibraryRecord>;

    /// Returns all libraries.
    fn libraries(&self) -> Vec<LibraryRecord>;

    /// Returns the version cursors of a library (zero cursors if unknown).
    fn versions(&self, library_id: LibraryIdentifier) -> Versions {
        self.library(library_id)
            .map(|library| library.versions)
            .unwrap_or_default()
    }

    /// Returns one object.
    fn object(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> Option<ObjectRecord>;

    /// Returns all objects of one kind, ordered by key.
    fn objects(&self, library_id: LibraryIdentifier, kind: ObjectKind) -> Vec<ObjectRecord>;

    /// Returns all settings of a library.
    fn settings(&self, library_id: LibraryIdentifier) -> Vec<SettingRecord>;

    /// Returns attachment keys waiting for deletion from WebDAV.
    fn webdav_deletions(&self, library_id: LibraryIdentifier) -> Vec<String>;

    /// Executes a write request.
    fn perform(&mut self, request: WriteRequest) -> StoreResult<WriteOutcome>;
}

/// Transactional local object storage.
///
/// # Invariants
///
/// - A transaction either commits all of its writes or none of them
/// - Version cursors never move backwards
/// - Implementations must be `Send + Sync` so libraries can sync concurrently
pub trait LocalStore: Send + Sync {
    /// Runs `f` in a transaction, committing only if it returns `Ok`.
    fn transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn Coordinator) -> StoreResult<R>;

    /// Executes a single request in its own transaction.
    fn perform(&self, request: WriteRequest) -> StoreResult<WriteOutcome> {
        self.transaction(|coordinator| coordinator.perform(request))
    }

    /// Executes requests in order in one transaction.
    fn perform_batch(&self, requests: Vec<WriteRequest>) -> StoreResult<Vec<WriteOutcome>> {
        self.transaction(|coordinator| {
            requests
                .into_iter()
                .map(|request| coordinator.perform(request))
                .collect()
        })
    }
}
