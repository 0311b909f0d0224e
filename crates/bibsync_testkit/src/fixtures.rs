//! Test fixtures and sync helpers.
//!
//! Provides a harness wiring a [`FakeZoteroServer`], a [`MemoryStore`] and
//! in-memory file storage into a [`SyncContext`], plus builders for object
//! payloads in API shape.

use crate::server::FakeZoteroServer;
use bibsync_engine::{RetryConfig, SyncConfig, SyncContext, SyncController};
use bibsync_protocol::{parse_object, BuiltinSchema, LibraryIdentifier, ObjectKind, SyncObject};
use bibsync_store::{
    DiskFileStorage, FileStorage, Files, LocalStore, MemoryFileStorage, MemoryStore, ObjectRecord,
    WriteRequest,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

/// User id used by the harness.
pub const TEST_USER: u64 = 1;

/// Initializes `tracing` output for tests, once per process.
///
/// The filter is read from `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Configuration used by the harness: no groups, no waiting between restarts.
pub fn test_config() -> SyncConfig {
    SyncConfig::new(TEST_USER)
        .with_sync_groups(false)
        .with_retry(RetryConfig::no_retry())
}

/// A fake server and a local store ready to sync.
pub struct SyncHarness {
    /// The fake remote API.
    pub server: Arc<FakeZoteroServer>,
    /// The local store.
    pub store: Arc<MemoryStore>,
    /// The local file storage.
    pub files: Arc<dyn FileStorage>,
    /// Context shared by the steps.
    pub ctx: SyncContext<MemoryStore>,
    _temp_dir: Option<TempDir>,
}

impl SyncHarness {
    /// Creates a harness with in-memory files and [`test_config`].
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// Creates a harness with in-memory files.
    pub fn with_config(config: SyncConfig) -> Self {
        Self::build(config, Arc::new(MemoryFileStorage::new()), None)
    }

    /// Creates a harness storing files in a temporary directory.
    pub fn on_disk(config: SyncConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let files = Arc::new(DiskFileStorage::new(temp_dir.path()));
        Self::build(config, files, Some(temp_dir))
    }

    fn build(config: SyncConfig, files: Arc<dyn FileStorage>, temp_dir: Option<TempDir>) -> Self {
        init_tracing();
        let server = Arc::new(FakeZoteroServer::new(config.user_id));
        let store = Arc::new(MemoryStore::new());
        let ctx = SyncContext::new(config, server.clone(), store.clone(), Arc::clone(&files));
        Self {
            server,
            store,
            files,
            ctx,
            _temp_dir: temp_dir,
        }
    }

    /// Creates a controller over the harness context.
    pub fn controller(&self) -> SyncController<MemoryStore> {
        SyncController::new(self.ctx.clone())
    }

    /// Saves a record in the local store.
    pub fn save(&self, record: ObjectRecord) {
        self.store
            .perform(WriteRequest::SaveObject(record))
            .expect("Failed to save record");
    }

    /// Saves an object as already synced at `version`, with its JSON cache entry.
    pub fn save_synced(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str, data: Value, version: u64) {
        let json = object_json(key, version, data.clone());
        self.files
            .write(&Files::json_cache(library_id, kind, key), json.to_string().as_bytes())
            .expect("Failed to write cache");
        self.save(ObjectRecord::new(library_id, kind, key, data).with_version(version));
    }

    /// Saves an object edited by the user.
    pub fn save_changed(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str, data: Value, version: u64) {
        self.save(
            ObjectRecord::new(library_id, kind, key, data)
                .with_version(version)
                .changed_by_user(),
        );
    }

    /// Writes a local attachment file and marks it for upload.
    ///
    /// The attachment record must exist in the store.
    pub fn attach_file(&self, library_id: LibraryIdentifier, key: &str, bytes: &[u8]) {
        let mut record = self
            .store
            .object(library_id, ObjectKind::Item, key)
            .expect("Attachment record not found");
        let attachment = record.attachment.as_mut().expect("Record is not a file attachment");
        attachment.upload_pending = true;
        self.files
            .write(&Files::attachment_file(library_id, key, &attachment.filename), bytes)
            .expect("Failed to write attachment");
        self.save(record);
    }
}

impl Default for SyncHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds an object body as returned by the API.
pub fn object_json(key: &str, version: u64, data: Value) -> Value {
    let mut data = data.as_object().cloned().unwrap_or_default();
    data.insert("key".into(), json!(key));
    data.insert("version".into(), json!(version));
    json!({"key": key, "version": version, "data": data})
}

/// Collection data.
pub fn collection_data(name: &str) -> Value {
    json!({"name": name, "parentCollection": false})
}

/// Book item data.
pub fn book_data(title: &str) -> Value {
    json!({"itemType": "book", "title": title, "creators": [], "tags": [], "collections": []})
}

/// Imported file attachment data.
pub fn attachment_data(parent: &str, filename: &str, md5: &str) -> Value {
    json!({
        "itemType": "attachment",
        "parentItem": parent,
        "linkMode": "imported_file",
        "title": filename,
        "filename": filename,
        "contentType": "application/pdf",
        "md5": md5,
        "mtime": 1_700_000_000_000_i64,
    })
}

/// Asserts that an object body parses with the built-in schema.
pub fn assert_parses(object: SyncObject, json: &Value) {
    if let Err(error) = parse_object(object, json, &BuiltinSchema) {
        panic!("object does not parse: {}", error.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_produce_parsable_objects() {
        assert_parses(SyncObject::Collection, &object_json("CCCC2345", 1, collection_data("Reading")));
        assert_parses(SyncObject::Item, &object_json("BBBB2345", 2, book_data("Dune")));
        assert_parses(
            SyncObject::Item,
            &object_json("AAAA2345", 3, attachment_data("BBBB2345", "paper.pdf", "abc")),
        );
    }

    #[test]
    fn attach_file_marks_upload_pending() {
        let harness = SyncHarness::new();
        let lib = LibraryIdentifier::MY_LIBRARY;
        harness.save_synced(lib, ObjectKind::Item, "AAAA2345", attachment_data("BBBB2345", "paper.pdf", "abc"), 3);

        harness.attach_file(lib, "AAAA2345", b"%PDF-1.7");

        let record = harness.store.object(lib, ObjectKind::Item, "AAAA2345").unwrap();
        assert!(record.attachment.unwrap().upload_pending);
        assert!(harness.files.has(&Files::attachment_file(lib, "AAAA2345", "paper.pdf")));
    }

    #[test]
    fn disk_harness_writes_files() {
        let harness = SyncHarness::on_disk(test_config());
        let lib = LibraryIdentifier::MY_LIBRARY;
        harness.save_synced(lib, ObjectKind::Collection, "CCCC2345", collection_data("Reading"), 1);
        assert!(harness.files.has(&Files::json_cache(lib, ObjectKind::Collection, "CCCC2345")));
    }
}
