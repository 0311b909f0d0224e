//! Local bookkeeping steps: version cursors, resync marks, groups and the
//! per-library work lists the orchestrator runs from.

use crate::actions::upload::AttachmentUpload;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use bibsync_protocol::{LibraryIdentifier, ObjectKind, SyncObject, UpdateVersionType, Versions};
use bibsync_store::{Coordinator, Files, LibraryRecord, LocalStore, ObjectRecord, WriteOutcome, WriteRequest};
use serde_json::Value;
use std::collections::HashMap;

/// Advances a version cursor.
#[derive(Debug, Clone, Copy)]
pub struct StoreVersion {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Cursor.
    pub version_type: UpdateVersionType,
    /// New version.
    pub version: u64,
}

impl StoreVersion {
    /// Runs the step and returns whether the cursor moved.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<bool> {
        let outcome = ctx.store.perform(WriteRequest::SetVersion {
            library_id: self.library_id,
            version_type: self.version_type,
            version: self.version,
        })?;
        Ok(outcome == WriteOutcome::VersionChanged(true))
    }
}

/// Flags objects for a forced fetch on the next pass.
#[derive(Debug, Clone)]
pub struct MarkForResync {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Object type.
    pub object: SyncObject,
    /// Keys.
    pub keys: Vec<String>,
}

impl MarkForResync {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<()> {
        let kind = self
            .object
            .kind()
            .ok_or(SyncError::UnsupportedObject(self.object))?;
        ctx.store.perform(WriteRequest::MarkForResync {
            library_id: self.library_id,
            kind,
            keys: self.keys.clone(),
            attempted_at: ctx.now(),
        })?;
        Ok(())
    }
}

/// Forgets pending local changes after they were reverted or resolved.
#[derive(Debug, Clone, Copy)]
pub struct MarkChangesAsResolved {
    /// Library.
    pub library_id: LibraryIdentifier,
}

impl MarkChangesAsResolved {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<()> {
        ctx.store.perform(WriteRequest::MarkChangesResolved {
            library_id: self.library_id,
        })?;
        Ok(())
    }
}

/// Removes a group library the user lost access to.
#[derive(Debug, Clone, Copy)]
pub struct DeleteGroup {
    /// Group id.
    pub group_id: i64,
}

impl DeleteGroup {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<()> {
        ctx.store.perform(WriteRequest::DeleteGroup { group_id: self.group_id })?;
        tracing::info!(group = self.group_id, "group removed");
        Ok(())
    }
}

/// Keeps a group library the user lost access to, read-only.
#[derive(Debug, Clone, Copy)]
pub struct MarkGroupAsLocalOnly {
    /// Group id.
    pub group_id: i64,
}

impl MarkGroupAsLocalOnly {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<()> {
        ctx.store.perform(WriteRequest::MarkGroupLocalOnly { group_id: self.group_id })?;
        tracing::info!(group = self.group_id, "group kept locally");
        Ok(())
    }
}

/// A batch of changed objects to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBatch {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Object type.
    pub object: SyncObject,
    /// Library version the batch was built at.
    pub version: u64,
    /// Objects in API shape.
    pub parameters: Vec<Value>,
}

/// A batch of local deletions to submit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteBatch {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Object type.
    pub object: SyncObject,
    /// Library version the batch was built at.
    pub version: u64,
    /// Deleted keys.
    pub keys: Vec<String>,
}

/// Local state of one library at the start of a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryData {
    /// Library.
    pub identifier: LibraryIdentifier,
    /// Display name.
    pub name: String,
    /// Version cursors.
    pub versions: Versions,
    /// Metadata editing permission.
    pub can_edit_metadata: bool,
    /// File editing permission.
    pub can_edit_files: bool,
    /// Local changes, parent objects first.
    pub updates: Vec<WriteBatch>,
    /// Local deletions.
    pub deletions: Vec<DeleteBatch>,
    /// Locally changed settings.
    pub settings: Vec<(String, Value)>,
    /// Whether files wait for upload.
    pub has_upload: bool,
    /// Whether attachment files must be deleted from WebDAV.
    pub has_webdav_deletions: bool,
}

/// Loads the libraries to sync with their pending local work.
///
/// Local-only groups are skipped.
#[derive(Debug, Clone, Default)]
pub struct LoadLibraryData {
    /// Libraries to load; `None` loads every library.
    pub library_ids: Option<Vec<LibraryIdentifier>>,
    /// Whether to build update and deletion batches.
    pub fetch_updates: bool,
}

/// Number of ancestors of `key` inside `parents`.
fn depth(parents: &HashMap<&str, &str>, key: &str) -> usize {
    let mut depth = 0;
    let mut current = key;
    while let Some(&parent) = parents.get(current) {
        depth += 1;
        current = parent;
        if depth > parents.len() {
            break;
        }
    }
    depth
}

fn parent_first(mut records: Vec<ObjectRecord>) -> Vec<ObjectRecord> {
    let depths: HashMap<String, usize> = {
        let parents: HashMap<&str, &str> = records
            .iter()
            .filter_map(|record| record.parent.as_deref().map(|parent| (record.key.as_str(), parent)))
            .collect();
        records
            .iter()
            .map(|record| (record.key.clone(), depth(&parents, &record.key)))
            .collect()
    };
    records.sort_by_key(|record| depths.get(&record.key).copied().unwrap_or(0));
    records
}

impl LoadLibraryData {
    fn load(&self, coordinator: &dyn Coordinator, library: LibraryRecord, batch_size: usize) -> LibraryData {
        let library_id = library.id;
        let version = library.versions.max();
        let mut data = LibraryData {
            identifier: library_id,
            name: library.name,
            versions: library.versions,
            can_edit_metadata: library.can_edit_metadata,
            can_edit_files: library.can_edit_files,
            updates: Vec::new(),
            deletions: Vec::new(),
            settings: Vec::new(),
            has_upload: false,
            has_webdav_deletions: !coordinator.webdav_deletions(library_id).is_empty(),
        };

        let items = coordinator.objects(library_id, ObjectKind::Item);
        data.has_upload = library.can_edit_files
            && items.iter().any(|record| {
                !record.deleted && record.attachment.as_ref().is_some_and(|attachment| attachment.upload_pending)
            });

        if !self.fetch_updates || !library.can_edit_metadata {
            return data;
        }

        for (kind, object) in [
            (ObjectKind::Collection, SyncObject::Collection),
            (ObjectKind::Search, SyncObject::Search),
            (ObjectKind::Item, SyncObject::Item),
        ] {
            let records = if kind == ObjectKind::Item {
                items.clone()
            } else {
                coordinator.objects(library_id, kind)
            };

            let changed: Vec<ObjectRecord> = records
                .iter()
                .filter(|record| record.changed && !record.deleted)
                .cloned()
                .collect();
            let parameters: Vec<Value> = parent_first(changed)
                .iter()
                .map(ObjectRecord::update_parameters)
                .collect();
            for chunk in parameters.chunks(batch_size) {
                data.updates.push(WriteBatch {
                    library_id,
                    object,
                    version,
                    parameters: chunk.to_vec(),
                });
            }

            let deleted: Vec<String> = records
                .iter()
                .filter(|record| record.deleted)
                .map(|record| record.key.clone())
                .collect();
            for chunk in deleted.chunks(batch_size) {
                data.deletions.push(DeleteBatch {
                    library_id,
                    object,
                    version,
                    keys: chunk.to_vec(),
                });
            }
        }

        data.settings = coordinator
            .settings(library_id)
            .into_iter()
            .filter(|setting| setting.changed)
            .map(|setting| (setting.key, setting.value))
            .collect();
        data
    }

    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<Vec<LibraryData>> {
        let batch_size = ctx.config.write_batch_size.max(1);
        let libraries = ctx.store.transaction(|coordinator| {
            let libraries = coordinator
                .libraries()
                .into_iter()
                .filter(|library| !library.local_only)
                .filter(|library| {
                    self.library_ids
                        .as_ref()
                        .map_or(true, |ids| ids.contains(&library.id))
                })
                .map(|library| self.load(&*coordinator, library, batch_size))
                .collect::<Vec<_>>();
            Ok(libraries)
        })?;
        Ok(libraries)
    }
}

/// Lists the attachment files of a library waiting for upload.
#[derive(Debug, Clone, Copy)]
pub struct LoadUploadData {
    /// Library.
    pub library_id: LibraryIdentifier,
}

impl LoadUploadData {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<Vec<AttachmentUpload>> {
        let records = ctx
            .store
            .transaction(|coordinator| Ok(coordinator.objects(self.library_id, ObjectKind::Item)))?;

        Ok(records
            .into_iter()
            .filter(|record| !record.deleted)
            .filter_map(|record| {
                let attachment = record.attachment.filter(|attachment| attachment.upload_pending)?;
                Some(AttachmentUpload {
                    file: Files::attachment_file(self.library_id, &record.key, &attachment.filename),
                    key: record.key,
                    library_id: self.library_id,
                    filename: attachment.filename,
                    content_type: attachment.content_type,
                    md5: attachment.md5,
                    mtime: attachment.mtime,
                    old_md5: None,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::MockApiClient;
    use bibsync_store::{MemoryFileStorage, MemoryStore, ObjectSyncState};
    use serde_json::json;
    use std::sync::Arc;

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    fn context(store: Arc<MemoryStore>, config: SyncConfig) -> SyncContext<MemoryStore> {
        SyncContext::new(config, Arc::new(MockApiClient::new()), store, Arc::new(MemoryFileStorage::new()))
            .with_clock(|| 500)
    }

    fn save(store: &MemoryStore, record: ObjectRecord) {
        store.perform(WriteRequest::SaveObject(record)).unwrap();
    }

    #[tokio::test]
    async fn store_version_reports_movement() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), SyncConfig::new(1));
        let step = StoreVersion {
            library_id: LIB,
            version_type: UpdateVersionType::Deletions,
            version: 4,
        };
        assert!(step.run(&ctx).await.unwrap());
        assert!(!step.run(&ctx).await.unwrap());
        assert_eq!(store.versions(LIB).deletions, 4);
    }

    #[tokio::test]
    async fn resync_marks_count_attempts() {
        let store = Arc::new(MemoryStore::new());
        let ctx = context(store.clone(), SyncConfig::new(1));
        let step = MarkForResync {
            library_id: LIB,
            object: SyncObject::Trash,
            keys: vec!["ITEM2222".into()],
        };
        step.run(&ctx).await.unwrap();
        step.run(&ctx).await.unwrap();

        let record = store.object(LIB, ObjectKind::Item, "ITEM2222").unwrap();
        assert_eq!(record.sync_state, ObjectSyncState::Dirty);
        assert_eq!(record.sync_retries, 2);
        assert_eq!(record.last_sync_attempt, Some(500));
    }

    #[tokio::test]
    async fn library_data_orders_parents_first_and_chunks() {
        let store = Arc::new(MemoryStore::new());
        save(
            &store,
            ObjectRecord::new(LIB, ObjectKind::Item, "NOTE2222", json!({"itemType": "note", "parentItem": "BOOK2222"}))
                .changed_by_user(),
        );
        save(
            &store,
            ObjectRecord::new(LIB, ObjectKind::Item, "BOOK2222", json!({"itemType": "book"})).changed_by_user(),
        );
        save(
            &store,
            ObjectRecord::new(LIB, ObjectKind::Item, "BOOK3333", json!({"itemType": "book"})).changed_by_user(),
        );
        let mut deleted = ObjectRecord::new(LIB, ObjectKind::Collection, "COLL2222", json!({"name": "old"}));
        deleted.deleted = true;
        save(&store, deleted);
        store
            .perform(WriteRequest::SetVersion {
                library_id: LIB,
                version_type: UpdateVersionType::Object(SyncObject::Item),
                version: 40,
            })
            .unwrap();

        let ctx = context(store.clone(), SyncConfig::new(1).with_write_batch_size(2));
        let libraries = LoadLibraryData {
            library_ids: None,
            fetch_updates: true,
        }
        .run(&ctx)
        .await
        .unwrap();

        assert_eq!(libraries.len(), 1);
        let library = &libraries[0];
        assert_eq!(library.updates.len(), 2);
        assert_eq!(library.updates[0].version, 40);
        let submitted: Vec<&str> = library
            .updates
            .iter()
            .flat_map(|batch| batch.parameters.iter())
            .map(|parameters| parameters["key"].as_str().unwrap())
            .collect();
        let note = submitted.iter().position(|key| *key == "NOTE2222").unwrap();
        let book = submitted.iter().position(|key| *key == "BOOK2222").unwrap();
        assert!(book < note);
        assert_eq!(
            library.deletions,
            vec![DeleteBatch {
                library_id: LIB,
                object: SyncObject::Collection,
                version: 40,
                keys: vec!["COLL2222".into()],
            }]
        );
    }

    #[tokio::test]
    async fn read_only_and_local_only_libraries() {
        let store = Arc::new(MemoryStore::new());
        for group_id in [5, 6] {
            store
                .perform(WriteRequest::StoreGroup {
                    group_id,
                    name: format!("group {}", group_id),
                    version: 1,
                    can_edit_metadata: false,
                    can_edit_files: false,
                })
                .unwrap();
        }
        store.perform(WriteRequest::MarkGroupLocalOnly { group_id: 6 }).unwrap();
        save(
            &store,
            ObjectRecord::new(LibraryIdentifier::Group(5), ObjectKind::Item, "BOOK2222", json!({"itemType": "book"}))
                .changed_by_user(),
        );

        let ctx = context(store, SyncConfig::new(1));
        let libraries = LoadLibraryData {
            library_ids: Some(vec![LibraryIdentifier::Group(5), LibraryIdentifier::Group(6)]),
            fetch_updates: true,
        }
        .run(&ctx)
        .await
        .unwrap();

        assert_eq!(libraries.len(), 1);
        assert_eq!(libraries[0].identifier, LibraryIdentifier::Group(5));
        assert!(libraries[0].updates.is_empty());
    }

    #[tokio::test]
    async fn upload_data_lists_pending_files() {
        let store = Arc::new(MemoryStore::new());
        let mut record = ObjectRecord::new(
            LIB,
            ObjectKind::Item,
            "ATTA2222",
            json!({"itemType": "attachment", "linkMode": "imported_file", "filename": "a.pdf", "md5": "abc", "mtime": 9}),
        );
        if let Some(attachment) = record.attachment.as_mut() {
            attachment.upload_pending = true;
        }
        save(&store, record);
        save(
            &store,
            ObjectRecord::new(
                LIB,
                ObjectKind::Item,
                "ATTA3333",
                json!({"itemType": "attachment", "linkMode": "imported_file", "filename": "b.pdf"}),
            ),
        );

        let ctx = context(store, SyncConfig::new(1));
        let uploads = LoadUploadData { library_id: LIB }.run(&ctx).await.unwrap();

        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].key, "ATTA2222");
        assert_eq!(uploads[0].md5, "abc");
        assert_eq!(uploads[0].file, Files::attachment_file(LIB, "ATTA2222", "a.pdf"));
    }
}
