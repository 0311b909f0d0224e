//! Revert steps for libraries the user may not write to.

use crate::context::SyncContext;
use crate::error::SyncResult;
use bibsync_protocol::{
    parse_object, LibraryIdentifier, ObjectKind, ObjectResponse, SyncObject,
};
use bibsync_store::{FileStorage, Files, LocalStore, ObjectRecord, WriteRequest};
use serde_json::Value;
use std::collections::BTreeMap;

fn cached_object<S: LocalStore>(ctx: &SyncContext<S>, record: &ObjectRecord) -> Option<ObjectResponse> {
    let path = Files::json_cache(record.library_id, record.kind, &record.key);
    let bytes = ctx.files.read(&path).ok()?;
    let json: Value = serde_json::from_slice(&bytes).ok()?;
    let object = SyncObject::for_kind(record.kind, record.trash);
    parse_object(object, &json, ctx.schema.as_ref()).ok()
}

/// Restores every locally changed object of a library from the JSON cache.
#[derive(Debug, Clone)]
pub struct RevertLibraryUpdates {
    /// Library.
    pub library_id: LibraryIdentifier,
}

impl RevertLibraryUpdates {
    /// Runs the step and returns, per kind, the keys without a usable cache entry.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<BTreeMap<ObjectKind, Vec<String>>> {
        let changed = ctx.store.transaction(|coordinator| {
            Ok([ObjectKind::Collection, ObjectKind::Search, ObjectKind::Item]
                .into_iter()
                .flat_map(|kind| coordinator.objects(self.library_id, kind))
                .filter(ObjectRecord::is_pending_submission)
                .collect::<Vec<_>>())
        })?;

        let mut requests = Vec::new();
        let mut failures: BTreeMap<ObjectKind, Vec<String>> = BTreeMap::new();
        for record in &changed {
            match cached_object(ctx, record) {
                Some(object) => requests.push(WriteRequest::UpdateFromResponse {
                    library_id: self.library_id,
                    object,
                }),
                None => failures.entry(record.kind).or_default().push(record.key.clone()),
            }
        }

        if !requests.is_empty() {
            ctx.store.perform_batch(requests)?;
        }
        tracing::info!(
            library = %self.library_id,
            reverted = changed.len() - failures.values().map(Vec::len).sum::<usize>(),
            failed = failures.values().map(Vec::len).sum::<usize>(),
            "local changes reverted"
        );
        Ok(failures)
    }
}

/// Keys handled by [`RevertLibraryFiles`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevertedFiles {
    /// Attachments restored from the cache.
    pub reverted: Vec<String>,
    /// Attachments without a cache entry, removed locally.
    pub removed: Vec<String>,
}

/// Drops pending attachment uploads of a library.
#[derive(Debug, Clone)]
pub struct RevertLibraryFiles {
    /// Library.
    pub library_id: LibraryIdentifier,
}

impl RevertLibraryFiles {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<RevertedFiles> {
        let pending: Vec<ObjectRecord> = ctx.store.transaction(|coordinator| {
            Ok(coordinator
                .objects(self.library_id, ObjectKind::Item)
                .into_iter()
                .filter(|record| record.attachment.as_ref().is_some_and(|attachment| attachment.upload_pending))
                .collect())
        })?;

        let mut result = RevertedFiles::default();
        let mut requests = Vec::new();
        for record in &pending {
            let Some(object) = cached_object(ctx, record) else {
                result.removed.push(record.key.clone());
                continue;
            };

            let old_name = record
                .attachment
                .as_ref()
                .map(|attachment| attachment.filename.as_str())
                .unwrap_or_default();
            let new_name = object
                .data
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !old_name.is_empty() && !new_name.is_empty() && old_name != new_name {
                let from = Files::attachment_file(self.library_id, &record.key, old_name);
                let to = Files::attachment_file(self.library_id, &record.key, new_name);
                if let Err(error) = ctx.files.move_file(&from, &to) {
                    tracing::warn!(key = %record.key, error = %error, "could not rename attachment, removing it");
                    ctx.files.remove(&from)?;
                }
            }

            result.reverted.push(record.key.clone());
            requests.push(WriteRequest::UpdateFromResponse {
                library_id: self.library_id,
                object,
            });
            requests.push(WriteRequest::MarkAttachmentUploaded {
                library_id: self.library_id,
                key: record.key.clone(),
                version: None,
            });
        }

        if !result.removed.is_empty() {
            requests.push(WriteRequest::PurgeObjects {
                library_id: self.library_id,
                kind: ObjectKind::Item,
                keys: result.removed.clone(),
            });
        }
        if !requests.is_empty() {
            ctx.store.perform_batch(requests)?;
        }
        for key in &result.removed {
            ctx.files.remove(&Files::attachment_directory(self.library_id, key))?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::MockApiClient;
    use bibsync_store::{MemoryFileStorage, MemoryStore};
    use serde_json::json;
    use std::sync::Arc;

    const LIB: LibraryIdentifier = LibraryIdentifier::Group(7);

    fn context(store: Arc<MemoryStore>, files: Arc<MemoryFileStorage>) -> SyncContext<MemoryStore> {
        SyncContext::new(SyncConfig::new(1), Arc::new(MockApiClient::new()), store, files)
    }

    fn cache(files: &MemoryFileStorage, kind: ObjectKind, json: Value) {
        let key = json["key"].as_str().unwrap().to_string();
        files
            .write(&Files::json_cache(LIB, kind, &key), json.to_string().as_bytes())
            .unwrap();
    }

    #[tokio::test]
    async fn changes_are_restored_from_cache() {
        let store = Arc::new(MemoryStore::new());
        let files = Arc::new(MemoryFileStorage::new());
        cache(
            &files,
            ObjectKind::Collection,
            json!({"key": "COLL2222", "version": 4, "data": {"key": "COLL2222", "version": 4, "name": "Original"}}),
        );
        for key in ["COLL2222", "COLL3333"] {
            let record = ObjectRecord::new(LIB, ObjectKind::Collection, key, json!({"name": "Edited"}))
                .with_version(4)
                .changed_by_user();
            store.perform(WriteRequest::SaveObject(record)).unwrap();
        }

        let failures = RevertLibraryUpdates { library_id: LIB }
            .run(&context(store.clone(), files))
            .await
            .unwrap();

        assert_eq!(failures.get(&ObjectKind::Collection), Some(&vec!["COLL3333".to_string()]));
        let reverted = store.object(LIB, ObjectKind::Collection, "COLL2222").unwrap();
        assert_eq!(reverted.data["name"], "Original");
        assert!(!reverted.changed);
    }

    #[tokio::test]
    async fn pending_files_are_renamed_or_removed() {
        let store = Arc::new(MemoryStore::new());
        let files = Arc::new(MemoryFileStorage::new());
        cache(
            &files,
            ObjectKind::Item,
            json!({"key": "ATTA2222", "version": 3, "data": {
                "key": "ATTA2222", "version": 3, "itemType": "attachment",
                "linkMode": "imported_file", "filename": "paper.pdf"
            }}),
        );
        for (key, filename) in [("ATTA2222", "renamed.pdf"), ("ATTA3333", "new.pdf")] {
            let mut record = ObjectRecord::new(
                LIB,
                ObjectKind::Item,
                key,
                json!({"itemType": "attachment", "linkMode": "imported_file", "filename": filename}),
            );
            if let Some(attachment) = record.attachment.as_mut() {
                attachment.upload_pending = true;
            }
            store.perform(WriteRequest::SaveObject(record)).unwrap();
            files
                .write(&Files::attachment_file(LIB, key, filename), b"%PDF")
                .unwrap();
        }

        let result = RevertLibraryFiles { library_id: LIB }
            .run(&context(store.clone(), files.clone()))
            .await
            .unwrap();

        assert_eq!(result.reverted, vec!["ATTA2222".to_string()]);
        assert_eq!(result.removed, vec!["ATTA3333".to_string()]);
        assert!(files.has(&Files::attachment_file(LIB, "ATTA2222", "paper.pdf")));
        assert!(!files.has(&Files::attachment_file(LIB, "ATTA2222", "renamed.pdf")));
        assert!(!files.has(&Files::attachment_file(LIB, "ATTA3333", "new.pdf")));
        assert!(store.object(LIB, ObjectKind::Item, "ATTA3333").is_none());
        let reverted = store.object(LIB, ObjectKind::Item, "ATTA2222").unwrap();
        assert!(!reverted.attachment.unwrap().upload_pending);
    }
}
