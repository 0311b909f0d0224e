//! Deletion reconciliation steps.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use bibsync_protocol::{
    ApiRequest, Conflict, DeletionsResponse, LibraryIdentifier, ObjectKind, SyncObject,
    UpdateVersionType,
};
use bibsync_store::{LocalStore, WriteRequest};

/// Remote deletions since a version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedDeletions {
    /// Remote library version.
    pub version: u64,
    /// Deleted keys per type.
    pub deletions: DeletionsResponse,
}

/// Downloads the deletion log without applying it.
#[derive(Debug, Clone)]
pub struct LoadDeletions {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Local deletion cursor.
    pub since_version: u64,
    /// Remote library version observed earlier in this pass.
    pub current_version: Option<u64>,
}

impl LoadDeletions {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<LoadedDeletions> {
        let request = ApiRequest::deletions(self.library_id, ctx.user_id(), self.since_version);
        let response = ctx.send(request).await?;
        let version = response.version();

        if let Some(current) = self.current_version {
            if current != version {
                return Err(SyncError::VersionMismatch(self.library_id));
            }
        }

        Ok(LoadedDeletions {
            version,
            deletions: response.decode()?,
        })
    }
}

/// Result of applying remote deletions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionsResult {
    /// Remote library version.
    pub version: u64,
    /// Locally edited objects that were not deleted.
    pub conflicts: Vec<Conflict>,
    /// Number of keys processed.
    pub applied: usize,
}

/// Downloads the deletion log and applies it locally.
///
/// Keys are applied in sub-batches, each committed on its own. A failing
/// sub-batch stops the remaining ones; earlier sub-batches stay committed.
#[derive(Debug, Clone)]
pub struct SyncDeletions {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Local deletion cursor.
    pub since_version: u64,
    /// Remote library version observed earlier in this pass.
    pub current_version: Option<u64>,
}

impl SyncDeletions {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<DeletionsResult> {
        let loaded = LoadDeletions {
            library_id: self.library_id,
            since_version: self.since_version,
            current_version: self.current_version,
        }
        .run(ctx)
        .await?;

        let mut result = DeletionsResult {
            version: loaded.version,
            ..DeletionsResult::default()
        };
        let batch_size = ctx.config.deletion_batch_size.max(1);
        let deletions = loaded.deletions;

        for (kind, keys) in [
            (ObjectKind::Collection, &deletions.collections),
            (ObjectKind::Search, &deletions.searches),
            (ObjectKind::Item, &deletions.items),
        ] {
            for chunk in keys.chunks(batch_size) {
                let conflicts = ctx
                    .store
                    .perform(WriteRequest::DeleteObjects {
                        library_id: self.library_id,
                        kind,
                        keys: chunk.to_vec(),
                    })?
                    .into_conflicts();
                result.applied += chunk.len();
                result.conflicts.extend(conflicts);
            }
        }

        for chunk in deletions.tags.chunks(batch_size) {
            ctx.store.perform(WriteRequest::DeleteTags {
                library_id: self.library_id,
                names: chunk.to_vec(),
            })?;
            result.applied += chunk.len();
        }

        if !deletions.settings.is_empty() {
            ctx.store.perform(WriteRequest::DeleteSettings {
                library_id: self.library_id,
                keys: deletions.settings.clone(),
            })?;
            result.applied += deletions.settings.len();
        }

        tracing::debug!(
            library = %self.library_id,
            applied = result.applied,
            conflicts = result.conflicts.len(),
            "remote deletions applied"
        );
        Ok(result)
    }
}

/// Undeletes objects whose remote deletion collided with local edits, so the
/// next update pass submits them again.
#[derive(Debug, Clone)]
pub struct RestoreDeletions {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Conflicts reported by [`SyncDeletions`].
    pub conflicts: Vec<Conflict>,
}

impl RestoreDeletions {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<()> {
        let requests: Vec<WriteRequest> = [ObjectKind::Collection, ObjectKind::Search, ObjectKind::Item]
            .into_iter()
            .filter_map(|kind| {
                let keys: Vec<String> = self
                    .conflicts
                    .iter()
                    .filter(|conflict| ObjectKind::from_type_name(&conflict.object_type) == Some(kind))
                    .map(|conflict| conflict.key.clone())
                    .collect();
                (!keys.is_empty()).then(|| WriteRequest::MarkChangedByUser {
                    library_id: self.library_id,
                    kind,
                    keys,
                })
            })
            .collect();

        if !requests.is_empty() {
            ctx.store.perform_batch(requests)?;
        }
        Ok(())
    }
}

/// Result of submitting local deletions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitDeletionResult {
    /// New remote library version.
    pub version: u64,
    /// Whether attachment files were queued for deletion from WebDAV.
    pub did_create_webdav_deletions: bool,
}

/// Submits local deletions of one object type.
#[derive(Debug, Clone)]
pub struct SubmitDeletion {
    /// Deleted keys.
    pub keys: Vec<String>,
    /// Object type.
    pub object: SyncObject,
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Remote library version the deletion is based on.
    pub version: u64,
}

impl SubmitDeletion {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<SubmitDeletionResult> {
        let kind = self
            .object
            .kind()
            .ok_or(SyncError::UnsupportedObject(self.object))?;

        let request = ApiRequest::submit_deletions(
            self.library_id,
            ctx.user_id(),
            self.object,
            &self.keys,
            self.version,
        );
        let response = ctx.send(request).await?;
        let version = response.version();
        let webdav_enabled = ctx.config.webdav_enabled;

        let did_create_webdav_deletions = ctx.store.transaction(|coordinator| {
            let webdav_keys: Vec<String> = if webdav_enabled && kind == ObjectKind::Item {
                self.keys
                    .iter()
                    .filter(|key| {
                        coordinator
                            .object(self.library_id, kind, key)
                            .is_some_and(|record| record.attachment.is_some())
                    })
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            let created = !webdav_keys.is_empty();
            if created {
                coordinator.perform(WriteRequest::CreateWebDavDeletions {
                    library_id: self.library_id,
                    keys: webdav_keys,
                })?;
            }
            coordinator.perform(WriteRequest::PurgeObjects {
                library_id: self.library_id,
                kind,
                keys: self.keys.clone(),
            })?;
            coordinator.perform(WriteRequest::SetVersion {
                library_id: self.library_id,
                version_type: UpdateVersionType::Object(self.object),
                version,
            })?;
            Ok(created)
        })?;

        tracing::info!(
            library = %self.library_id,
            object = %self.object,
            count = self.keys.len(),
            version,
            "local deletions submitted"
        );
        Ok(SubmitDeletionResult {
            version,
            did_create_webdav_deletions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::error::PreconditionErrorType;
    use crate::transport::MockApiClient;
    use bibsync_protocol::{ApiResponse, Method};
    use bibsync_store::{MemoryFileStorage, MemoryStore, ObjectRecord};
    use serde_json::json;
    use std::sync::Arc;

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    fn context(api: Arc<MockApiClient>, store: Arc<MemoryStore>, config: SyncConfig) -> SyncContext<MemoryStore> {
        SyncContext::new(config, api, store, Arc::new(MemoryFileStorage::new()))
    }

    fn save(store: &MemoryStore, record: ObjectRecord) {
        store.perform(WriteRequest::SaveObject(record)).unwrap();
    }

    #[tokio::test]
    async fn applies_deletions_and_reports_conflicts() {
        let api = Arc::new(MockApiClient::new());
        api.push_response(ApiResponse::json(
            &json!({"collections": ["COLL2222"], "items": ["ITEM2222", "EDIT2222"], "tags": ["old"]}),
            9,
        ));
        let store = Arc::new(MemoryStore::new());
        save(&store, ObjectRecord::new(LIB, ObjectKind::Collection, "COLL2222", json!({"name": "c"})));
        save(&store, ObjectRecord::new(LIB, ObjectKind::Item, "ITEM2222", json!({"itemType": "book"})));
        save(
            &store,
            ObjectRecord::new(
                LIB,
                ObjectKind::Item,
                "EDIT2222",
                json!({"itemType": "book", "tags": [{"tag": "old"}, {"tag": "keep"}]}),
            )
            .changed_by_user(),
        );

        let step = SyncDeletions {
            library_id: LIB,
            since_version: 4,
            current_version: Some(9),
        };
        let result = step.run(&context(api, store.clone(), SyncConfig::new(1))).await.unwrap();

        assert_eq!(result.version, 9);
        assert_eq!(result.conflicts, vec![Conflict::new("EDIT2222", "item")]);
        assert!(store.object(LIB, ObjectKind::Collection, "COLL2222").is_none());
        assert!(store.object(LIB, ObjectKind::Item, "ITEM2222").is_none());
        let kept = store.object(LIB, ObjectKind::Item, "EDIT2222").unwrap();
        assert_eq!(kept.data["tags"], json!([{"tag": "keep"}]));
    }

    #[tokio::test]
    async fn version_mismatch_applies_nothing() {
        let api = Arc::new(MockApiClient::new());
        api.push_response(ApiResponse::json(&json!({"items": ["ITEM2222"]}), 12));
        let store = Arc::new(MemoryStore::new());
        save(&store, ObjectRecord::new(LIB, ObjectKind::Item, "ITEM2222", json!({"itemType": "book"})));

        let step = SyncDeletions {
            library_id: LIB,
            since_version: 4,
            current_version: Some(11),
        };
        let error = step.run(&context(api, store.clone(), SyncConfig::new(1))).await.unwrap_err();
        assert!(matches!(error, SyncError::VersionMismatch(_)));
        assert!(store.object(LIB, ObjectKind::Item, "ITEM2222").is_some());
    }

    #[tokio::test]
    async fn restore_marks_conflicts_changed() {
        let store = Arc::new(MemoryStore::new());
        let mut deleted = ObjectRecord::new(LIB, ObjectKind::Search, "SRCH2222", json!({"name": "s", "conditions": []}));
        deleted.deleted = true;
        save(&store, deleted);

        let step = RestoreDeletions {
            library_id: LIB,
            conflicts: vec![Conflict::new("SRCH2222", "search")],
        };
        step.run(&context(Arc::new(MockApiClient::new()), store.clone(), SyncConfig::new(1)))
            .await
            .unwrap();

        let record = store.object(LIB, ObjectKind::Search, "SRCH2222").unwrap();
        assert!(record.changed);
        assert!(!record.deleted);
    }

    #[tokio::test]
    async fn submit_deletion_purges_and_bumps_version_together() {
        let api = Arc::new(MockApiClient::new());
        api.push_response(ApiResponse::new(204, "").with_version(15));
        let store = Arc::new(MemoryStore::new());
        let mut attachment = ObjectRecord::new(
            LIB,
            ObjectKind::Item,
            "ATTA2222",
            json!({"itemType": "attachment", "linkMode": "imported_file", "filename": "a.pdf"}),
        );
        attachment.deleted = true;
        save(&store, attachment);

        let step = SubmitDeletion {
            keys: vec!["ATTA2222".into()],
            object: SyncObject::Item,
            library_id: LIB,
            version: 14,
        };
        let ctx = context(api.clone(), store.clone(), SyncConfig::new(1).with_webdav(true));
        let result = step.run(&ctx).await.unwrap();

        assert_eq!(result.version, 15);
        assert!(result.did_create_webdav_deletions);
        assert!(store.object(LIB, ObjectKind::Item, "ATTA2222").is_none());
        assert_eq!(store.versions(LIB).items, 15);
        let webdav = store.transaction(|coordinator| Ok(coordinator.webdav_deletions(LIB))).unwrap();
        assert_eq!(webdav, vec!["ATTA2222".to_string()]);

        let request = &api.requests()[0];
        assert_eq!(request.method, Method::Delete);
        assert_eq!(request.since_version(), Some(14));
        assert_eq!(store.stats().transactions, 2);
    }

    #[tokio::test]
    async fn submit_deletion_library_conflict() {
        let api = Arc::new(MockApiClient::new());
        api.push_response(ApiResponse::new(412, ""));
        let store = Arc::new(MemoryStore::new());

        let step = SubmitDeletion {
            keys: vec!["COLL2222".into()],
            object: SyncObject::Collection,
            library_id: LIB,
            version: 3,
        };
        let error = step
            .run(&context(api, store, SyncConfig::new(1)))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            SyncError::Precondition(PreconditionErrorType::LibraryConflict)
        ));
    }
}
