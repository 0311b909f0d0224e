//! Object and group download steps.

use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use bibsync_protocol::{
    parse_objects, ApiRequest, Conflict, GroupResponse, LibraryIdentifier, ObjectParseError,
    SyncObject,
};
use bibsync_store::{Files, LocalStore, WriteRequest};
use serde_json::Value;

/// Result of fetching one batch of objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResult {
    /// Keys stored locally.
    pub stored: Vec<String>,
    /// Objects that could not be decoded; they were marked for resync.
    pub parse_errors: Vec<ObjectParseError>,
    /// Objects kept because of local edits.
    pub conflicts: Vec<Conflict>,
}

/// Downloads a batch of objects and stores them.
#[derive(Debug, Clone)]
pub struct FetchAndStoreObjects {
    /// Keys to fetch.
    pub keys: Vec<String>,
    /// Object type.
    pub object: SyncObject,
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Remote library version the batch must be read at.
    pub expected_version: Option<u64>,
}

impl FetchAndStoreObjects {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<FetchResult> {
        let kind = self
            .object
            .kind()
            .ok_or(SyncError::UnsupportedObject(self.object))?;

        let request = ApiRequest::objects(self.library_id, ctx.user_id(), self.object, &self.keys);
        let response = ctx.send(request).await?;

        if let Some(expected) = self.expected_version {
            if response.version() != expected {
                tracing::info!(
                    library = %self.library_id,
                    expected,
                    version = response.version(),
                    "library version changed during fetch"
                );
                return Err(SyncError::VersionMismatch(self.library_id));
            }
        }

        let json = response.json_value()?;
        let (objects, parse_errors) = parse_objects(self.object, &json, ctx.schema.as_ref())?;

        // Cached snapshots are what local edits revert to, so they must exist
        // before the parsed objects are committed.
        if let Some(raw_objects) = json.as_array() {
            for raw in raw_objects {
                let Some(key) = raw.get("key").and_then(Value::as_str) else {
                    continue;
                };
                let path = Files::json_cache(self.library_id, kind, key);
                ctx.files.write(&path, raw.to_string().as_bytes())?;
            }
        }

        for object in objects.iter().filter(|object| !object.issues.is_empty()) {
            tracing::warn!(key = %object.key, issues = ?object.issues, "object stored with field issues");
        }
        for error in &parse_errors {
            tracing::error!(key = ?error.key, message = %error.message, "object could not be parsed");
        }

        let failed_keys: Vec<String> = parse_errors.iter().filter_map(|error| error.key.clone()).collect();
        let keys: Vec<String> = objects.iter().map(|object| object.key.clone()).collect();
        let prefer_remote = ctx.config.prefer_remote_data;
        let attempted_at = ctx.now();

        let conflicts = ctx.store.transaction(|coordinator| {
            let conflicts = coordinator
                .perform(WriteRequest::StoreObjects {
                    library_id: self.library_id,
                    objects,
                    prefer_remote,
                })?
                .into_conflicts();
            if !failed_keys.is_empty() {
                coordinator.perform(WriteRequest::MarkForResync {
                    library_id: self.library_id,
                    kind,
                    keys: failed_keys,
                    attempted_at,
                })?;
            }
            Ok(conflicts)
        })?;

        let stored = keys
            .into_iter()
            .filter(|key| !conflicts.iter().any(|conflict| &conflict.key == key))
            .collect();

        Ok(FetchResult {
            stored,
            parse_errors,
            conflicts,
        })
    }
}

/// Downloads the metadata of a group library.
#[derive(Debug, Clone)]
pub struct FetchAndStoreGroup {
    /// Group id.
    pub group_id: i64,
}

impl FetchAndStoreGroup {
    /// Runs the step.
    pub async fn run<S: LocalStore>(&self, ctx: &SyncContext<S>) -> SyncResult<GroupResponse> {
        let response = ctx.send(ApiRequest::group(self.group_id)).await?;
        let group = GroupResponse::parse(&response.json_value()?)?;
        let user_id = ctx.user_id();

        ctx.store.perform(WriteRequest::StoreGroup {
            group_id: group.id,
            name: group.name.clone(),
            version: group.version,
            can_edit_metadata: group.can_edit_metadata(user_id),
            can_edit_files: group.can_edit_files(user_id),
        })?;
        tracing::info!(group = group.id, name = %group.name, "group stored");
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::transport::MockApiClient;
    use bibsync_protocol::{ApiResponse, ObjectKind};
    use bibsync_store::{FileStorage, MemoryFileStorage, MemoryStore, ObjectRecord, ObjectSyncState};
    use serde_json::json;
    use std::sync::Arc;

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    struct Fixture {
        api: Arc<MockApiClient>,
        store: Arc<MemoryStore>,
        files: Arc<MemoryFileStorage>,
        ctx: SyncContext<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let api = Arc::new(MockApiClient::new());
        let store = Arc::new(MemoryStore::new());
        let files = Arc::new(MemoryFileStorage::new());
        let ctx = SyncContext::new(SyncConfig::new(1), api.clone(), store.clone(), files.clone());
        Fixture { api, store, files, ctx }
    }

    fn collection(key: &str, version: u64) -> Value {
        json!({"key": key, "version": version, "data": {"key": key, "version": version, "name": key}})
    }

    fn step(keys: &[&str], expected: u64) -> FetchAndStoreObjects {
        FetchAndStoreObjects {
            keys: keys.iter().map(|key| key.to_string()).collect(),
            object: SyncObject::Collection,
            library_id: LIB,
            expected_version: Some(expected),
        }
    }

    #[tokio::test]
    async fn stores_objects_and_caches_json() {
        let f = fixture();
        f.api.push_response(ApiResponse::json(
            &json!([collection("AAAA2222", 3), collection("BBBB2222", 4)]),
            4,
        ));

        let result = step(&["AAAA2222", "BBBB2222"], 4).run(&f.ctx).await.unwrap();
        assert_eq!(result.stored, vec!["AAAA2222".to_string(), "BBBB2222".to_string()]);
        assert_eq!(f.store.object(LIB, ObjectKind::Collection, "BBBB2222").unwrap().version, 4);
        assert!(f.files.has(&Files::json_cache(LIB, ObjectKind::Collection, "AAAA2222")));
        assert_eq!(f.api.requests()[0].query_value("collectionKey"), Some("AAAA2222,BBBB2222"));
    }

    #[tokio::test]
    async fn version_mismatch_writes_nothing() {
        let f = fixture();
        f.api.push_response(ApiResponse::json(&json!([collection("AAAA2222", 11)]), 11));

        let error = step(&["AAAA2222"], 10).run(&f.ctx).await.unwrap_err();
        assert!(matches!(error, SyncError::VersionMismatch(_)));
        assert!(f.store.objects(LIB, ObjectKind::Collection).is_empty());
        assert!(f.files.paths().is_empty());
        assert_eq!(f.store.stats().transactions, 0);
    }

    #[tokio::test]
    async fn parse_errors_mark_objects_for_resync() {
        let f = fixture();
        let broken = json!({"key": "BADD2222", "version": 3, "data": {"parentCollection": false}});
        f.api.push_response(ApiResponse::json(&json!([collection("AAAA2222", 3), broken]), 3));

        let result = step(&["AAAA2222", "BADD2222"], 3).run(&f.ctx).await.unwrap();
        assert_eq!(result.stored, vec!["AAAA2222".to_string()]);
        assert_eq!(result.parse_errors.len(), 1);
        let dirty = f.store.object(LIB, ObjectKind::Collection, "BADD2222").unwrap();
        assert_eq!(dirty.sync_state, ObjectSyncState::Dirty);
    }

    #[tokio::test]
    async fn local_edits_are_reported_as_conflicts() {
        let f = fixture();
        let local = ObjectRecord::new(LIB, ObjectKind::Collection, "AAAA2222", json!({"name": "mine"}))
            .with_version(1)
            .changed_by_user();
        f.store.perform(WriteRequest::SaveObject(local)).unwrap();
        f.api.push_response(ApiResponse::json(&json!([collection("AAAA2222", 3)]), 3));

        let result = step(&["AAAA2222"], 3).run(&f.ctx).await.unwrap();
        assert!(result.stored.is_empty());
        assert_eq!(result.conflicts, vec![Conflict::new("AAAA2222", "collection")]);
        assert_eq!(f.store.object(LIB, ObjectKind::Collection, "AAAA2222").unwrap().data["name"], "mine");
    }

    #[tokio::test]
    async fn cache_failure_is_fatal() {
        let f = fixture();
        f.files.set_fail_writes(true);
        f.api.push_response(ApiResponse::json(&json!([collection("AAAA2222", 3)]), 3));

        let error = step(&["AAAA2222"], 3).run(&f.ctx).await.unwrap_err();
        assert!(matches!(error, SyncError::Store(_)));
        assert!(f.store.objects(LIB, ObjectKind::Collection).is_empty());
    }

    #[tokio::test]
    async fn group_permissions_are_stored() {
        let f = fixture();
        f.api.push_response(ApiResponse::json(
            &json!({
                "id": 12,
                "version": 5,
                "data": {"name": "Lab", "owner": 99, "libraryEditing": "admins", "fileEditing": "members"}
            }),
            5,
        ));

        let group = FetchAndStoreGroup { group_id: 12 }.run(&f.ctx).await.unwrap();
        assert_eq!(group.name, "Lab");
        let library = f.store.library(LibraryIdentifier::Group(12)).unwrap();
        assert!(!library.can_edit_metadata);
        assert!(library.can_edit_files);
        assert_eq!(library.group_version, 5);
    }
}
