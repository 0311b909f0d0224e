//! Sync orchestrator.

use crate::actions::{
    AttachmentBackend, DeleteGroup, FetchAndStoreGroup, FetchAndStoreObjects, FixUpload, LibraryData,
    LoadLibraryData, LoadUploadData, MarkChangesAsResolved, MarkGroupAsLocalOnly,
    RestoreDeletions, RevertLibraryFiles, RevertLibraryUpdates, StoreVersion, SubmitDeletion,
    SubmitSettings, SubmitUpdate, SyncDeletions, SyncGroupVersions, SyncSettings, SyncVersions,
    UploadAttachment, UploadOutcome,
};
use crate::context::SyncContext;
use crate::error::{ErrorScope, SyncError, SyncResult};
use bibsync_protocol::{
    Conflict, LibraryIdentifier, ObjectKind, SyncObject, SyncType, UpdateVersionType,
};
use bibsync_store::{LocalStore, StoreError, WriteRequest};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// The current state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not syncing.
    Idle,
    /// Syncing the list of group libraries.
    SyncingGroups,
    /// Syncing library contents.
    SyncingLibraries,
    /// The last sync completed.
    Synced,
    /// The last sync failed.
    Error,
}

impl SyncState {
    /// Returns true if a sync is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::SyncingGroups | SyncState::SyncingLibraries)
    }

    /// Returns true if a new sync can start.
    pub fn can_start_sync(&self) -> bool {
        !self.is_active()
    }
}

/// Statistics about sync runs.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed sync runs.
    pub cycles_completed: u64,
    /// Objects fetched and stored.
    pub objects_fetched: u64,
    /// Objects submitted.
    pub objects_submitted: u64,
    /// Attachment files uploaded or found already uploaded.
    pub files_uploaded: u64,
    /// Conflicts between local edits and remote changes.
    pub conflicts_encountered: u64,
    /// Library passes restarted after a version change.
    pub library_restarts: u64,
    /// Last successful sync time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Outcome of syncing one library.
#[derive(Debug)]
pub struct LibraryReport {
    /// Library.
    pub library_id: LibraryIdentifier,
    /// Remote library version reached.
    pub version: u64,
    /// Objects fetched and stored.
    pub fetched: usize,
    /// Objects submitted.
    pub submitted: usize,
    /// Attachment files uploaded or found already uploaded.
    pub uploaded: usize,
    /// Attachments whose missing local file was replaced by the remote one.
    pub repaired: usize,
    /// Conflicts between local edits and remote changes.
    pub conflicts: Vec<Conflict>,
    /// Errors limited to single objects; the pass continued.
    pub object_errors: Vec<SyncError>,
    /// Error that ended the pass early.
    pub failure: Option<SyncError>,
    /// How many times the pass restarted.
    pub restarts: u32,
    /// Whether some objects wait for a forced fetch.
    pub needs_resync: bool,
}

impl LibraryReport {
    fn new(library_id: LibraryIdentifier) -> Self {
        Self {
            library_id,
            version: 0,
            fetched: 0,
            submitted: 0,
            uploaded: 0,
            repaired: 0,
            conflicts: Vec::new(),
            object_errors: Vec::new(),
            failure: None,
            restarts: 0,
            needs_resync: false,
        }
    }

    fn record_object_error(&mut self, error: SyncError) {
        tracing::warn!(library = %self.library_id, error = %error, "object error");
        self.needs_resync = true;
        self.object_errors.push(error);
    }
}

/// Outcome of a sync run.
#[derive(Debug)]
pub struct SyncReport {
    /// Per-library outcomes.
    pub libraries: Vec<LibraryReport>,
    /// Group libraries fetched.
    pub groups_updated: Vec<i64>,
    /// Group libraries removed or kept as local-only.
    pub groups_removed: Vec<i64>,
    /// Duration of the run.
    pub duration: Duration,
}

impl SyncReport {
    /// Returns true if every library completed its pass.
    pub fn success(&self) -> bool {
        self.libraries.iter().all(|library| library.failure.is_none())
    }

    /// Returns the report of one library.
    pub fn library(&self, library_id: LibraryIdentifier) -> Option<&LibraryReport> {
        self.libraries.iter().find(|library| library.library_id == library_id)
    }
}

/// Drives sync runs over all libraries of a user.
///
/// Per library the pass runs settings, version diffs with fetches for each
/// object type, inbound deletions, outbound deletions, writes, settings
/// writes and attachment uploads. A pass restarts when the remote library
/// version moves underneath it, up to
/// [`SyncConfig::max_version_mismatch_retries`](crate::SyncConfig::max_version_mismatch_retries) times.
pub struct SyncController<S: LocalStore> {
    ctx: SyncContext<S>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    cancelled: AtomicBool,
}

impl<S: LocalStore> SyncController<S> {
    /// Creates a controller.
    pub fn new(ctx: SyncContext<S>) -> Self {
        Self {
            ctx,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns the context.
    pub fn context(&self) -> &SyncContext<S> {
        &self.ctx
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Cancels the running sync at the next step boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn fail(&self, error: SyncError) -> SyncError {
        self.set_state(SyncState::Error);
        self.stats.write().last_error = Some(error.to_string());
        error
    }

    /// Syncs every library.
    pub async fn sync(&self, sync_type: SyncType) -> SyncResult<SyncReport> {
        self.sync_libraries(sync_type, None).await
    }

    /// Syncs the given libraries, or all libraries when `library_ids` is `None`.
    pub async fn sync_libraries(
        &self,
        sync_type: SyncType,
        library_ids: Option<Vec<LibraryIdentifier>>,
    ) -> SyncResult<SyncReport> {
        {
            let mut state = self.state.write();
            if !state.can_start_sync() {
                return Err(SyncError::SyncInProgress);
            }
            *state = SyncState::SyncingGroups;
        }
        self.cancelled.store(false, Ordering::SeqCst);
        let start = Instant::now();

        let mut report = SyncReport {
            libraries: Vec::new(),
            groups_updated: Vec::new(),
            groups_removed: Vec::new(),
            duration: Duration::ZERO,
        };

        if self.ctx.config.sync_groups {
            if let Err(error) = self.sync_groups(&mut report).await {
                if error.scope() == ErrorScope::Sync {
                    return Err(self.fail(error));
                }
                tracing::warn!(error = %error, "group sync failed, syncing known libraries");
            }
        }
        if let Err(error) = self.check_cancelled() {
            return Err(self.fail(error));
        }

        self.set_state(SyncState::SyncingLibraries);
        let libraries = match (LoadLibraryData {
            library_ids,
            fetch_updates: false,
        })
        .run(&self.ctx)
        .await
        {
            Ok(libraries) => libraries,
            Err(error) => return Err(self.fail(error)),
        };

        let limit = self.ctx.config.max_concurrent_libraries.max(1);
        report.libraries = stream::iter(libraries)
            .map(|library| self.sync_library(library.identifier, sync_type))
            .buffer_unordered(limit)
            .collect()
            .await;
        report.libraries.sort_by_key(|library| library.library_id);

        let fatal = report
            .libraries
            .iter_mut()
            .find(|library| {
                library
                    .failure
                    .as_ref()
                    .is_some_and(|error| error.scope() == ErrorScope::Sync)
            })
            .and_then(|library| library.failure.take());
        if let Some(error) = fatal {
            return Err(self.fail(error));
        }

        report.duration = start.elapsed();
        {
            let mut stats = self.stats.write();
            stats.cycles_completed += 1;
            for library in &report.libraries {
                stats.objects_fetched += library.fetched as u64;
                stats.objects_submitted += library.submitted as u64;
                stats.files_uploaded += library.uploaded as u64;
                stats.conflicts_encountered += library.conflicts.len() as u64;
                stats.library_restarts += u64::from(library.restarts);
            }
            stats.last_sync_time = Some(Instant::now());
            stats.last_error = report
                .libraries
                .iter()
                .find_map(|library| library.failure.as_ref().map(ToString::to_string));
        }
        self.set_state(if report.success() {
            SyncState::Synced
        } else {
            SyncState::Error
        });

        tracing::info!(
            libraries = report.libraries.len(),
            success = report.success(),
            duration_ms = report.duration.as_millis() as u64,
            "sync finished"
        );
        Ok(report)
    }

    async fn sync_groups(&self, report: &mut SyncReport) -> SyncResult<()> {
        let groups = SyncGroupVersions.run(&self.ctx).await?;

        for group_id in groups.to_update {
            self.check_cancelled()?;
            FetchAndStoreGroup { group_id }.run(&self.ctx).await?;
            report.groups_updated.push(group_id);
        }

        for (group_id, name) in groups.to_remove {
            let library_id = LibraryIdentifier::Group(group_id);
            if self.has_local_changes(library_id)? {
                tracing::info!(group = group_id, name = %name, "access to group lost, keeping local changes");
                MarkGroupAsLocalOnly { group_id }.run(&self.ctx).await?;
            } else {
                DeleteGroup { group_id }.run(&self.ctx).await?;
            }
            report.groups_removed.push(group_id);
        }
        Ok(())
    }

    fn has_local_changes(&self, library_id: LibraryIdentifier) -> SyncResult<bool> {
        let changed = self.ctx.store.transaction(|coordinator| {
            Ok([ObjectKind::Collection, ObjectKind::Search, ObjectKind::Item]
                .into_iter()
                .any(|kind| {
                    coordinator
                        .objects(library_id, kind)
                        .iter()
                        .any(|record| record.is_pending_submission())
                }))
        })?;
        Ok(changed)
    }

    async fn sync_library(&self, library_id: LibraryIdentifier, sync_type: SyncType) -> LibraryReport {
        let mut report = LibraryReport::new(library_id);
        let max_restarts = self.ctx.config.max_version_mismatch_retries;

        loop {
            match self.library_pass(library_id, sync_type, &mut report).await {
                Ok(()) => break,
                Err(error) if error.restarts_library() && report.restarts < max_restarts => {
                    report.restarts += 1;
                    let delay = self.ctx.config.retry.delay_for_attempt(report.restarts);
                    tracing::info!(
                        library = %library_id,
                        restart = report.restarts,
                        error = %error,
                        "restarting library pass"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    tracing::error!(library = %library_id, error = %error, "library sync failed");
                    report.failure = Some(error);
                    break;
                }
            }
        }
        report
    }

    async fn load_library(&self, library_id: LibraryIdentifier, fetch_updates: bool) -> SyncResult<LibraryData> {
        LoadLibraryData {
            library_ids: Some(vec![library_id]),
            fetch_updates,
        }
        .run(&self.ctx)
        .await?
        .into_iter()
        .next()
        .ok_or(SyncError::Store(StoreError::LibraryNotFound(library_id)))
    }

    async fn library_pass(
        &self,
        library_id: LibraryIdentifier,
        sync_type: SyncType,
        report: &mut LibraryReport,
    ) -> SyncResult<()> {
        let ctx = &self.ctx;
        self.check_cancelled()?;
        let data = self.load_library(library_id, false).await?;
        tracing::debug!(library = %library_id, versions = ?data.versions, "library pass");

        if !data.can_edit_metadata {
            let failures = RevertLibraryUpdates { library_id }.run(ctx).await?;
            for (kind, keys) in failures {
                ctx.store.perform(WriteRequest::MarkForResync {
                    library_id,
                    kind,
                    keys,
                    attempted_at: ctx.now(),
                })?;
                report.needs_resync = true;
            }
            MarkChangesAsResolved { library_id }.run(ctx).await?;
        }
        if !data.can_edit_files {
            RevertLibraryFiles { library_id }.run(ctx).await?;
        }

        let mut current = None;
        if sync_type != SyncType::CollectionsOnly {
            let settings = SyncSettings {
                library_id,
                since_version: Some(data.versions.settings),
                current_version: None,
            }
            .run(ctx)
            .await?;
            current = Some(settings.version);
        }

        let objects: &[SyncObject] = if sync_type == SyncType::CollectionsOnly {
            &[SyncObject::Collection]
        } else {
            &SyncObject::LIBRARY_OBJECTS
        };
        for &object in objects {
            self.check_cancelled()?;
            let diff = SyncVersions {
                object,
                library_id,
                since_version: Some(data.versions.get(UpdateVersionType::Object(object))),
                current_version: current,
                sync_type,
                check_remote: true,
            }
            .run(ctx)
            .await?;
            current = Some(diff.version);
            self.fetch(library_id, object, diff.changed, diff.version, report)
                .await?;
            StoreVersion {
                library_id,
                version_type: UpdateVersionType::Object(object),
                version: diff.version,
            }
            .run(ctx)
            .await?;
        }

        if sync_type == SyncType::CollectionsOnly {
            report.version = current.unwrap_or(0);
            return Ok(());
        }

        self.check_cancelled()?;
        let deletions = SyncDeletions {
            library_id,
            since_version: data.versions.deletions,
            current_version: current,
        }
        .run(ctx)
        .await?;
        if !deletions.conflicts.is_empty() {
            self.resolve_deletion_conflicts(library_id, deletions.conflicts.clone())
                .await?;
            report.conflicts.extend(deletions.conflicts);
        }
        StoreVersion {
            library_id,
            version_type: UpdateVersionType::Deletions,
            version: deletions.version,
        }
        .run(ctx)
        .await?;
        let mut version = deletions.version;

        let pending = self.load_library(library_id, true).await?;

        for batch in pending.deletions {
            self.check_cancelled()?;
            let result = SubmitDeletion {
                keys: batch.keys,
                object: batch.object,
                library_id,
                version,
            }
            .run(ctx)
            .await?;
            version = result.version;
        }

        for batch in pending.updates {
            self.check_cancelled()?;
            let count = batch.parameters.len();
            let result = SubmitUpdate {
                parameters: batch.parameters,
                since_version: Some(version),
                object: batch.object,
                library_id,
                update_library_version: true,
            }
            .run(ctx)
            .await?;
            version = result.version;
            report.submitted += count;
            if let Some(error) = result.error {
                if error.scope() != ErrorScope::Object {
                    return Err(error);
                }
                report.record_object_error(error);
            }
        }

        if !pending.settings.is_empty() {
            version = SubmitSettings {
                library_id,
                settings: pending.settings,
                since_version: Some(version),
            }
            .run(ctx)
            .await?;
        }

        if pending.has_upload {
            self.upload(library_id, report).await?;
        }

        report.version = version;
        tracing::info!(
            library = %library_id,
            version,
            fetched = report.fetched,
            submitted = report.submitted,
            "library synced"
        );
        Ok(())
    }

    async fn fetch(
        &self,
        library_id: LibraryIdentifier,
        object: SyncObject,
        keys: Vec<String>,
        version: u64,
        report: &mut LibraryReport,
    ) -> SyncResult<()> {
        let max = self.ctx.config.download_batch_size.max(1);
        let mut size = self.ctx.config.initial_download_batch_size.clamp(1, max);
        let mut remaining = keys.as_slice();

        while !remaining.is_empty() {
            self.check_cancelled()?;
            let (batch, rest) = remaining.split_at(size.min(remaining.len()));
            remaining = rest;
            let result = FetchAndStoreObjects {
                keys: batch.to_vec(),
                object,
                library_id,
                expected_version: Some(version),
            }
            .run(&self.ctx)
            .await?;
            report.fetched += result.stored.len();
            report.needs_resync |= !result.parse_errors.is_empty();
            report.conflicts.extend(result.conflicts);
            size = (size * 2).min(max);
        }
        Ok(())
    }

    async fn resolve_deletion_conflicts(
        &self,
        library_id: LibraryIdentifier,
        conflicts: Vec<Conflict>,
    ) -> SyncResult<()> {
        if !self.ctx.config.prefer_remote_data {
            return RestoreDeletions {
                library_id,
                conflicts,
            }
            .run(&self.ctx)
            .await;
        }

        let requests: Vec<WriteRequest> = [ObjectKind::Collection, ObjectKind::Search, ObjectKind::Item]
            .into_iter()
            .filter_map(|kind| {
                let keys: Vec<String> = conflicts
                    .iter()
                    .filter(|conflict| ObjectKind::from_type_name(&conflict.object_type) == Some(kind))
                    .map(|conflict| conflict.key.clone())
                    .collect();
                (!keys.is_empty()).then_some(WriteRequest::PurgeObjects {
                    library_id,
                    kind,
                    keys,
                })
            })
            .collect();
        self.ctx.store.perform_batch(requests)?;
        Ok(())
    }

    async fn upload(&self, library_id: LibraryIdentifier, report: &mut LibraryReport) -> SyncResult<()> {
        let backend = if self.ctx.config.webdav_enabled && library_id == LibraryIdentifier::MY_LIBRARY {
            AttachmentBackend::WebDav
        } else {
            AttachmentBackend::Zfs
        };
        let uploads = LoadUploadData { library_id }.run(&self.ctx).await?;
        let limit = self.ctx.config.max_concurrent_uploads.max(1);

        let results: Vec<(String, SyncResult<UploadOutcome>)> = stream::iter(uploads)
            .map(|upload| async move {
                let key = upload.key.clone();
                (key, UploadAttachment { upload, backend }.run(&self.ctx).await)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for (key, result) in results {
            let result = match result {
                Err(error) if backend == AttachmentBackend::Zfs && local_file_missing(&error) => {
                    FixUpload { key, library_id }.run(&self.ctx).await.map(|()| {
                        report.repaired += 1;
                        report.needs_resync = true;
                    })
                }
                Ok(_) => {
                    report.uploaded += 1;
                    Ok(())
                }
                Err(error) => Err(error),
            };
            match result {
                Ok(()) => {}
                Err(error) if error.scope() == ErrorScope::Object => report.record_object_error(error),
                Err(error) => return Err(error),
            }
        }
        Ok(())
    }
}

fn local_file_missing(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Upload { source, failed_before_api_request: true }
            if matches!(**source, SyncError::AttachmentMissing { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SyncConfig};
    use crate::transport::MockApiClient;
    use crate::error::PreconditionErrorType;
    use bibsync_protocol::{ApiRequest, ApiResponse, Method, RequestBody};
    use bibsync_store::{MemoryFileStorage, MemoryStore, ObjectRecord, ObjectSyncState};
    use parking_lot::Mutex;
    use serde_json::{json, Map, Value};
    use std::sync::Arc;

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    fn controller(api: Arc<MockApiClient>, store: Arc<MemoryStore>) -> SyncController<MemoryStore> {
        let config = SyncConfig::new(1)
            .with_sync_groups(false)
            .with_retry(RetryConfig::no_retry());
        SyncController::new(SyncContext::new(config, api, store, Arc::new(MemoryFileStorage::new())))
    }

    /// Answers every read with an empty result at `version`.
    fn empty_library(version: Arc<Mutex<u64>>) -> impl Fn(&ApiRequest) -> SyncResult<ApiResponse> {
        move |request| {
            let version = *version.lock();
            let path = request.path().to_string();
            let body = match request.method {
                Method::Get if request.query_value("format") == Some("versions") => json!({}),
                Method::Get if path.ends_with("/deleted") => json!({}),
                Method::Get if path.ends_with("/settings") => json!({}),
                Method::Post => json!({"successful": {}, "unchanged": {}, "failed": {}}),
                _ => Value::Null,
            };
            Ok(ApiResponse::json(&body, version))
        }
    }

    #[test]
    fn state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(!SyncState::SyncingLibraries.can_start_sync());
        assert!(SyncState::SyncingGroups.is_active());
    }

    #[tokio::test]
    async fn empty_sync_advances_cursors() {
        let api = Arc::new(MockApiClient::new());
        api.set_handler(empty_library(Arc::new(Mutex::new(7))));
        let store = Arc::new(MemoryStore::new());
        let controller = controller(api, store.clone());

        let report = controller.sync(SyncType::Normal).await.unwrap();

        assert!(report.success());
        assert_eq!(report.library(LIB).unwrap().version, 7);
        let versions = store.versions(LIB);
        assert_eq!(versions.items, 7);
        assert_eq!(versions.trash, 7);
        assert_eq!(versions.deletions, 7);
        assert_eq!(versions.settings, 7);
        assert_eq!(controller.state(), SyncState::Synced);
        assert_eq!(controller.stats().cycles_completed, 1);
    }

    #[tokio::test]
    async fn version_change_restarts_the_library() {
        let api = Arc::new(MockApiClient::new());
        let version = Arc::new(Mutex::new(7));
        let calls = Arc::new(Mutex::new(0u32));
        let handler = empty_library(Arc::clone(&version));
        let bump = Arc::clone(&version);
        let counter = Arc::clone(&calls);
        api.set_handler(move |request| {
            let mut count = counter.lock();
            *count += 1;
            // Someone else writes while the first pass runs.
            if *count == 2 {
                *bump.lock() = 8;
            }
            drop(count);
            handler(request)
        });
        let store = Arc::new(MemoryStore::new());
        let controller = controller(api, store.clone());

        let report = controller.sync(SyncType::Normal).await.unwrap();

        let library = report.library(LIB).unwrap();
        assert!(library.failure.is_none());
        assert_eq!(library.restarts, 1);
        assert_eq!(store.versions(LIB).items, 8);
    }

    #[tokio::test]
    async fn restarts_are_bounded() {
        let api = Arc::new(MockApiClient::new());
        let version = Arc::new(Mutex::new(1u64));
        let handler = empty_library(Arc::clone(&version));
        api.set_handler(move |request| {
            *version.lock() += 1;
            handler(request)
        });
        let store = Arc::new(MemoryStore::new());
        let controller = controller(api, store);

        let report = controller.sync(SyncType::Normal).await.unwrap();

        let library = report.library(LIB).unwrap();
        assert_eq!(library.restarts, 3);
        assert!(matches!(library.failure, Some(SyncError::VersionMismatch(_))));
        assert!(!report.success());
        assert_eq!(controller.state(), SyncState::Error);
    }

    #[tokio::test]
    async fn writes_chain_versions() {
        let api = Arc::new(MockApiClient::new());
        let version = Arc::new(Mutex::new(5u64));
        let handler = empty_library(Arc::clone(&version));
        let bump = Arc::clone(&version);
        api.set_handler(move |request| {
            if request.method == Method::Post {
                *bump.lock() += 1;
            }
            handler(request)
        });
        let store = Arc::new(MemoryStore::new());
        for key in ["AAAA2222", "BBBB2222", "CCCC2222"] {
            let record = ObjectRecord::new(LIB, ObjectKind::Collection, key, json!({"name": key})).changed_by_user();
            store.perform(WriteRequest::SaveObject(record)).unwrap();
        }
        let config = SyncConfig::new(1)
            .with_sync_groups(false)
            .with_write_batch_size(2);
        let controller = SyncController::new(SyncContext::new(
            config,
            api.clone(),
            store,
            Arc::new(MemoryFileStorage::new()),
        ));

        let report = controller.sync(SyncType::Normal).await.unwrap();

        let writes: Vec<Option<u64>> = api
            .requests()
            .iter()
            .filter(|request| request.method == Method::Post)
            .map(ApiRequest::since_version)
            .collect();
        assert_eq!(writes, vec![Some(5), Some(6)]);
        assert_eq!(report.library(LIB).unwrap().submitted, 3);
        assert_eq!(report.library(LIB).unwrap().version, 7);
    }

    #[tokio::test]
    async fn object_conflict_does_not_stop_later_batches() {
        let api = Arc::new(MockApiClient::new());
        let version = Arc::new(Mutex::new(5u64));
        let handler = empty_library(Arc::clone(&version));
        let bump = Arc::clone(&version);
        api.set_handler(move |request| {
            if request.method != Method::Post {
                return handler(request);
            }
            let mut version = bump.lock();
            *version += 1;
            let entries = match &request.body {
                RequestBody::Json(Value::Array(entries)) => entries.clone(),
                _ => Vec::new(),
            };
            let mut successful = Map::new();
            let mut failed = Map::new();
            for (index, entry) in entries.iter().enumerate() {
                let key = entry["key"].as_str().unwrap_or_default();
                if key == "AAAA2222" {
                    failed.insert(
                        index.to_string(),
                        json!({"key": key, "code": 412, "message": "Collection has been modified"}),
                    );
                } else {
                    successful.insert(
                        index.to_string(),
                        json!({"key": key, "version": *version, "data": {
                            "key": key, "version": *version, "name": key, "parentCollection": false
                        }}),
                    );
                }
            }
            Ok(ApiResponse::json(
                &json!({"successful": successful, "unchanged": {}, "failed": failed}),
                *version,
            ))
        });
        let store = Arc::new(MemoryStore::new());
        for key in ["AAAA2222", "BBBB2222", "CCCC2222"] {
            let record = ObjectRecord::new(LIB, ObjectKind::Collection, key, json!({"name": key})).changed_by_user();
            store.perform(WriteRequest::SaveObject(record)).unwrap();
        }
        let config = SyncConfig::new(1)
            .with_sync_groups(false)
            .with_write_batch_size(1);
        let controller = SyncController::new(SyncContext::new(
            config,
            api.clone(),
            store.clone(),
            Arc::new(MemoryFileStorage::new()),
        ));

        let report = controller.sync(SyncType::Normal).await.unwrap();

        let posts = api
            .requests()
            .iter()
            .filter(|request| request.method == Method::Post)
            .count();
        assert_eq!(posts, 3);
        let library = report.library(LIB).unwrap();
        assert!(library.failure.is_none());
        assert!(library.needs_resync);
        assert!(matches!(
            library.object_errors.as_slice(),
            [SyncError::Precondition(PreconditionErrorType::ObjectConflict)]
        ));
        assert_eq!(library.submitted, 3);
        assert_eq!(library.version, 8);
        for key in ["BBBB2222", "CCCC2222"] {
            assert!(!store.object(LIB, ObjectKind::Collection, key).unwrap().changed);
        }
        let conflicted = store.object(LIB, ObjectKind::Collection, "AAAA2222").unwrap();
        assert_eq!(conflicted.sync_state, ObjectSyncState::Dirty);
    }

    #[tokio::test]
    async fn forbidden_aborts_the_sync() {
        let api = Arc::new(MockApiClient::new());
        api.set_handler(|_| Ok(ApiResponse::new(403, "Forbidden")));
        let controller = controller(api, Arc::new(MemoryStore::new()));

        let error = controller.sync(SyncType::Normal).await.unwrap_err();
        assert!(matches!(error, SyncError::Http { status: 403, .. }));
        assert_eq!(controller.state(), SyncState::Error);
        assert!(controller.stats().last_error.is_some());
    }

    #[tokio::test]
    async fn cancelled_controller_reports_cancellation() {
        let api = Arc::new(MockApiClient::new());
        let controller = Arc::new(controller(api.clone(), Arc::new(MemoryStore::new())));
        let cancel = Arc::clone(&controller);
        api.set_handler(move |request| {
            cancel.cancel();
            empty_library(Arc::new(Mutex::new(3)))(request)
        });

        let error = controller.sync(SyncType::Normal).await.unwrap_err();
        assert!(matches!(error, SyncError::Cancelled));
    }
}
