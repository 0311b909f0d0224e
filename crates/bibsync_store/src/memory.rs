//! In-memory local store.

use crate::error::{StoreError, StoreResult};
use crate::record::{
    generate_key, LibraryRecord, ObjectRecord, ObjectSyncState, SettingRecord,
};
use crate::request::{WriteOutcome, WriteRequest};
use crate::split::split_position;
use crate::store::{Coordinator, LocalStore};
use bibsync_protocol::{Conflict, LibraryIdentifier, ObjectKind};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

type ObjectId = (LibraryIdentifier, ObjectKind, String);

#[derive(Debug, Clone, Default)]
struct StoreState {
    libraries: BTreeMap<LibraryIdentifier, LibraryRecord>,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    settings: BTreeMap<(LibraryIdentifier, String), SettingRecord>,
    webdav_deletions: BTreeSet<(LibraryIdentifier, String)>,
}

/// Counters describing what the store committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Committed transactions.
    pub transactions: u64,
    /// Aborted transactions.
    pub aborted: u64,
    /// Committed write requests.
    pub writes: u64,
    /// Committed version cursor moves.
    pub version_bumps: u64,
    /// Committed write requests by name.
    pub writes_by_name: BTreeMap<&'static str, u64>,
}

impl StoreStats {
    /// Returns how many committed requests had the given name.
    pub fn count(&self, name: &str) -> u64 {
        self.writes_by_name.get(name).copied().unwrap_or(0)
    }
}

/// A local store kept in memory.
///
/// Transactions run on a copy of the state that replaces the committed state
/// only when the transaction succeeds. Suitable for:
/// - Unit and integration tests
/// - Ephemeral sync sessions that don't need persistence
///
/// # Example
///
/// ```rust
/// use bibsync_protocol::{LibraryIdentifier, SyncObject, UpdateVersionType};
/// use bibsync_store::{LocalStore, MemoryStore, WriteRequest};
///
/// let store = MemoryStore::new();
/// store
///     .perform(WriteRequest::SetVersion {
///         library_id: LibraryIdentifier::MY_LIBRARY,
///         version_type: UpdateVersionType::Object(SyncObject::Item),
///         version: 12,
///     })
///     .unwrap();
/// assert_eq!(store.versions(LibraryIdentifier::MY_LIBRARY).items, 12);
/// ```
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    stats: Mutex<StoreStats>,
    fail_countdown: Mutex<Option<u64>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates a store containing only the personal library.
    #[must_use]
    pub fn new() -> Self {
        let mut state = StoreState::default();
        state.libraries.insert(
            LibraryIdentifier::MY_LIBRARY,
            LibraryRecord::new(LibraryIdentifier::MY_LIBRARY, "My Library"),
        );
        Self {
            state: Mutex::new(state),
            stats: Mutex::new(StoreStats::default()),
            fail_countdown: Mutex::new(None),
        }
    }

    /// Makes the `nth` transaction from now (1-based) abort without committing.
    pub fn fail_transaction(&self, nth: u64) {
        *self.fail_countdown.lock() = Some(nth.max(1));
    }

    /// Returns commit statistics.
    pub fn stats(&self) -> StoreStats {
        self.stats.lock().clone()
    }

    /// Returns a committed object.
    pub fn object(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> Option<ObjectRecord> {
        self.state
            .lock()
            .objects
            .get(&(library_id, kind, key.to_string()))
            .cloned()
    }

    /// Returns all committed objects of one kind.
    pub fn objects(&self, library_id: LibraryIdentifier, kind: ObjectKind) -> Vec<ObjectRecord> {
        let state = self.state.lock();
        MemoryCoordinator::objects_of(&state, library_id, kind)
    }

    /// Returns committed version cursors.
    pub fn versions(&self, library_id: LibraryIdentifier) -> bibsync_protocol::Versions {
        self.state
            .lock()
            .libraries
            .get(&library_id)
            .map(|library| library.versions)
            .unwrap_or_default()
    }

    /// Returns a committed library.
    pub fn library(&self, library_id: LibraryIdentifier) -> Option<LibraryRecord> {
        self.state.lock().libraries.get(&library_id).cloned()
    }

    fn should_fail(&self) -> bool {
        let mut countdown = self.fail_countdown.lock();
        match *countdown {
            Some(1) => {
                *countdown = None;
                true
            }
            Some(remaining) => {
                *countdown = Some(remaining - 1);
                false
            }
            None => false,
        }
    }
}

impl LocalStore for MemoryStore {
    fn transaction<R, F>(&self, f: F) -> StoreResult<R>
    where
        F: FnOnce(&mut dyn Coordinator) -> StoreResult<R>,
    {
        let mut committed = self.state.lock();
        let mut coordinator = MemoryCoordinator {
            state: committed.clone(),
            stats: StoreStats::default(),
        };

        let result = f(&mut coordinator);
        let fail = self.should_fail();
        let mut stats = self.stats.lock();

        match result {
            Ok(value) if !fail => {
                *committed = coordinator.state;
                stats.transactions += 1;
                stats.writes += coordinator.stats.writes;
                stats.version_bumps += coordinator.stats.version_bumps;
                for (name, count) in coordinator.stats.writes_by_name {
                    *stats.writes_by_name.entry(name).or_insert(0) += count;
                }
                Ok(value)
            }
            Ok(_) => {
                stats.aborted += 1;
                tracing::debug!("transaction aborted by injected failure");
                Err(StoreError::TransactionAborted("injected failure".into()))
            }
            Err(error) => {
                stats.aborted += 1;
                tracing::debug!(error = %error, "transaction rolled back");
                Err(error)
            }
        }
    }
}

struct MemoryCoordinator {
    state: StoreState,
    stats: StoreStats,
}

impl MemoryCoordinator {
    fn objects_of(state: &StoreState, library_id: LibraryIdentifier, kind: ObjectKind) -> Vec<ObjectRecord> {
        state
            .objects
            .values()
            .filter(|record| record.library_id == library_id && record.kind == kind)
            .cloned()
            .collect()
    }

    fn id(library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> ObjectId {
        (library_id, kind, key.to_string())
    }

    fn library_mut(&mut self, library_id: LibraryIdentifier) -> &mut LibraryRecord {
        self.state
            .libraries
            .entry(library_id)
            .or_insert_with(|| LibraryRecord::new(library_id, library_id.to_string()))
    }

    fn children(&self, record: &ObjectRecord) -> Vec<String> {
        self.state
            .objects
            .values()
            .filter(|child| {
                child.library_id == record.library_id
                    && child.kind == record.kind
                    && child.parent.as_deref() == Some(record.key.as_str())
            })
            .map(|child| child.key.clone())
            .collect()
    }

    fn remove_with_children(&mut self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str) {
        let mut pending = vec![key.to_string()];
        while let Some(key) = pending.pop() {
            if let Some(record) = self.state.objects.remove(&Self::id(library_id, kind, &key)) {
                pending.extend(self.children(&record));
            }
        }
    }

    fn store_objects(
        &mut self,
        library_id: LibraryIdentifier,
        objects: Vec<bibsync_protocol::ObjectResponse>,
        prefer_remote: bool,
    ) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for response in objects {
            let id = Self::id(library_id, response.kind, &response.key);
            match self.state.objects.get_mut(&id) {
                Some(record) if record.is_pending_submission() && !prefer_remote => {
                    conflicts.push(Conflict::new(response.key.clone(), response.kind.type_name()));
                }
                Some(record) => record.apply_response(&response),
                None => {
                    self.state
                        .objects
                        .insert(id, ObjectRecord::from_response(library_id, &response));
                }
            }
        }
        conflicts
    }

    fn delete_objects(&mut self, library_id: LibraryIdentifier, kind: ObjectKind, keys: &[String]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for key in keys {
            let Some(record) = self.state.objects.get(&Self::id(library_id, kind, key)) else {
                continue;
            };
            if record.changed {
                conflicts.push(Conflict::new(key.clone(), kind.type_name()));
                continue;
            }
            self.remove_with_children(library_id, kind, key);
        }
        conflicts
    }

    fn delete_tags(&mut self, library_id: LibraryIdentifier, names: &[String]) {
        for record in self.state.objects.values_mut() {
            if record.library_id != library_id || record.kind != ObjectKind::Item {
                continue;
            }
            if let Some(tags) = record.data.get_mut("tags").and_then(Value::as_array_mut) {
                tags.retain(|tag| {
                    let name = tag.get("tag").and_then(Value::as_str).unwrap_or_default();
                    !names.iter().any(|deleted| deleted == name)
                });
            }
        }
    }

    fn split_annotations(
        &mut self,
        library_id: LibraryIdentifier,
        keys: Vec<String>,
        attempted_at: u64,
    ) -> (Vec<String>, Vec<String>) {
        let mut created = Vec::new();
        let mut resync = Vec::new();

        for key in keys {
            let id = Self::id(library_id, ObjectKind::Item, &key);
            let Some(record) = self.state.objects.get(&id).cloned() else {
                resync.push(key);
                continue;
            };
            let annotation_type = record
                .data
                .get("annotationType")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let positions = record
                .data
                .get("annotationPosition")
                .and_then(|position| split_position(annotation_type, position));
            let Some(positions) = positions else {
                resync.push(key);
                continue;
            };

            for position in positions {
                let new_key = generate_key();
                let mut data = record.data.clone();
                if let Some(map) = data.as_object_mut() {
                    map.insert("annotationPosition".into(), position);
                    map.insert("key".into(), Value::String(new_key.clone()));
                    map.remove("version");
                }
                let mut split = ObjectRecord::new(library_id, ObjectKind::Item, new_key.clone(), data);
                split.changed = true;
                self.state
                    .objects
                    .insert(Self::id(library_id, ObjectKind::Item, &new_key), split);
                created.push(new_key);
            }

            if record.version == 0 {
                self.state.objects.remove(&id);
            } else if let Some(original) = self.state.objects.get_mut(&id) {
                original.changed = false;
                original.deleted = true;
            }
        }

        if !resync.is_empty() {
            self.mark_for_resync(library_id, ObjectKind::Item, &resync, attempted_at);
        }
        (created, resync)
    }

    fn mark_for_resync(&mut self, library_id: LibraryIdentifier, kind: ObjectKind, keys: &[String], attempted_at: u64) {
        for key in keys {
            let record = self
                .state
                .objects
                .entry(Self::id(library_id, kind, key))
                .or_insert_with(|| ObjectRecord::new(library_id, kind, key.clone(), Value::Object(Default::default())));
            record.sync_state = ObjectSyncState::Dirty;
            record.sync_retries += 1;
            record.last_sync_attempt = Some(attempted_at);
        }
    }

    fn record_write(&mut self, name: &'static str) {
        self.stats.writes += 1;
        *self.stats.writes_by_name.entry(name).or_insert(0) += 1;
    }
}

impl Coordinator for MemoryCoordinator {
    fn library(&self, library_id: LibraryIdentifier) -> Option<LibraryRecord> {
        self.state.libraries.get(&library_id).cloned()
    }

    fn libraries(&self) -> Vec<LibraryRecord> {
        self.state.libraries.values().cloned().collect()
    }

    fn object(&self, library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> Option<ObjectRecord> {
        self.state.objects.get(&Self::id(library_id, kind, key)).cloned()
    }

    fn objects(&self, library_id: LibraryIdentifier, kind: ObjectKind) -> Vec<ObjectRecord> {
        Self::objects_of(&self.state, library_id, kind)
    }

    fn settings(&self, library_id: LibraryIdentifier) -> Vec<SettingRecord> {
        self.state
            .settings
            .iter()
            .filter(|((library, _), _)| *library == library_id)
            .map(|(_, setting)| setting.clone())
            .collect()
    }

    fn webdav_deletions(&self, library_id: LibraryIdentifier) -> Vec<String> {
        self.state
            .webdav_deletions
            .iter()
            .filter(|(library, _)| *library == library_id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    fn perform(&mut self, request: WriteRequest) -> StoreResult<WriteOutcome> {
        let name = request.name();
        let outcome = match request {
            WriteRequest::StoreObjects {
                library_id,
                objects,
                prefer_remote,
            } => WriteOutcome::Conflicts(self.store_objects(library_id, objects, prefer_remote)),

            WriteRequest::UpdateFromResponse { library_id, object } => {
                self.store_objects(library_id, vec![object], true);
                WriteOutcome::Done
            }

            WriteRequest::MarkSynced {
                library_id,
                kind,
                keys,
                version,
            } => {
                for key in keys {
                    if let Some(record) = self.state.objects.get_mut(&Self::id(library_id, kind, &key)) {
                        record.changed = false;
                        record.version = version;
                    }
                }
                WriteOutcome::Done
            }

            WriteRequest::MarkForResync {
                library_id,
                kind,
                keys,
                attempted_at,
            } => {
                self.mark_for_resync(library_id, kind, &keys, attempted_at);
                WriteOutcome::Done
            }

            WriteRequest::MarkChangedByUser {
                library_id,
                kind,
                keys,
            } => {
                for key in keys {
                    if let Some(record) = self.state.objects.get_mut(&Self::id(library_id, kind, &key)) {
                        record.changed = true;
                        record.deleted = false;
                    }
                }
                WriteOutcome::Done
            }

            WriteRequest::SetVersion {
                library_id,
                version_type,
                version,
            } => {
                let changed = self.library_mut(library_id).versions.advance(version_type, version);
                if changed {
                    self.stats.version_bumps += 1;
                }
                WriteOutcome::VersionChanged(changed)
            }

            WriteRequest::DeleteObjects {
                library_id,
                kind,
                keys,
            } => WriteOutcome::Conflicts(self.delete_objects(library_id, kind, &keys)),

            WriteRequest::DeleteTags { library_id, names } => {
                self.delete_tags(library_id, &names);
                WriteOutcome::Done
            }

            WriteRequest::PurgeObjects {
                library_id,
                kind,
                keys,
            } => {
                for key in keys {
                    self.state.objects.remove(&Self::id(library_id, kind, &key));
                }
                WriteOutcome::Done
            }

            WriteRequest::SaveObject(record) => {
                self.library_mut(record.library_id);
                self.state.objects.insert(
                    Self::id(record.library_id, record.kind, &record.key),
                    record,
                );
                WriteOutcome::Done
            }

            WriteRequest::MarkAttachmentUploaded {
                library_id,
                key,
                version,
            } => {
                let record = self
                    .state
                    .objects
                    .get_mut(&Self::id(library_id, ObjectKind::Item, &key))
                    .ok_or_else(|| StoreError::Corrupted(format!("attachment {} not found", key)))?;
                if let Some(attachment) = record.attachment.as_mut() {
                    attachment.upload_pending = false;
                }
                if let Some(version) = version {
                    record.version = record.version.max(version);
                }
                WriteOutcome::Done
            }

            WriteRequest::SplitAnnotations {
                library_id,
                keys,
                attempted_at,
            } => {
                let (created, resync) = self.split_annotations(library_id, keys, attempted_at);
                WriteOutcome::Split { created, resync }
            }

            WriteRequest::CreateWebDavDeletions { library_id, keys } => {
                for key in keys {
                    self.state.webdav_deletions.insert((library_id, key));
                }
                WriteOutcome::Done
            }

            WriteRequest::MarkChangesResolved { library_id } => {
                self.state
                    .objects
                    .retain(|(library, _, _), record| *library != library_id || !record.deleted);
                for record in self.state.objects.values_mut() {
                    if record.library_id == library_id {
                        record.changed = false;
                    }
                }
                for ((library, _), setting) in self.state.settings.iter_mut() {
                    if *library == library_id {
                        setting.changed = false;
                    }
                }
                WriteOutcome::Done
            }

            WriteRequest::StoreGroup {
                group_id,
                name,
                version,
                can_edit_metadata,
                can_edit_files,
            } => {
                let library = self.library_mut(LibraryIdentifier::Group(group_id));
                library.name = name;
                library.group_version = version;
                library.can_edit_metadata = can_edit_metadata;
                library.can_edit_files = can_edit_files;
                library.local_only = false;
                WriteOutcome::Done
            }

            WriteRequest::DeleteGroup { group_id } => {
                let library_id = LibraryIdentifier::Group(group_id);
                self.state.libraries.remove(&library_id);
                self.state.objects.retain(|(library, _, _), _| *library != library_id);
                self.state.settings.retain(|(library, _), _| *library != library_id);
                self.state.webdav_deletions.retain(|(library, _)| *library != library_id);
                WriteOutcome::Done
            }

            WriteRequest::MarkGroupLocalOnly { group_id } => {
                let library = self
                    .state
                    .libraries
                    .get_mut(&LibraryIdentifier::Group(group_id))
                    .ok_or(StoreError::LibraryNotFound(LibraryIdentifier::Group(group_id)))?;
                library.local_only = true;
                library.can_edit_metadata = false;
                library.can_edit_files = false;
                WriteOutcome::Done
            }

            WriteRequest::StoreSettings { library_id, settings } => {
                for (key, setting) in settings {
                    let entry = self.state.settings.entry((library_id, key.clone()));
                    let record = entry.or_insert_with(|| SettingRecord {
                        key,
                        value: Value::Null,
                        version: 0,
                        changed: false,
                    });
                    if record.changed {
                        continue;
                    }
                    record.value = setting.value;
                    record.version = setting.version;
                }
                WriteOutcome::Done
            }

            WriteRequest::ChangeSetting {
                library_id,
                key,
                value,
            } => {
                let record = self
                    .state
                    .settings
                    .entry((library_id, key.clone()))
                    .or_insert_with(|| SettingRecord {
                        key,
                        value: Value::Null,
                        version: 0,
                        changed: false,
                    });
                record.value = value;
                record.changed = true;
                WriteOutcome::Done
            }

            WriteRequest::MarkSettingsSynced {
                library_id,
                keys,
                version,
            } => {
                for key in keys {
                    if let Some(setting) = self.state.settings.get_mut(&(library_id, key)) {
                        setting.changed = false;
                        setting.version = version;
                    }
                }
                WriteOutcome::Done
            }

            WriteRequest::DeleteSettings { library_id, keys } => {
                for key in keys {
                    self.state.settings.remove(&(library_id, key));
                }
                WriteOutcome::Done
            }
        };
        self.record_write(name);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bibsync_protocol::{ObjectResponse, SyncObject, UpdateVersionType};
    use serde_json::json;

    fn item(key: &str, version: u64) -> ObjectResponse {
        ObjectResponse {
            key: key.into(),
            version,
            kind: ObjectKind::Item,
            data: json!({"itemType": "book", "title": key}),
            trash: false,
            parent: None,
            issues: Vec::new(),
        }
    }

    const LIB: LibraryIdentifier = LibraryIdentifier::MY_LIBRARY;

    #[test]
    fn failed_transaction_commits_nothing() {
        let store = MemoryStore::new();
        let result: StoreResult<()> = store.transaction(|coordinator| {
            coordinator.perform(WriteRequest::StoreObjects {
                library_id: LIB,
                objects: vec![item("AAAA2222", 1)],
                prefer_remote: false,
            })?;
            Err(StoreError::Corrupted("boom".into()))
        });
        assert!(result.is_err());
        assert!(store.object(LIB, ObjectKind::Item, "AAAA2222").is_none());
        assert_eq!(store.stats().aborted, 1);
    }

    #[test]
    fn injected_failure_hits_the_nth_transaction() {
        let store = MemoryStore::new();
        store.fail_transaction(2);

        let store_one = |key: &str| {
            store.perform(WriteRequest::StoreObjects {
                library_id: LIB,
                objects: vec![item(key, 1)],
                prefer_remote: false,
            })
        };
        assert!(store_one("AAAA2222").is_ok());
        assert!(matches!(store_one("BBBB2222"), Err(StoreError::TransactionAborted(_))));
        assert!(store_one("CCCC2222").is_ok());

        assert!(store.object(LIB, ObjectKind::Item, "BBBB2222").is_none());
        assert_eq!(store.objects(LIB, ObjectKind::Item).len(), 2);
    }

    #[test]
    fn reads_see_earlier_writes_in_same_transaction() {
        let store = MemoryStore::new();
        let seen = store
            .transaction(|coordinator| {
                coordinator.perform(WriteRequest::StoreObjects {
                    library_id: LIB,
                    objects: vec![item("AAAA2222", 4)],
                    prefer_remote: false,
                })?;
                Ok(coordinator.object(LIB, ObjectKind::Item, "AAAA2222").map(|record| record.version))
            })
            .unwrap();
        assert_eq!(seen, Some(4));
    }

    #[test]
    fn set_version_counts_only_real_bumps() {
        let store = MemoryStore::new();
        let set = |version| WriteRequest::SetVersion {
            library_id: LIB,
            version_type: UpdateVersionType::Object(SyncObject::Collection),
            version,
        };
        assert_eq!(store.perform(set(5)).unwrap(), WriteOutcome::VersionChanged(true));
        assert_eq!(store.perform(set(5)).unwrap(), WriteOutcome::VersionChanged(false));
        assert_eq!(store.perform(set(3)).unwrap(), WriteOutcome::VersionChanged(false));
        assert_eq!(store.versions(LIB).collections, 5);
        assert_eq!(store.stats().version_bumps, 1);
    }

    #[test]
    fn store_objects_reports_local_edits_as_conflicts() {
        let store = MemoryStore::new();
        let local = ObjectRecord::from_response(LIB, &item("AAAA2222", 1)).changed_by_user();
        store.perform(WriteRequest::SaveObject(local)).unwrap();

        let outcome = store
            .perform(WriteRequest::StoreObjects {
                library_id: LIB,
                objects: vec![item("AAAA2222", 2), item("BBBB2222", 2)],
                prefer_remote: false,
            })
            .unwrap();
        assert_eq!(outcome.into_conflicts(), vec![Conflict::new("AAAA2222", "item")]);
        assert_eq!(store.object(LIB, ObjectKind::Item, "AAAA2222").unwrap().version, 1);
        assert_eq!(store.object(LIB, ObjectKind::Item, "BBBB2222").unwrap().version, 2);
    }

    #[test]
    fn delete_objects_removes_children_and_keeps_edited() {
        let store = MemoryStore::new();
        let parent = ObjectRecord::from_response(LIB, &item("PARE2222", 1));
        let mut child = ObjectRecord::from_response(LIB, &item("CHIL2222", 1));
        child.parent = Some("PARE2222".into());
        let edited = ObjectRecord::from_response(LIB, &item("EDIT2222", 1)).changed_by_user();
        for record in [parent, child, edited] {
            store.perform(WriteRequest::SaveObject(record)).unwrap();
        }

        let conflicts = store
            .perform(WriteRequest::DeleteObjects {
                library_id: LIB,
                kind: ObjectKind::Item,
                keys: vec!["PARE2222".into(), "EDIT2222".into(), "MISS2222".into()],
            })
            .unwrap()
            .into_conflicts();

        assert_eq!(conflicts, vec![Conflict::new("EDIT2222", "item")]);
        assert!(store.object(LIB, ObjectKind::Item, "CHIL2222").is_none());
        assert!(store.object(LIB, ObjectKind::Item, "EDIT2222").is_some());
    }

    #[test]
    fn mark_for_resync_creates_placeholders_and_counts_retries() {
        let store = MemoryStore::new();
        let request = || WriteRequest::MarkForResync {
            library_id: LIB,
            kind: ObjectKind::Collection,
            keys: vec!["COLL2222".into()],
            attempted_at: 100,
        };
        store.perform(request()).unwrap();
        store.perform(request()).unwrap();

        let record = store.object(LIB, ObjectKind::Collection, "COLL2222").unwrap();
        assert_eq!(record.sync_state, ObjectSyncState::Dirty);
        assert_eq!(record.sync_retries, 2);
        assert_eq!(record.last_sync_attempt, Some(100));
    }

    #[test]
    fn split_annotation_creates_new_items() {
        let store = MemoryStore::new();
        let data = json!({
            "itemType": "annotation",
            "annotationType": "highlight",
            "parentItem": "PDF22222",
            "annotationPosition": "{\"pageIndex\":1,\"rects\":[[1,2,3,4],[5,6,7,8]]}"
        });
        let synced = ObjectRecord::new(LIB, ObjectKind::Item, "ANNO2222", data.clone()).with_version(7);
        let single = ObjectRecord::new(
            LIB,
            ObjectKind::Item,
            "ANNO3333",
            json!({"itemType": "annotation", "annotationType": "note", "annotationPosition": "{}"}),
        );
        store.perform(WriteRequest::SaveObject(synced.changed_by_user())).unwrap();
        store.perform(WriteRequest::SaveObject(single.changed_by_user())).unwrap();

        let outcome = store
            .perform(WriteRequest::SplitAnnotations {
                library_id: LIB,
                keys: vec!["ANNO2222".into(), "ANNO3333".into()],
                attempted_at: 10,
            })
            .unwrap();
        let WriteOutcome::Split { created, resync } = outcome else {
            panic!("unexpected outcome");
        };
        assert_eq!(created.len(), 2);
        assert_eq!(resync, vec!["ANNO3333".to_string()]);

        let original = store.object(LIB, ObjectKind::Item, "ANNO2222").unwrap();
        assert!(original.deleted);
        for key in created {
            let record = store.object(LIB, ObjectKind::Item, &key).unwrap();
            assert!(record.changed);
            assert_eq!(record.parent.as_deref(), Some("PDF22222"));
        }
        let unsplit = store.object(LIB, ObjectKind::Item, "ANNO3333").unwrap();
        assert_eq!(unsplit.sync_state, ObjectSyncState::Dirty);
    }

    #[test]
    fn oversized_annotation_is_marked_for_resync() {
        let store = MemoryStore::new();
        let huge: Vec<f64> = (0..20_000).map(|value| value as f64 + 0.5).collect();
        let position = json!({"pageIndex": 0, "width": 2, "paths": [[1.0, 2.0], huge]}).to_string();
        let record = ObjectRecord::new(
            LIB,
            ObjectKind::Item,
            "INKK2222",
            json!({"itemType": "annotation", "annotationType": "ink", "annotationPosition": position}),
        )
        .with_version(4);
        store.perform(WriteRequest::SaveObject(record.changed_by_user())).unwrap();

        let outcome = store
            .perform(WriteRequest::SplitAnnotations {
                library_id: LIB,
                keys: vec!["INKK2222".into()],
                attempted_at: 10,
            })
            .unwrap();
        let WriteOutcome::Split { created, resync } = outcome else {
            panic!("unexpected outcome");
        };
        assert!(created.is_empty());
        assert_eq!(resync, vec!["INKK2222".to_string()]);
        let record = store.object(LIB, ObjectKind::Item, "INKK2222").unwrap();
        assert!(!record.deleted);
        assert_eq!(record.sync_state, ObjectSyncState::Dirty);
        assert_eq!(store.objects(LIB, ObjectKind::Item).len(), 1);
    }

    #[test]
    fn delete_group_removes_library_data() {
        let store = MemoryStore::new();
        let group = LibraryIdentifier::Group(9);
        store
            .perform(WriteRequest::StoreGroup {
                group_id: 9,
                name: "Lab".into(),
                version: 1,
                can_edit_metadata: true,
                can_edit_files: false,
            })
            .unwrap();
        store
            .perform(WriteRequest::SaveObject(ObjectRecord::from_response(group, &item("AAAA2222", 1))))
            .unwrap();

        store.perform(WriteRequest::DeleteGroup { group_id: 9 }).unwrap();
        assert!(store.library(group).is_none());
        assert!(store.objects(group, ObjectKind::Item).is_empty());
    }

    #[test]
    fn local_setting_changes_survive_remote_store() {
        let store = MemoryStore::new();
        store
            .perform(WriteRequest::ChangeSetting {
                library_id: LIB,
                key: "tagColors".into(),
                value: json!([{"name": "red", "color": "#ff0000"}]),
            })
            .unwrap();
        store
            .perform(WriteRequest::StoreSettings {
                library_id: LIB,
                settings: vec![(
                    "tagColors".into(),
                    bibsync_protocol::SettingResponse {
                        value: json!([]),
                        version: 3,
                    },
                )],
            })
            .unwrap();

        let settings = store.transaction(|coordinator| Ok(coordinator.settings(LIB))).unwrap();
        assert_eq!(settings.len(), 1);
        assert!(settings[0].changed);
        assert_eq!(settings[0].value[0]["name"], "red");
    }
}
