//! Write requests executed by the local store.

use crate::record::ObjectRecord;
use bibsync_protocol::{
    Conflict, LibraryIdentifier, ObjectKind, ObjectResponse, SettingResponse, UpdateVersionType,
};
use serde_json::Value;

/// A single mutation of the local store.
///
/// Requests are executed inside a transaction; a batch of requests either
/// commits as a whole or not at all.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// Stores fetched objects. Objects with pending local edits are kept and
    /// reported as conflicts unless `prefer_remote` is set.
    StoreObjects {
        /// Library.
        library_id: LibraryIdentifier,
        /// Decoded objects.
        objects: Vec<ObjectResponse>,
        /// Overwrite local edits.
        prefer_remote: bool,
    },
    /// Replaces a record with the canonical data the server returned.
    UpdateFromResponse {
        /// Library.
        library_id: LibraryIdentifier,
        /// Canonical object.
        object: ObjectResponse,
    },
    /// Clears local changes and records the version the server accepted.
    MarkSynced {
        /// Library.
        library_id: LibraryIdentifier,
        /// Storage kind.
        kind: ObjectKind,
        /// Object keys.
        keys: Vec<String>,
        /// Accepted version.
        version: u64,
    },
    /// Flags objects for a forced fetch. Missing objects get a placeholder record.
    MarkForResync {
        /// Library.
        library_id: LibraryIdentifier,
        /// Storage kind.
        kind: ObjectKind,
        /// Object keys.
        keys: Vec<String>,
        /// Unix time (seconds) of the attempt.
        attempted_at: u64,
    },
    /// Flags objects as edited by the user and undeletes them.
    MarkChangedByUser {
        /// Library.
        library_id: LibraryIdentifier,
        /// Storage kind.
        kind: ObjectKind,
        /// Object keys.
        keys: Vec<String>,
    },
    /// Advances a version cursor. Cursors never move backwards.
    SetVersion {
        /// Library.
        library_id: LibraryIdentifier,
        /// Addressed cursor.
        version_type: UpdateVersionType,
        /// New version.
        version: u64,
    },
    /// Applies remote deletions. Objects with pending local edits are kept
    /// and reported as conflicts.
    DeleteObjects {
        /// Library.
        library_id: LibraryIdentifier,
        /// Storage kind.
        kind: ObjectKind,
        /// Object keys.
        keys: Vec<String>,
    },
    /// Removes tags deleted remotely from every item of the library.
    DeleteTags {
        /// Library.
        library_id: LibraryIdentifier,
        /// Tag names.
        names: Vec<String>,
    },
    /// Removes records unconditionally.
    PurgeObjects {
        /// Library.
        library_id: LibraryIdentifier,
        /// Storage kind.
        kind: ObjectKind,
        /// Object keys.
        keys: Vec<String>,
    },
    /// Inserts or replaces a record as-is.
    SaveObject(ObjectRecord),
    /// Marks an attachment file as uploaded.
    MarkAttachmentUploaded {
        /// Library.
        library_id: LibraryIdentifier,
        /// Attachment item key.
        key: String,
        /// Item version reported by the server, if any.
        version: Option<u64>,
    },
    /// Splits annotations whose geometry is too large into several annotations.
    /// Annotations that cannot be split are marked for resync instead.
    SplitAnnotations {
        /// Library.
        library_id: LibraryIdentifier,
        /// Annotation keys.
        keys: Vec<String>,
        /// Unix time (seconds) used for resync marks.
        attempted_at: u64,
    },
    /// Records attachment files that must be deleted from WebDAV storage.
    CreateWebDavDeletions {
        /// Library.
        library_id: LibraryIdentifier,
        /// Attachment keys.
        keys: Vec<String>,
    },
    /// Forgets all pending local changes of a library.
    MarkChangesResolved {
        /// Library.
        library_id: LibraryIdentifier,
    },
    /// Inserts or updates a group library.
    StoreGroup {
        /// Group id.
        group_id: i64,
        /// Display name.
        name: String,
        /// Group metadata version.
        version: u64,
        /// Metadata editing permission.
        can_edit_metadata: bool,
        /// File editing permission.
        can_edit_files: bool,
    },
    /// Removes a group library and all of its data.
    DeleteGroup {
        /// Group id.
        group_id: i64,
    },
    /// Keeps a group library locally after access to it was lost.
    MarkGroupLocalOnly {
        /// Group id.
        group_id: i64,
    },
    /// Stores settings fetched from the server.
    StoreSettings {
        /// Library.
        library_id: LibraryIdentifier,
        /// Settings by key.
        settings: Vec<(String, SettingResponse)>,
    },
    /// Records a local settings change.
    ChangeSetting {
        /// Library.
        library_id: LibraryIdentifier,
        /// Setting key.
        key: String,
        /// New value.
        value: Value,
    },
    /// Clears local changes of settings accepted by the server.
    MarkSettingsSynced {
        /// Library.
        library_id: LibraryIdentifier,
        /// Setting keys.
        keys: Vec<String>,
        /// Accepted version.
        version: u64,
    },
    /// Removes settings deleted remotely.
    DeleteSettings {
        /// Library.
        library_id: LibraryIdentifier,
        /// Setting keys.
        keys: Vec<String>,
    },
}

impl WriteRequest {
    /// Short name used in logs and store statistics.
    pub fn name(&self) -> &'static str {
        match self {
            WriteRequest::StoreObjects { .. } => "store_objects",
            WriteRequest::UpdateFromResponse { .. } => "update_from_response",
            WriteRequest::MarkSynced { .. } => "mark_synced",
            WriteRequest::MarkForResync { .. } => "mark_for_resync",
            WriteRequest::MarkChangedByUser { .. } => "mark_changed_by_user",
            WriteRequest::SetVersion { .. } => "set_version",
            WriteRequest::DeleteObjects { .. } => "delete_objects",
            WriteRequest::DeleteTags { .. } => "delete_tags",
            WriteRequest::PurgeObjects { .. } => "purge_objects",
            WriteRequest::SaveObject(_) => "save_object",
            WriteRequest::MarkAttachmentUploaded { .. } => "mark_attachment_uploaded",
            WriteRequest::SplitAnnotations { .. } => "split_annotations",
            WriteRequest::CreateWebDavDeletions { .. } => "create_webdav_deletions",
            WriteRequest::MarkChangesResolved { .. } => "mark_changes_resolved",
            WriteRequest::StoreGroup { .. } => "store_group",
            WriteRequest::DeleteGroup { .. } => "delete_group",
            WriteRequest::MarkGroupLocalOnly { .. } => "mark_group_local_only",
            WriteRequest::StoreSettings { .. } => "store_settings",
            WriteRequest::ChangeSetting { .. } => "change_setting",
            WriteRequest::MarkSettingsSynced { .. } => "mark_settings_synced",
            WriteRequest::DeleteSettings { .. } => "delete_settings",
        }
    }
}

/// Result of a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Nothing to report.
    Done,
    /// Objects that were not overwritten or deleted because of local edits.
    Conflicts(Vec<Conflict>),
    /// Whether a version cursor moved.
    VersionChanged(bool),
    /// Result of splitting annotations.
    Split {
        /// Keys of the annotations created by the split.
        created: Vec<String>,
        /// Keys that could not be split and were marked for resync.
        resync: Vec<String>,
    },
}

impl WriteOutcome {
    /// Returns the reported conflicts, if any.
    pub fn into_conflicts(self) -> Vec<Conflict> {
        match self {
            WriteOutcome::Conflicts(conflicts) => conflicts,
            _ => Vec::new(),
        }
    }
}
