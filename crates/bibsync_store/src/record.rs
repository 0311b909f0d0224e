//! Records kept by the local store.

use bibsync_protocol::{LibraryIdentifier, ObjectKind, ObjectResponse, Versions};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a record matches the last remote state the store saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectSyncState {
    /// The record reflects remote data.
    Synced,
    /// The record must be fetched again (failed parse, forced resync).
    Dirty,
}

/// File state of an attachment item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentState {
    /// File name on disk.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
    /// MD5 of the file contents.
    pub md5: String,
    /// Modification time in milliseconds.
    pub mtime: i64,
    /// Whether the local file has not been uploaded yet.
    pub upload_pending: bool,
}

impl AttachmentState {
    /// Reads the file state of an imported attachment from item data.
    pub fn from_data(data: &Value) -> Option<Self> {
        if data.get("itemType").and_then(Value::as_str) != Some("attachment") {
            return None;
        }
        let link_mode = data.get("linkMode").and_then(Value::as_str)?;
        if link_mode != "imported_file" && link_mode != "imported_url" {
            return None;
        }
        Some(Self {
            filename: data
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            content_type: data
                .get("contentType")
                .and_then(Value::as_str)
                .unwrap_or("application/octet-stream")
                .to_string(),
            md5: data
                .get("md5")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            mtime: data.get("mtime").and_then(Value::as_i64).unwrap_or(0),
            upload_pending: false,
        })
    }
}

/// A collection, item or search stored locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object key.
    pub key: String,
    /// Owning library.
    pub library_id: LibraryIdentifier,
    /// Storage kind.
    pub kind: ObjectKind,
    /// Last remote version of this object, 0 if never synced.
    pub version: u64,
    /// Object data in API shape.
    pub data: Value,
    /// Whether the object is in trash.
    pub trash: bool,
    /// Parent collection or parent item key.
    pub parent: Option<String>,
    /// Sync state.
    pub sync_state: ObjectSyncState,
    /// Whether the user changed the object since the last submission.
    pub changed: bool,
    /// Whether the user deleted the object and the deletion is not submitted yet.
    pub deleted: bool,
    /// How many times this object has been marked for resync in a row.
    pub sync_retries: u32,
    /// Unix time (seconds) of the last resync mark.
    pub last_sync_attempt: Option<u64>,
    /// File state for imported attachments.
    pub attachment: Option<AttachmentState>,
}

impl ObjectRecord {
    /// Creates a synced record with version 0.
    pub fn new(library_id: LibraryIdentifier, kind: ObjectKind, key: impl Into<String>, data: Value) -> Self {
        let attachment = AttachmentState::from_data(&data);
        let parent_field = match kind {
            ObjectKind::Collection => "parentCollection",
            ObjectKind::Item => "parentItem",
            ObjectKind::Search => "",
        };
        Self {
            key: key.into(),
            library_id,
            kind,
            version: 0,
            trash: matches!(data.get("deleted"), Some(Value::Bool(true)))
                || data.get("deleted").and_then(Value::as_i64) == Some(1),
            parent: data
                .get(parent_field)
                .and_then(Value::as_str)
                .map(str::to_string),
            data,
            sync_state: ObjectSyncState::Synced,
            changed: false,
            deleted: false,
            sync_retries: 0,
            last_sync_attempt: None,
            attachment,
        }
    }

    /// Creates a record from a decoded API object.
    pub fn from_response(library_id: LibraryIdentifier, response: &ObjectResponse) -> Self {
        let mut record = Self::new(library_id, response.kind, response.key.clone(), response.data.clone());
        record.apply_response(response);
        record
    }

    /// Overwrites this record with remote data and clears local state.
    pub fn apply_response(&mut self, response: &ObjectResponse) {
        self.version = response.version;
        self.data = response.data.clone();
        self.trash = response.trash;
        self.parent = response.parent.clone();
        self.sync_state = ObjectSyncState::Synced;
        self.changed = false;
        self.deleted = false;
        self.sync_retries = 0;
        self.last_sync_attempt = None;
        // Metadata is submitted before the file, so a pending upload survives.
        let upload_pending = self
            .attachment
            .as_ref()
            .is_some_and(|attachment| attachment.upload_pending);
        self.attachment = AttachmentState::from_data(&response.data).map(|mut attachment| {
            attachment.upload_pending = upload_pending;
            attachment
        });
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Marks the record as changed by the user.
    pub fn changed_by_user(mut self) -> Self {
        self.changed = true;
        self
    }

    /// Returns true if the record has edits or a deletion waiting for submission.
    pub fn is_pending_submission(&self) -> bool {
        self.changed || self.deleted
    }

    /// Returns true if the record passes the trash filter of an object type.
    pub fn matches_trash(&self, filter: Option<bool>) -> bool {
        filter.map_or(true, |trash| self.trash == trash)
    }

    /// Builds the JSON submitted for this record in a write batch.
    pub fn update_parameters(&self) -> Value {
        let mut parameters = match &self.data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        parameters.insert("key".into(), Value::String(self.key.clone()));
        parameters.insert("version".into(), Value::from(self.version));
        if self.kind == ObjectKind::Item {
            if self.trash {
                parameters.insert("deleted".into(), Value::Bool(true));
            } else {
                parameters.remove("deleted");
            }
        }
        Value::Object(parameters)
    }
}

/// A library known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    /// Library identifier.
    pub id: LibraryIdentifier,
    /// Display name.
    pub name: String,
    /// Version cursors.
    pub versions: Versions,
    /// Whether the user may edit metadata.
    pub can_edit_metadata: bool,
    /// Whether the user may edit files.
    pub can_edit_files: bool,
    /// Group libraries the user lost access to but kept locally.
    pub local_only: bool,
    /// Group metadata version, 0 for the personal library.
    pub group_version: u64,
}

impl LibraryRecord {
    /// Creates an editable library with zero cursors.
    pub fn new(id: LibraryIdentifier, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            versions: Versions::default(),
            can_edit_metadata: true,
            can_edit_files: true,
            local_only: false,
            group_version: 0,
        }
    }
}

/// A library setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingRecord {
    /// Setting key, e.g. `tagColors`.
    pub key: String,
    /// Setting value.
    pub value: Value,
    /// Remote version of the setting.
    pub version: u64,
    /// Whether the user changed the setting locally.
    pub changed: bool,
}

const KEY_ALPHABET: &[u8] = b"23456789ABCDEFGHIJKLMNPQRSTUVWXYZ";

/// Generates a new random object key.
pub fn generate_key() -> String {
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}
