//! Attachment and JSON cache file storage.

use crate::error::StoreResult;
use bibsync_protocol::{LibraryIdentifier, ObjectKind};
use std::path::{Path, PathBuf};

/// File storage used for attachment files and the JSON cache.
///
/// Paths are relative to the storage root.
///
/// # Invariants
///
/// - `write` is atomic: readers see the old contents or the new contents
/// - `remove` of a missing path succeeds
/// - Implementations must be `Send + Sync` so uploads can run concurrently
pub trait FileStorage: Send + Sync {
    /// Reads a whole file.
    fn read(&self, path: &Path) -> StoreResult<Vec<u8>>;

    /// Replaces a file, creating parent directories as needed.
    fn write(&self, path: &Path, data: &[u8]) -> StoreResult<()>;

    /// Removes a file or a directory with everything inside it.
    fn remove(&self, path: &Path) -> StoreResult<()>;

    /// Moves a file, replacing the destination.
    fn move_file(&self, from: &Path, to: &Path) -> StoreResult<()>;

    /// Returns true if a file exists.
    fn has(&self, path: &Path) -> bool;

    /// Returns the file size in bytes, 0 if the file is missing.
    fn size(&self, path: &Path) -> u64;
}

/// Layout of the files kept for each library.
pub struct Files;

impl Files {
    /// Cached JSON of an object: `jsons/<library>/<type>/<key>.json`.
    pub fn json_cache(library_id: LibraryIdentifier, kind: ObjectKind, key: &str) -> PathBuf {
        PathBuf::from("jsons")
            .join(library_id.folder_name())
            .join(kind.type_name())
            .join(format!("{}.json", key))
    }

    /// Directory holding the JSON cache of one library.
    pub fn json_cache_directory(library_id: LibraryIdentifier) -> PathBuf {
        PathBuf::from("jsons").join(library_id.folder_name())
    }

    /// Directory holding the file of an attachment item.
    pub fn attachment_directory(library_id: LibraryIdentifier, key: &str) -> PathBuf {
        PathBuf::from("downloads").join(library_id.folder_name()).join(key)
    }

    /// File of an attachment item.
    pub fn attachment_file(library_id: LibraryIdentifier, key: &str, filename: &str) -> PathBuf {
        Self::attachment_directory(library_id, key).join(filename)
    }

    /// Zipped copy of an attachment prepared for WebDAV upload.
    pub fn webdav_upload_file(library_id: LibraryIdentifier, key: &str) -> PathBuf {
        PathBuf::from("uploads")
            .join(library_id.folder_name())
            .join(format!("{}.zip", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_uses_library_folders() {
        assert_eq!(
            Files::json_cache(LibraryIdentifier::MY_LIBRARY, ObjectKind::Item, "ABCD2345"),
            PathBuf::from("jsons/custom_my_library/item/ABCD2345.json")
        );
        assert_eq!(
            Files::attachment_file(LibraryIdentifier::Group(7), "ABCD2345", "paper.pdf"),
            PathBuf::from("downloads/group_7/ABCD2345/paper.pdf")
        );
    }
}
