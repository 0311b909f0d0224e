//! File storage on the local disk.

use crate::error::{StoreError, StoreResult};
use crate::files::FileStorage;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// File storage rooted at a directory.
///
/// Writes go to a temporary file next to the target which is then renamed
/// over it, so a crash never leaves a half-written file behind.
///
/// # Example
///
/// ```no_run
/// use bibsync_store::{DiskFileStorage, FileStorage};
/// use std::path::Path;
///
/// let storage = DiskFileStorage::new("/var/lib/bibsync");
/// storage.write(Path::new("jsons/a.json"), b"{}").unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct DiskFileStorage {
    root: PathBuf,
}

impl DiskFileStorage {
    /// Creates a storage rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

fn not_found_is_ok(result: std::io::Result<()>) -> StoreResult<()> {
    match result {
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        other => Ok(other?),
    }
}

impl FileStorage for DiskFileStorage {
    fn read(&self, path: &Path) -> StoreResult<Vec<u8>> {
        fs::read(self.full(path)).map_err(|error| match error.kind() {
            ErrorKind::NotFound => StoreError::FileNotFound(path.display().to_string()),
            _ => StoreError::Io(error),
        })
    }

    fn write(&self, path: &Path, data: &[u8]) -> StoreResult<()> {
        let target = self.full(path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut temp = target.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let mut file = fs::File::create(&temp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &target)?;
        Ok(())
    }

    fn remove(&self, path: &Path) -> StoreResult<()> {
        let target = self.full(path);
        if target.is_dir() {
            not_found_is_ok(fs::remove_dir_all(&target))
        } else {
            not_found_is_ok(fs::remove_file(&target))
        }
    }

    fn move_file(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let target = self.full(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(self.full(from), &target).map_err(|error| match error.kind() {
            ErrorKind::NotFound => StoreError::FileNotFound(from.display().to_string()),
            _ => StoreError::Io(error),
        })
    }

    fn has(&self, path: &Path) -> bool {
        self.full(path).is_file()
    }

    fn size(&self, path: &Path) -> u64 {
        fs::metadata(self.full(path)).map(|meta| meta.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_creates_directories() {
        let dir = tempdir().unwrap();
        let storage = DiskFileStorage::new(dir.path());
        let path = Path::new("downloads/group_1/ABCD2345/a.pdf");

        storage.write(path, b"pdf").unwrap();
        assert!(storage.has(path));
        assert_eq!(storage.size(path), 3);
        assert_eq!(storage.read(path).unwrap(), b"pdf");
        assert!(!dir.path().join("downloads/group_1/ABCD2345/a.pdf.tmp").exists());
    }

    #[test]
    fn write_replaces_contents() {
        let dir = tempdir().unwrap();
        let storage = DiskFileStorage::new(dir.path());
        let path = Path::new("a.json");

        storage.write(path, b"old contents").unwrap();
        storage.write(path, b"new").unwrap();
        assert_eq!(storage.read(path).unwrap(), b"new");
    }

    #[test]
    fn remove_directory_and_missing_path() {
        let dir = tempdir().unwrap();
        let storage = DiskFileStorage::new(dir.path());
        storage.write(Path::new("downloads/x/a.pdf"), b"1").unwrap();
        storage.write(Path::new("downloads/x/b.pdf"), b"2").unwrap();

        storage.remove(Path::new("downloads/x")).unwrap();
        assert!(!storage.has(Path::new("downloads/x/a.pdf")));
        storage.remove(Path::new("downloads/missing")).unwrap();
    }

    #[test]
    fn read_missing_file() {
        let dir = tempdir().unwrap();
        let storage = DiskFileStorage::new(dir.path());
        assert!(matches!(
            storage.read(Path::new("nope")),
            Err(StoreError::FileNotFound(_))
        ));
        assert_eq!(storage.size(Path::new("nope")), 0);
    }

    #[test]
    fn move_file_replaces_target() {
        let dir = tempdir().unwrap();
        let storage = DiskFileStorage::new(dir.path());
        storage.write(Path::new("uploads/a.zip"), b"zip").unwrap();
        storage.write(Path::new("downloads/a.zip"), b"old").unwrap();

        storage
            .move_file(Path::new("uploads/a.zip"), Path::new("downloads/a.zip"))
            .unwrap();
        assert!(!storage.has(Path::new("uploads/a.zip")));
        assert_eq!(storage.read(Path::new("downloads/a.zip")).unwrap(), b"zip");
    }
}
