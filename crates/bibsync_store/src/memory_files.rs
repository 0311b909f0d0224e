//! In-memory file storage for testing.

use crate::error::{StoreError, StoreResult};
use crate::files::FileStorage;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// File storage kept in memory.
///
/// Writes can be made to fail to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryFileStorage {
    files: RwLock<BTreeMap<PathBuf, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryFileStorage {
    /// Creates an empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Paths of all stored files.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.read().keys().cloned().collect()
    }
}

impl FileStorage for MemoryFileStorage {
    fn read(&self, path: &Path) -> StoreResult<Vec<u8>> {
        self.files
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::FileNotFound(path.display().to_string()))
    }

    fn write(&self, path: &Path, data: &[u8]) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("write to {} failed", path.display()),
            )));
        }
        self.files.write().insert(path.to_path_buf(), data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, path: &Path) -> StoreResult<()> {
        self.files
            .write()
            .retain(|stored, _| stored != path && !stored.starts_with(path));
        Ok(())
    }

    fn move_file(&self, from: &Path, to: &Path) -> StoreResult<()> {
        let mut files = self.files.write();
        let data = files
            .remove(from)
            .ok_or_else(|| StoreError::FileNotFound(from.display().to_string()))?;
        files.insert(to.to_path_buf(), data);
        Ok(())
    }

    fn has(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn size(&self, path: &Path) -> u64 {
        self.files
            .read()
            .get(path)
            .map_or(0, |data| data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_directory_prefix() {
        let storage = MemoryFileStorage::new();
        storage.write(Path::new("downloads/lib/KEY/a.pdf"), b"a").unwrap();
        storage.write(Path::new("downloads/lib/KEY2/b.pdf"), b"b").unwrap();

        storage.remove(Path::new("downloads/lib/KEY")).unwrap();
        assert_eq!(storage.paths(), vec![PathBuf::from("downloads/lib/KEY2/b.pdf")]);
    }

    #[test]
    fn failing_writes_store_nothing() {
        let storage = MemoryFileStorage::new();
        storage.set_fail_writes(true);
        assert!(storage.write(Path::new("a"), b"1").is_err());
        assert!(!storage.has(Path::new("a")));
        assert_eq!(storage.write_count(), 0);
    }
}
