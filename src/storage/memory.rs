//! In-memory storage implementation for testing and caching.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::traits::{
    LockManager, Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

type FileMap = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// Files become visible when their output is closed (or dropped). Failures
/// can be injected per file name to exercise rollback paths.
#[derive(Debug)]
pub struct MemoryStorage {
    files: FileMap,
    lock_manager: MemoryLockManager,
    config: StorageConfig,
    failing: Mutex<HashSet<String>>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: StorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(Mutex::new(HashMap::new())),
            lock_manager: MemoryLockManager::new(),
            config,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(StorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Make every open or create of `name` fail with an I/O error.
    pub fn inject_failure(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    /// Stop failing operations on `name`.
    pub fn clear_failure(&self, name: &str) {
        self.failing.lock().remove(name);
    }

    fn check_failure(&self, name: &str) -> Result<()> {
        if self.failing.lock().contains(name) {
            return Err(std::io::Error::other(format!("injected failure: {name}")).into());
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_failure(name)?;

        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_failure(name)?;

        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let files = self.files.lock();
        let mut file_names: Vec<String> = files.keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            self.check_failure(name)?;
        }
        Ok(())
    }

    fn lock_manager(&self) -> &dyn LockManager {
        &self.lock_manager
    }

    fn config(&self) -> &StorageConfig {
        &self.config
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
    size: u64,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        let size = data.len() as u64;
        MemoryInput {
            cursor: Cursor::new(data),
            size,
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    cursor: Cursor<Vec<u8>>,
    files: FileMap,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            cursor: Cursor::new(Vec::new()),
            files,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }
        self.cursor.seek(pos)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.cursor.position())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(self.cursor.get_mut()));
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A memory-based lock manager.
#[derive(Debug, Default)]
pub struct MemoryLockManager {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockManager {
    fn new() -> Self {
        Self::default()
    }
}

impl LockManager for MemoryLockManager {
    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut held = self.held.lock();
        if !held.insert(name.to_string()) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            held: Arc::clone(&self.held),
            released: false,
        }))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.held.lock().contains(name)
    }

    fn release_all(&self) -> Result<()> {
        self.held.lock().clear();
        Ok(())
    }
}

/// A lock held in a [`MemoryLockManager`].
#[derive(Debug)]
struct MemoryLock {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.held.lock().remove(&self.name);
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.held.lock().contains(&self.name)
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("_0.seg").unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        assert!(!storage.file_exists("_0.seg"));
        output.close().unwrap();

        assert_eq!(storage.read_all("_0.seg").unwrap(), b"Hello, Memory!");
        assert_eq!(storage.file_size("_0.seg").unwrap(), 14);
        assert_eq!(storage.file_count(), 1);
    }

    #[test]
    fn test_file_operations() {
        let storage = MemoryStorage::new_default();
        assert!(!storage.file_exists("a"));

        storage.write_all("a", b"content").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["a"]);

        storage.rename_file("a", "b").unwrap();
        assert!(!storage.file_exists("a"));
        assert!(storage.file_exists("b"));

        storage.delete_file("b").unwrap();
        assert_eq!(storage.file_count(), 0);
        assert!(storage.open_input("b").is_err());
    }

    #[test]
    fn test_injected_failure() {
        let storage = MemoryStorage::new_default();
        storage.write_all("a", b"x").unwrap();

        storage.inject_failure("a");
        assert!(storage.open_input("a").is_err());
        assert!(storage.sync(&["a".to_string()]).is_err());

        storage.clear_failure("a");
        assert!(storage.open_input("a").is_ok());
    }

    #[test]
    fn test_lock_is_exclusive_and_released_on_drop() {
        let storage = MemoryStorage::new_default();

        let mut lock = storage.lock_manager().acquire_lock("write").unwrap();
        assert!(lock.is_valid());
        assert!(storage.lock_manager().try_acquire_lock("write").unwrap().is_none());

        lock.release().unwrap();
        assert!(!lock.is_valid());

        {
            let _again = storage.lock_manager().acquire_lock("write").unwrap();
            assert!(storage.lock_manager().lock_exists("write"));
        }
        assert!(!storage.lock_manager().lock_exists("write"));
    }

    #[test]
    fn test_obtain_lock_times_out() {
        let storage = MemoryStorage::new(StorageConfig {
            lock_poll_interval_ms: 1,
            ..Default::default()
        });

        let _held = storage.obtain_lock("write", 0).unwrap();
        let err = storage.obtain_lock("write", 5).unwrap_err();
        assert!(err.is_lock_failure());
    }
}
