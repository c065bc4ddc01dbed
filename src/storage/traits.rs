//! Storage abstraction trait and common types.

use std::io::{Read, Seek, Write};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{BraidError, Result};

/// A trait for storage backends holding index files.
///
/// Index files are written once and never modified in place; the only
/// mutable state is which files exist and the locks.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>>;

    /// Create a file for writing, truncating any existing content.
    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files in the storage, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Rename a file.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// The lock manager coordinating writers on this storage.
    fn lock_manager(&self) -> &dyn LockManager;

    /// Configuration this storage was created with.
    fn config(&self) -> &StorageConfig;

    /// Read a whole file into memory.
    fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut data = Vec::with_capacity(input.size()? as usize);
        input.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Write a whole file and close it.
    fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut output = self.create_output(name)?;
        output.write_all(data)?;
        output.close()
    }

    /// Obtain a lock, polling until `timeout_ms` elapses.
    fn obtain_lock(&self, name: &str, timeout_ms: u64) -> Result<Box<dyn StorageLock>> {
        let poll = Duration::from_millis(self.config().lock_poll_interval_ms.max(1));
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(lock) = self.lock_manager().try_acquire_lock(name)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(BraidError::lock_obtain_failed(name, timeout_ms));
            }
            thread::sleep(poll);
        }
    }
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Close the input stream.
    fn close(&mut self) -> Result<()>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Seek + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Get the current position in the output stream.
    fn position(&self) -> Result<u64>;

    /// Close the output stream.
    fn close(&mut self) -> Result<()>;
}

/// A lock manager for coordinating access to storage.
pub trait LockManager: Send + Sync + std::fmt::Debug {
    /// Acquire a lock with the given name, failing if it is held.
    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>>;

    /// Try to acquire a lock with the given name, returning None if not available.
    fn try_acquire_lock(&self, name: &str) -> Result<Option<Box<dyn StorageLock>>> {
        match self.acquire_lock(name) {
            Ok(lock) => Ok(Some(lock)),
            Err(BraidError::Storage(msg)) if msg.starts_with(LOCK_FAILED_PREFIX) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Check if a lock with the given name is currently held.
    fn lock_exists(&self, name: &str) -> bool;

    /// Release all locks (for cleanup).
    fn release_all(&self) -> Result<()>;
}

/// A lock on a resource in storage. Dropping the lock releases it.
pub trait StorageLock: Send + std::fmt::Debug {
    /// Get the name of the lock.
    fn name(&self) -> &str;

    /// Release the lock.
    fn release(&mut self) -> Result<()>;

    /// Check if the lock is still held.
    fn is_valid(&self) -> bool;
}

/// Configuration for storage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Buffer size for I/O operations.
    pub buffer_size: usize,

    /// Whether to sync writes immediately.
    pub sync_writes: bool,

    /// How often `obtain_lock` retries a held lock.
    pub lock_poll_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            buffer_size: 65536,
            sync_writes: false,
            lock_poll_interval_ms: 50,
        }
    }
}

const LOCK_FAILED_PREFIX: &str = "Failed to acquire lock";

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Lock acquisition failed.
    LockFailed(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::LockFailed(name) => write!(f, "{LOCK_FAILED_PREFIX}: {name}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for BraidError {
    fn from(err: StorageError) -> Self {
        BraidError::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();

        assert_eq!(config.buffer_size, 65536);
        assert!(!config.sync_writes);
        assert_eq!(config.lock_poll_interval_ms, 50);
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("segments_1".to_string());
        assert_eq!(err.to_string(), "File not found: segments_1");

        let err = StorageError::LockFailed("write".to_string());
        assert_eq!(err.to_string(), "Failed to acquire lock: write");
    }
}
