//! File-based storage implementation.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BraidError, Result};
use crate::storage::traits::{
    LockManager, Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// A file-based storage implementation rooted at one directory.
#[derive(Debug)]
pub struct FileStorage {
    directory: PathBuf,
    config: StorageConfig,
    lock_manager: FileLockManager,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| BraidError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(BraidError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        let lock_manager = FileLockManager::new(directory.clone());

        Ok(FileStorage {
            directory,
            config,
            lock_manager,
        })
    }

    /// The directory this storage lives in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn map_not_found(name: &str, e: std::io::Error) -> BraidError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::FileNotFound(name.to_string()).into()
        } else {
            e.into()
        }
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let file = File::open(self.file_path(name)).map_err(|e| Self::map_not_found(name, e))?;
        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file()
                && let Some(name) = path.file_name().and_then(|n| n.to_str())
            {
                files.push(name.to_string());
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| Self::map_not_found(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| Self::map_not_found(old_name, e))
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let file = File::open(self.file_path(name)).map_err(|e| Self::map_not_found(name, e))?;
            file.sync_all()?;
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

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let size = file.metadata()?.len();
        let reader = BufReader::with_capacity(buffer_size, file);
        Ok(FileInput { reader, size })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.writer.flush()?;
        if self.sync_writes {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

/// A file-based lock manager. A held lock is a `<name>.lock` file created
/// with `create_new`.
#[derive(Debug)]
pub struct FileLockManager {
    directory: PathBuf,
    locks: Arc<Mutex<HashMap<String, PathBuf>>>,
}

impl FileLockManager {
    fn new(directory: PathBuf) -> Self {
        FileLockManager {
            directory,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.lock"))
    }
}

impl LockManager for FileLockManager {
    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let lock_path = self.lock_path(name);

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| -> BraidError {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::LockFailed(name.to_string()).into()
                } else {
                    e.into()
                }
            })?;

        self.locks.lock().insert(name.to_string(), lock_path.clone());

        Ok(Box::new(FileLock {
            name: name.to_string(),
            path: lock_path,
            _file: file,
            locks: Arc::clone(&self.locks),
            released: false,
        }))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.lock_path(name).exists()
    }

    fn release_all(&self) -> Result<()> {
        let mut locks = self.locks.lock();
        for (_, path) in locks.drain() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// A lock held by a [`FileLockManager`].
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    _file: File,
    locks: Arc<Mutex<HashMap<String, PathBuf>>>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            self.locks.lock().remove(&self.name);
            std::fs::remove_file(&self.path)
                .map_err(|e| BraidError::storage(format!("Failed to release lock: {e}")))?;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), StorageConfig::default()).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        storage.write_all("segments_1", b"Hello, File!").unwrap();
        assert!(storage.file_exists("segments_1"));
        assert_eq!(storage.file_size("segments_1").unwrap(), 12);
        assert_eq!(storage.read_all("segments_1").unwrap(), b"Hello, File!");
        storage.sync(&["segments_1".to_string()]).unwrap();
    }

    #[test]
    fn test_file_operations() {
        let (_temp_dir, storage) = create_test_storage();

        storage.write_all("a", b"1").unwrap();
        storage.write_all("b", b"2").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["a", "b"]);

        storage.rename_file("a", "c").unwrap();
        assert!(!storage.file_exists("a"));

        storage.delete_file("c").unwrap();
        storage.delete_file("c").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["b"]);
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(storage.open_input("nonexistent").is_err());
        assert!(storage.file_size("nonexistent").is_err());
    }

    #[test]
    fn test_file_lock() {
        let (_temp_dir, storage) = create_test_storage();

        let mut lock = storage.lock_manager().acquire_lock("write").unwrap();
        assert!(lock.is_valid());
        assert!(storage.lock_manager().try_acquire_lock("write").unwrap().is_none());
        assert!(storage.file_exists("write.lock"));

        lock.release().unwrap();
        assert!(!storage.lock_manager().lock_exists("write"));
        assert!(storage.lock_manager().try_acquire_lock("write").unwrap().is_some());
    }
}
