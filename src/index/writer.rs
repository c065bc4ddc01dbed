//! Index writer.
//!
//! The writer holds the write lock for its whole lifetime. Documents are
//! buffered by a [`SegmentWriter`]; `flush` turns the buffer into a new
//! segment file and `commit` publishes the segment list as the next
//! `segments_N` generation. Files of superseded commits are removed by an
//! [`IndexFileDeleter`] with [`KeepOnlyLastCommitDeletionPolicy`].

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use log::{debug, info, warn};

use crate::DocId;
use crate::config::{WRITE_LOCK_NAME, WriterConfig};
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::deletion_policy::{IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy};
use crate::index::file_deleter::IndexFileDeleter;
use crate::index::segment_info::{SegmentInfo, SegmentInfos};
use crate::index::segment_writer::SegmentWriter;
use crate::storage::{Storage, StorageLock};

/// Adds documents to an index in storage.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use braid::config::WriterConfig;
/// use braid::document::Document;
/// use braid::index::IndexWriter;
/// use braid::storage::{MemoryStorage, Storage};
///
/// let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
/// let mut writer = IndexWriter::open(storage, WriterConfig::default()).unwrap();
/// writer
///     .add_document(Document::builder().add_text("title", "hello world").build())
///     .unwrap();
/// writer.close().unwrap();
/// ```
#[derive(Debug)]
pub struct IndexWriter {
    storage: Arc<dyn Storage>,
    config: WriterConfig,
    infos: SegmentInfos,
    buffer: SegmentWriter,
    deleter: IndexFileDeleter,
    write_lock: Option<Box<dyn StorageLock>>,
    synced: AHashSet<String>,
}

impl IndexWriter {
    /// Open a writer with the default deletion policy.
    pub fn open(storage: Arc<dyn Storage>, config: WriterConfig) -> Result<Self> {
        Self::open_with_policy(storage, config, Arc::new(KeepOnlyLastCommitDeletionPolicy))
    }

    /// Open a writer, creating an empty index when storage holds none.
    pub fn open_with_policy(
        storage: Arc<dyn Storage>,
        config: WriterConfig,
        policy: Arc<dyn IndexDeletionPolicy>,
    ) -> Result<Self> {
        let buffer = SegmentWriter::new(&config.pool)?;
        let mut lock = storage.obtain_lock(WRITE_LOCK_NAME, config.write_lock_timeout_ms)?;
        info!("index writer obtained {WRITE_LOCK_NAME} lock");

        let opened = Self::load_infos(storage.as_ref()).and_then(|infos| {
            let deleter = IndexFileDeleter::new(Arc::clone(&storage), policy, &infos)?;
            Ok((infos, deleter))
        });
        let (infos, deleter) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                if let Err(release) = lock.release() {
                    warn!("failed to release {WRITE_LOCK_NAME} lock: {release}");
                }
                return Err(e);
            }
        };

        let synced = infos.files(false).into_iter().collect();
        Ok(IndexWriter {
            storage,
            config,
            infos,
            buffer,
            deleter,
            write_lock: Some(lock),
            synced,
        })
    }

    fn load_infos(storage: &dyn Storage) -> Result<SegmentInfos> {
        if SegmentInfos::latest_generation(storage)?.is_some() {
            return SegmentInfos::read_latest(storage);
        }
        let mut infos = SegmentInfos::new();
        let file_name = infos.commit(storage)?;
        info!("created empty index in {file_name}");
        Ok(infos)
    }

    /// The segment list as last flushed or committed.
    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.infos
    }

    /// Configuration this writer was opened with.
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Documents buffered since the last flush.
    pub fn buffered_docs(&self) -> usize {
        self.buffer.num_docs()
    }

    /// Documents in flushed segments plus buffered ones.
    pub fn max_doc(&self) -> u64 {
        self.infos.total_doc_count() + self.buffer.num_docs() as u64
    }

    /// Whether the writer still holds the write lock.
    pub fn is_closed(&self) -> bool {
        self.write_lock.is_none()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(BraidError::already_closed("index writer is closed"));
        }
        Ok(())
    }

    /// Buffer a document. Returns its id within the next segment.
    pub fn add_document(&mut self, doc: Document) -> Result<DocId> {
        self.ensure_open()?;
        self.buffer.add_document(doc)
    }

    /// Write buffered documents as a new segment. The segment becomes
    /// visible to readers at the next commit.
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.buffer.is_empty() {
            return Ok(());
        }

        let data = self.buffer.flush()?;
        let name = self.infos.new_segment_name();
        let info = SegmentInfo::new(name, data.max_doc, self.config.use_compound_file);
        let file_name = info.data_file_name();
        self.storage
            .write_all(&file_name, &bincode::serialize(&data)?)?;
        debug!(
            "flushed segment {} with {} docs to {file_name}",
            info.name, info.doc_count
        );

        self.infos.segments.push(info);
        self.deleter.checkpoint(&self.infos, false)
    }

    /// Flush and publish the next commit.
    pub fn commit(&mut self, user_data: Option<BTreeMap<String, String>>) -> Result<()> {
        self.flush()?;

        let unsynced: Vec<String> = self
            .infos
            .files(false)
            .into_iter()
            .filter(|f| !self.synced.contains(f))
            .collect();
        self.storage.sync(&unsynced)?;
        self.synced.extend(unsynced);

        if let Some(user_data) = user_data {
            self.infos.user_data = user_data;
        }
        let file_name = self.infos.commit(self.storage.as_ref())?;
        info!(
            "index writer committed {file_name} with {} segments",
            self.infos.len()
        );
        self.deleter.checkpoint(&self.infos, true)
    }

    /// Commit and release the write lock.
    pub fn close(&mut self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let committed = self.commit(None);
        self.deleter.close();
        if let Some(mut lock) = self.write_lock.take() {
            lock.release()?;
            info!("index writer released {WRITE_LOCK_NAME} lock");
        }
        committed
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if let Some(mut lock) = self.write_lock.take() {
            if self.buffer.num_docs() > 0 {
                warn!(
                    "index writer dropped with {} unflushed documents",
                    self.buffer.num_docs()
                );
            }
            let _ = lock.release();
        }
    }
}
