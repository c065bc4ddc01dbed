//! Composite reader over the segments of one commit in a storage.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::{AHashMap, AHashSet};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::DocId;
use crate::config::{ReaderConfig, WRITE_LOCK_NAME};
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::deletion_policy::{
    IndexCommit, IndexDeletionPolicy, KeepOnlyLastCommitDeletionPolicy,
};
use crate::index::file_deleter::IndexFileDeleter;
use crate::index::postings::{TermDocs, TermEnum, TermFreqVector, TermPositions};
use crate::index::reader::{AcquiredReaders, IndexReader, RefCount, SubReaderSet};
use crate::index::segment_info::{SegmentInfos, generation_from_file_name};
use crate::index::segment_reader::SegmentReader;
use crate::index::term::Term;
use crate::storage::{Storage, StorageLock};

#[derive(Debug)]
struct DirectoryState {
    infos: SegmentInfos,
    write_lock: Option<Box<dyn StorageLock>>,
    stale: bool,
    has_changes: bool,
    synced: AHashSet<String>,
    rollback: Option<(SegmentInfos, bool)>,
}

/// Reader over the segments listed by a `segments_N` file.
///
/// Opened read-only by default. A writable reader takes the storage's write
/// lock on its first modification and fails with
/// [`BraidError::StaleReader`] if another writer committed since it was
/// opened.
#[derive(Debug)]
pub struct DirectoryReader {
    storage: Arc<dyn Storage>,
    config: ReaderConfig,
    policy: Arc<dyn IndexDeletionPolicy>,
    segments: Vec<Arc<SegmentReader>>,
    subs: SubReaderSet,
    state: Mutex<DirectoryState>,
    ref_count: RefCount,
    closed: AtomicBool,
}

impl DirectoryReader {
    /// Open the latest commit.
    pub fn open(storage: Arc<dyn Storage>, config: ReaderConfig) -> Result<Arc<Self>> {
        Self::open_with_policy(storage, config, Arc::new(KeepOnlyLastCommitDeletionPolicy))
    }

    /// Open the latest commit; commits made through this reader prune old
    /// commits with `policy`.
    pub fn open_with_policy(
        storage: Arc<dyn Storage>,
        config: ReaderConfig,
        policy: Arc<dyn IndexDeletionPolicy>,
    ) -> Result<Arc<Self>> {
        let infos = SegmentInfos::read_latest(storage.as_ref())?;
        Self::open_infos(storage, config, policy, infos)
    }

    /// Open a specific commit.
    pub fn open_commit(
        storage: Arc<dyn Storage>,
        commit: &IndexCommit,
        config: ReaderConfig,
    ) -> Result<Arc<Self>> {
        let infos = SegmentInfos::read(storage.as_ref(), commit.segments_file_name())?;
        Self::open_infos(
            storage,
            config,
            Arc::new(KeepOnlyLastCommitDeletionPolicy),
            infos,
        )
    }

    fn open_infos(
        storage: Arc<dyn Storage>,
        config: ReaderConfig,
        policy: Arc<dyn IndexDeletionPolicy>,
        infos: SegmentInfos,
    ) -> Result<Arc<Self>> {
        let mut acquired = AcquiredReaders::<SegmentReader>::new();
        // Last to first, so a segment merged away concurrently fails the open
        // before the earlier segments are loaded.
        for info in infos.segments.iter().rev() {
            let reader = SegmentReader::open(Arc::clone(&storage), info, config.read_only)?;
            reader.set_disable_fake_norms(config.disable_fake_norms);
            acquired.push_fresh(reader);
        }

        let mut segments: Vec<Arc<SegmentReader>> =
            acquired.finish().into_iter().map(|(reader, _)| reader).collect();
        segments.reverse();
        info!(
            "opened {} with {} segments (read-only: {})",
            infos.segments_file_name(),
            segments.len(),
            config.read_only
        );
        Ok(Self::assemble(storage, config, policy, infos, segments))
    }

    fn assemble(
        storage: Arc<dyn Storage>,
        config: ReaderConfig,
        policy: Arc<dyn IndexDeletionPolicy>,
        infos: SegmentInfos,
        segments: Vec<Arc<SegmentReader>>,
    ) -> Arc<Self> {
        let readers: Vec<Arc<dyn IndexReader>> = segments
            .iter()
            .map(|segment| Arc::clone(segment) as Arc<dyn IndexReader>)
            .collect();
        let decref_on_close = vec![true; readers.len()];
        let synced = infos.files(true).into_iter().collect();

        Arc::new(DirectoryReader {
            storage,
            config,
            policy,
            segments,
            subs: SubReaderSet::new(readers, decref_on_close),
            state: Mutex::new(DirectoryState {
                infos,
                write_lock: None,
                stale: false,
                has_changes: false,
                synced,
                rollback: None,
            }),
            ref_count: RefCount::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The storage this reader reads.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The configuration this reader was opened with.
    pub fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// The segment readers, in doc id order.
    pub fn segment_readers(&self) -> &[Arc<SegmentReader>] {
        &self.segments
    }

    /// The doc id boundaries of the segments.
    pub fn doc_starts(&self) -> &crate::index::boundary::DocStarts {
        self.subs.starts()
    }

    /// The segment list this reader reflects.
    pub fn segment_infos(&self) -> SegmentInfos {
        self.state.lock().infos.clone()
    }

    /// Data attached to the commit this reader reflects.
    pub fn commit_user_data(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_open()?;
        Ok(self.state.lock().infos.user_data.clone())
    }

    /// The commit this reader reflects.
    pub fn index_commit(&self) -> Result<IndexCommit> {
        self.ensure_open()?;
        Ok(IndexCommit::from_infos(&self.state.lock().infos))
    }

    /// Every readable commit in `storage`, oldest first.
    pub fn list_commits(storage: &dyn Storage) -> Result<Vec<IndexCommit>> {
        let mut names: Vec<(u64, String)> = storage
            .list_files()?
            .into_iter()
            .filter_map(|name| generation_from_file_name(&name).map(|g| (g, name)))
            .collect();
        names.sort();

        let mut commits = Vec::with_capacity(names.len());
        for (_, name) in names {
            match SegmentInfos::read(storage, &name) {
                Ok(infos) => commits.push(IndexCommit::from_infos(&infos)),
                Err(e) => warn!("skipping unreadable commit {name}: {e}"),
            }
        }
        Ok(commits)
    }

    /// Whether a newer commit was detected while taking the write lock.
    pub fn is_stale(&self) -> bool {
        self.state.lock().stale
    }

    /// Whether this reader holds the write lock.
    pub fn holds_write_lock(&self) -> bool {
        self.state.lock().write_lock.is_some()
    }

    /// Reopen with the given mode.
    pub fn reopen_with(self: &Arc<Self>, read_only: bool) -> Result<Arc<dyn IndexReader>> {
        self.do_reopen(read_only, None)
    }

    /// Read-only reader on a specific commit.
    pub fn reopen_at(self: &Arc<Self>, commit: &IndexCommit) -> Result<Arc<dyn IndexReader>> {
        self.do_reopen(true, Some(commit))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ref_count.get() == 0 {
            return Err(BraidError::already_closed("directory reader is closed"));
        }
        Ok(())
    }

    fn acquire_write_lock(&self, state: &mut DirectoryState) -> Result<()> {
        if self.config.read_only {
            return Err(BraidError::read_only(
                "this reader was opened read-only and cannot delete, undelete or set norms",
            ));
        }
        self.ensure_open()?;
        if state.stale {
            return Err(BraidError::stale(
                "reader is out of date and no longer valid for delete, undelete or set norm",
            ));
        }
        if state.write_lock.is_some() {
            return Ok(());
        }

        let mut lock = self
            .storage
            .obtain_lock(WRITE_LOCK_NAME, self.config.write_lock_timeout_ms)?;
        let current = SegmentInfos::read_current_version(self.storage.as_ref())?;
        if current > state.infos.version {
            state.stale = true;
            if let Err(e) = lock.release() {
                warn!("failed to release write lock: {e}");
            }
            warn!(
                "reader at version {} is stale, index is at version {current}",
                state.infos.version
            );
            return Err(BraidError::stale(format!(
                "index moved to version {current} since this reader opened version {}",
                state.infos.version
            )));
        }
        info!("acquired write lock at version {}", state.infos.version);
        state.write_lock = Some(lock);
        Ok(())
    }

    fn do_reopen(
        self: &Arc<Self>,
        read_only: bool,
        commit: Option<&IndexCommit>,
    ) -> Result<Arc<dyn IndexReader>> {
        self.ensure_open()?;
        let (has_changes, current_file) = {
            let state = self.state.lock();
            (state.has_changes, state.infos.segments_file_name())
        };

        let infos = match commit {
            None => {
                if has_changes {
                    // Pending changes mean we hold the write lock, so nothing
                    // else can have committed.
                    return if read_only {
                        Arc::clone(self).clone_reader(true)
                    } else {
                        Ok(Arc::clone(self) as Arc<dyn IndexReader>)
                    };
                }
                if self.is_current()? {
                    debug!("reader is current, reopen returns the same instance");
                    return if read_only != self.config.read_only {
                        Arc::clone(self).clone_reader(read_only)
                    } else {
                        Ok(Arc::clone(self) as Arc<dyn IndexReader>)
                    };
                }
                SegmentInfos::read_latest(self.storage.as_ref())?
            }
            Some(commit) => {
                if !read_only {
                    return Err(BraidError::invalid_argument(
                        "a reader on a specific commit must be read-only",
                    ));
                }
                if commit.segments_file_name() == current_file {
                    return if read_only != self.config.read_only {
                        Arc::clone(self).clone_reader(read_only)
                    } else {
                        Ok(Arc::clone(self) as Arc<dyn IndexReader>)
                    };
                }
                SegmentInfos::read(self.storage.as_ref(), commit.segments_file_name())?
            }
        };

        Ok(self.reopen_from(infos, false, read_only)?)
    }

    /// Build a reader on `infos`, sharing every segment reader that is
    /// unchanged.
    fn reopen_from(
        self: &Arc<Self>,
        infos: SegmentInfos,
        do_clone: bool,
        read_only: bool,
    ) -> Result<Arc<DirectoryReader>> {
        let old_by_name: AHashMap<&str, usize> = self
            .segments
            .iter()
            .enumerate()
            .map(|(i, segment)| (segment.name(), i))
            .collect();

        let mut acquired = AcquiredReaders::<SegmentReader>::new();
        for info in infos.segments.iter().rev() {
            let old = old_by_name.get(info.name.as_str()).map(|&i| &self.segments[i]);
            match old {
                Some(old) if old.segment_info().use_compound_file == info.use_compound_file => {
                    let reader = old.reopen_segment(info, do_clone, read_only)?;
                    if Arc::ptr_eq(&reader, old) {
                        debug!("sharing unchanged segment {}", info.name);
                        acquired.push_shared(reader)?;
                    } else {
                        debug!("reopened segment {}", info.name);
                        acquired.push_fresh(reader);
                    }
                }
                _ => {
                    debug!("opening new segment {}", info.name);
                    let reader = SegmentReader::open(Arc::clone(&self.storage), info, read_only)?;
                    reader.set_disable_fake_norms(self.config.disable_fake_norms);
                    acquired.push_fresh(reader);
                }
            }
        }

        let mut segments: Vec<Arc<SegmentReader>> =
            acquired.finish().into_iter().map(|(reader, _)| reader).collect();
        segments.reverse();

        let config = self.config.clone().with_read_only(read_only);
        let reader = Self::assemble(
            Arc::clone(&self.storage),
            config,
            Arc::clone(&self.policy),
            infos,
            segments,
        );
        if let Err(e) = self.carry_norms_cache(&reader, &old_by_name) {
            if let Err(close_err) = reader.close() {
                warn!("failed to close partially reopened reader: {close_err}");
            }
            return Err(e);
        }
        Ok(reader)
    }

    /// Seed the new reader's norms cache. Ranges of segments whose norms are
    /// unchanged are copied from this reader's cache; the rest are read from
    /// the segments.
    fn carry_norms_cache(
        &self,
        reader: &DirectoryReader,
        old_by_name: &AHashMap<&str, usize>,
    ) -> Result<()> {
        for (field, old_bytes) in self.subs.cached_norms() {
            if !reader.subs.has_norms(&field)? {
                continue;
            }

            let mut bytes = vec![0u8; reader.max_doc() as usize];
            for (i, segment) in reader.segments.iter().enumerate() {
                let start = reader.subs.starts().start(i) as usize;
                let unchanged = old_by_name.get(segment.name()).and_then(|&old_index| {
                    let old = &self.segments[old_index];
                    let same = Arc::ptr_eq(segment, old)
                        || match (segment.norms_handle(&field), old.norms_handle(&field)) {
                            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
                            (None, None) => true,
                            _ => false,
                        };
                    same.then(|| self.subs.starts().start(old_index) as usize)
                });

                match unchanged {
                    Some(old_start) => {
                        let len = segment.max_doc() as usize;
                        bytes[start..start + len]
                            .copy_from_slice(&old_bytes[old_start..old_start + len]);
                    }
                    None => segment.norms_into(&field, &mut bytes, start)?,
                }
            }
            reader.subs.insert_cached_norms(field, Arc::from(bytes));
        }
        Ok(())
    }

    fn do_commit(
        &self,
        state: &mut DirectoryState,
        user_data: Option<BTreeMap<String, String>>,
    ) -> Result<()> {
        if !state.has_changes {
            return Ok(());
        }
        state.infos.user_data = user_data.unwrap_or_default();

        let mut deleter = IndexFileDeleter::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.policy),
            &state.infos,
        )?;

        self.start_commit(state);
        if let Err(e) = self.write_commit(state) {
            warn!("commit failed, rolling back: {e}");
            self.rollback_commit(state);
            if let Err(refresh_err) = deleter.refresh() {
                warn!("failed to remove files of the failed commit: {refresh_err}");
            }
            deleter.close();
            return Err(e);
        }

        deleter.checkpoint(&state.infos, true)?;
        deleter.close();
        state.rollback = None;

        if let Some(mut lock) = state.write_lock.take() {
            lock.release()?;
            info!("released write lock");
        }
        state.has_changes = false;
        info!(
            "committed {} (version {})",
            state.infos.segments_file_name(),
            state.infos.version
        );
        Ok(())
    }

    fn start_commit(&self, state: &mut DirectoryState) {
        state.rollback = Some((state.infos.clone(), state.has_changes));
        for segment in &self.segments {
            segment.start_commit();
        }
    }

    fn rollback_commit(&self, state: &mut DirectoryState) {
        if let Some((infos, has_changes)) = state.rollback.take() {
            state.infos = infos;
            state.has_changes = has_changes;
        }
        for segment in &self.segments {
            segment.rollback_commit();
        }
    }

    fn write_commit(&self, state: &mut DirectoryState) -> Result<()> {
        for (i, segment) in self.segments.iter().enumerate() {
            segment.commit_changes()?;
            state.infos.segments[i] = segment.segment_info();
        }

        let unsynced: Vec<String> = state
            .infos
            .files(false)
            .into_iter()
            .filter(|name| !state.synced.contains(name))
            .collect();
        self.storage.sync(&unsynced)?;

        state.infos.commit(self.storage.as_ref())?;
        state.synced.extend(unsynced);
        Ok(())
    }

    fn release(&self) -> Result<()> {
        let result = self.subs.release_all();
        if let Some(mut lock) = self.state.lock().write_lock.take()
            && let Err(e) = lock.release()
        {
            warn!("failed to release write lock on close: {e}");
        }
        debug!("closed directory reader");
        result
    }

    fn modify<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&SubReaderSet) -> Result<()>,
    {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.acquire_write_lock(&mut state)?;
        op(&self.subs)?;
        state.has_changes = true;
        Ok(())
    }
}

impl IndexReader for DirectoryReader {
    fn max_doc(&self) -> u64 {
        self.subs.max_doc()
    }

    fn num_docs(&self) -> u64 {
        self.subs.num_docs()
    }

    fn has_deletions(&self) -> bool {
        self.subs.has_deletions()
    }

    fn is_deleted(&self, doc: DocId) -> Result<bool> {
        self.ensure_open()?;
        self.subs.is_deleted(doc)
    }

    fn document(&self, doc: DocId) -> Result<Document> {
        self.ensure_open()?;
        self.subs.document(doc)
    }

    fn term_freq_vectors(&self, doc: DocId) -> Result<Vec<TermFreqVector>> {
        self.ensure_open()?;
        self.subs.term_freq_vectors(doc)
    }

    fn term_freq_vector(&self, doc: DocId, field: &str) -> Result<Option<TermFreqVector>> {
        self.ensure_open()?;
        self.subs.term_freq_vector(doc, field)
    }

    fn terms(&self) -> Result<Box<dyn TermEnum>> {
        self.ensure_open()?;
        self.subs.terms(None)
    }

    fn terms_from(&self, term: &Term) -> Result<Box<dyn TermEnum>> {
        self.ensure_open()?;
        self.subs.terms(Some(term))
    }

    fn doc_freq(&self, term: &Term) -> Result<u32> {
        self.ensure_open()?;
        self.subs.doc_freq(term)
    }

    fn term_docs(&self) -> Result<Box<dyn TermDocs>> {
        self.ensure_open()?;
        Ok(self.subs.term_docs())
    }

    fn term_positions(&self) -> Result<Box<dyn TermPositions>> {
        self.ensure_open()?;
        Ok(self.subs.term_positions())
    }

    fn field_names(&self) -> Result<BTreeSet<String>> {
        self.ensure_open()?;
        self.subs.field_names()
    }

    fn has_norms(&self, field: &str) -> Result<bool> {
        self.ensure_open()?;
        self.subs.has_norms(field)
    }

    fn norms(&self, field: &str) -> Result<Option<Arc<[u8]>>> {
        self.ensure_open()?;
        self.subs.norms(field, self.config.disable_fake_norms)
    }

    fn norms_into(&self, field: &str, buf: &mut [u8], offset: usize) -> Result<()> {
        self.ensure_open()?;
        self.subs.norms_into(field, buf, offset)
    }

    fn delete_document(&self, doc: DocId) -> Result<()> {
        self.modify(|subs| subs.delete_document(doc))
    }

    fn undelete_all(&self) -> Result<()> {
        self.modify(|subs| subs.undelete_all())
    }

    fn set_norm(&self, doc: DocId, field: &str, value: u8) -> Result<()> {
        self.modify(|subs| subs.set_norm(doc, field, value))
    }

    fn has_changes(&self) -> bool {
        self.state.lock().has_changes
    }

    fn commit(&self, user_data: Option<BTreeMap<String, String>>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        self.do_commit(&mut state, user_data)
    }

    fn version(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.state.lock().infos.version)
    }

    fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        let version = self.state.lock().infos.version;
        Ok(SegmentInfos::read_current_version(self.storage.as_ref())? == version)
    }

    fn is_optimized(&self) -> bool {
        self.state.lock().infos.is_optimized()
    }

    fn sequential_sub_readers(&self) -> Vec<Arc<dyn IndexReader>> {
        self.subs.readers().to_vec()
    }

    fn reopen(self: Arc<Self>) -> Result<Arc<dyn IndexReader>> {
        let read_only = self.config.read_only;
        self.do_reopen(read_only, None)
    }

    fn clone_reader(self: Arc<Self>, read_only: bool) -> Result<Arc<dyn IndexReader>> {
        self.ensure_open()?;
        let infos = self.segment_infos();
        let reader = self.reopen_from(infos, true, read_only)?;

        if !read_only {
            let mut old = self.state.lock();
            if let Some(lock) = old.write_lock.take() {
                let mut new = reader.state.lock();
                new.write_lock = Some(lock);
                new.has_changes = old.has_changes;
                reader.subs.set_has_deletions(self.subs.has_deletions());
                old.has_changes = false;
                debug!("write lock moved to cloned reader");
            }
        }
        Ok(reader)
    }

    fn ref_count(&self) -> usize {
        self.ref_count.get()
    }

    fn inc_ref(&self) -> Result<()> {
        self.ref_count.inc()
    }

    fn dec_ref(&self) -> Result<()> {
        self.ensure_open()?;
        if self.ref_count.get() == 1 {
            let mut state = self.state.lock();
            self.do_commit(&mut state, None)?;
        }
        if self.ref_count.dec()? {
            self.release()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.dec_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
