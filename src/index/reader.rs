//! The reader interface shared by segment and composite readers.
//!
//! [`IndexReader`] is implemented by [`SegmentReader`](super::SegmentReader)
//! for one segment, and by the two composite readers,
//! [`DirectoryReader`](super::DirectoryReader) and
//! [`MultiReader`](super::MultiReader). The composites keep their
//! sub-readers in a [`SubReaderSet`], which owns the doc id boundary table
//! and the norms cache and dispatches per-document operations.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use ahash::AHashMap;
use log::warn;
use parking_lot::Mutex;

use crate::DocId;
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::boundary::DocStarts;
use crate::index::multi_terms::{MultiTermDocs, MultiTermEnum, MultiTermPositions};
use crate::index::norms::{default_norm, fake_norms};
use crate::index::postings::{TermDocs, TermEnum, TermFreqVector, TermPositions};
use crate::index::term::Term;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique reader id.
pub fn next_reader_id() -> u64 {
    NEXT_READER_ID.fetch_add(1, Ordering::Relaxed)
}

/// Whether two handles point at the same reader instance.
pub fn same_reader(a: &Arc<dyn IndexReader>, b: &Arc<dyn IndexReader>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Trait for index readers.
///
/// Doc ids are `0..max_doc()`. Mutations (delete, undelete, set norm) are
/// buffered until [`commit`](IndexReader::commit). Readers are reference
/// counted: a reader starts with one reference, every composite that shares
/// it takes another, and its resources are released exactly once, when the
/// count drops to zero.
pub trait IndexReader: Send + Sync + std::fmt::Debug {
    /// One greater than the largest doc id.
    fn max_doc(&self) -> u64;

    /// Number of documents that are not deleted.
    fn num_docs(&self) -> u64;

    /// Whether any document is deleted.
    fn has_deletions(&self) -> bool;

    /// Whether `doc` is deleted.
    fn is_deleted(&self, doc: DocId) -> Result<bool>;

    /// Stored fields of `doc`.
    fn document(&self, doc: DocId) -> Result<Document>;

    /// Term vectors of every indexed field of `doc`, sorted by field. Deleted
    /// documents keep their vectors.
    fn term_freq_vectors(&self, doc: DocId) -> Result<Vec<TermFreqVector>>;

    /// Term vector of `field` in `doc`, or `None` when the field produced
    /// no terms there.
    fn term_freq_vector(&self, doc: DocId, field: &str) -> Result<Option<TermFreqVector>> {
        Ok(self
            .term_freq_vectors(doc)?
            .into_iter()
            .find(|vector| vector.field == field))
    }

    /// Enumerate all terms, positioned before the first.
    fn terms(&self) -> Result<Box<dyn TermEnum>>;

    /// Enumerate terms, positioned on the first term `>= term`.
    fn terms_from(&self, term: &Term) -> Result<Box<dyn TermEnum>>;

    /// Number of documents containing `term`, deleted ones included.
    fn doc_freq(&self, term: &Term) -> Result<u32>;

    /// Unpositioned document iterator.
    fn term_docs(&self) -> Result<Box<dyn TermDocs>>;

    /// Unpositioned position iterator.
    fn term_positions(&self) -> Result<Box<dyn TermPositions>>;

    /// Document iterator positioned on `term`.
    fn term_docs_for(&self, term: &Term) -> Result<Box<dyn TermDocs>> {
        let mut docs = self.term_docs()?;
        docs.seek(term)?;
        Ok(docs)
    }

    /// Position iterator positioned on `term`.
    fn term_positions_for(&self, term: &Term) -> Result<Box<dyn TermPositions>> {
        let mut positions = self.term_positions()?;
        positions.seek(term)?;
        Ok(positions)
    }

    /// Names of all fields.
    fn field_names(&self) -> Result<BTreeSet<String>>;

    /// Whether `field` carries norms.
    fn has_norms(&self, field: &str) -> Result<bool>;

    /// Norms of `field`, one byte per document. Fields without norms get
    /// all-default norms unless fake norms are disabled.
    fn norms(&self, field: &str) -> Result<Option<Arc<[u8]>>>;

    /// Copy the norms of `field` into `buf` starting at `offset`.
    fn norms_into(&self, field: &str, buf: &mut [u8], offset: usize) -> Result<()>;

    /// Mark `doc` deleted.
    fn delete_document(&self, doc: DocId) -> Result<()>;

    /// Undelete every document.
    fn undelete_all(&self) -> Result<()>;

    /// Change the norm of `field` in `doc`.
    fn set_norm(&self, doc: DocId, field: &str, value: u8) -> Result<()>;

    /// Whether there are uncommitted changes.
    fn has_changes(&self) -> bool;

    /// Write pending changes.
    fn commit(&self, user_data: Option<BTreeMap<String, String>>) -> Result<()>;

    /// Version of the commit this reader reflects.
    fn version(&self) -> Result<u64>;

    /// Whether this reader still reflects the latest commit.
    fn is_current(&self) -> Result<bool>;

    /// Whether the reader is a single segment without deletions.
    fn is_optimized(&self) -> bool;

    /// The sub-readers in doc id order; empty for a segment reader.
    fn sequential_sub_readers(&self) -> Vec<Arc<dyn IndexReader>>;

    /// A reader reflecting the latest state, or this very instance when
    /// nothing changed.
    fn reopen(self: Arc<Self>) -> Result<Arc<dyn IndexReader>>;

    /// A new reader over the same state, with the requested mode.
    fn clone_reader(self: Arc<Self>, read_only: bool) -> Result<Arc<dyn IndexReader>>;

    /// Current reference count.
    fn ref_count(&self) -> usize;

    /// Take another reference.
    fn inc_ref(&self) -> Result<()>;

    /// Drop a reference, releasing resources when it was the last one.
    fn dec_ref(&self) -> Result<()>;

    /// Release this handle's reference. Calling it again is a no-op.
    fn close(&self) -> Result<()>;

    /// Whether every reference has been released.
    fn is_closed(&self) -> bool {
        self.ref_count() == 0
    }

    /// Get this reader as Any for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// An atomic reference count starting at one.
#[derive(Debug)]
pub struct RefCount(AtomicUsize);

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

impl RefCount {
    /// A count of one.
    pub fn new() -> Self {
        RefCount(AtomicUsize::new(1))
    }

    /// Current count.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Increment. Fails once the count has reached zero.
    pub fn inc(&self) -> Result<()> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                (c > 0).then_some(c + 1)
            })
            .map(|_| ())
            .map_err(|_| BraidError::already_closed("reference count already reached zero"))
    }

    /// Decrement, returning true when this released the last reference.
    pub fn dec(&self) -> Result<bool> {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
            .map(|previous| previous == 1)
            .map_err(|_| BraidError::already_closed("reference count underflow"))
    }
}

/// Readers acquired while building a composite reader.
///
/// Dropping it without calling [`finish`](Self::finish) releases every
/// reader in reverse order of acquisition: fresh readers are closed, shared
/// readers give back the reference taken for them.
#[derive(Debug)]
pub struct AcquiredReaders<R: IndexReader + ?Sized> {
    entries: Vec<(Arc<R>, bool)>,
}

impl<R: IndexReader + ?Sized> Default for AcquiredReaders<R> {
    fn default() -> Self {
        AcquiredReaders {
            entries: Vec::new(),
        }
    }
}

impl<R: IndexReader + ?Sized> AcquiredReaders<R> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reader opened for the composite being built.
    pub fn push_fresh(&mut self, reader: Arc<R>) {
        self.entries.push((reader, false));
    }

    /// Take a reference on a reader shared with another composite.
    pub fn push_shared(&mut self, reader: Arc<R>) -> Result<()> {
        reader.inc_ref()?;
        self.entries.push((reader, true));
        Ok(())
    }

    /// Number of readers acquired so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was acquired.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keep every reader, returning them with their shared flag in
    /// acquisition order.
    pub fn finish(mut self) -> Vec<(Arc<R>, bool)> {
        std::mem::take(&mut self.entries)
    }
}

impl<R: IndexReader + ?Sized> Drop for AcquiredReaders<R> {
    fn drop(&mut self) {
        while let Some((reader, shared)) = self.entries.pop() {
            let released = if shared {
                reader.dec_ref()
            } else {
                reader.close()
            };
            if let Err(e) = released {
                warn!("failed to release reader during rollback: {e}");
            }
        }
    }
}

/// Sub-readers of a composite reader with their doc id boundaries, the
/// per-field norms cache and cached counts.
#[derive(Debug)]
pub struct SubReaderSet {
    id: u64,
    readers: Vec<Arc<dyn IndexReader>>,
    starts: DocStarts,
    decref_on_close: Vec<bool>,
    norms_cache: Mutex<AHashMap<String, Arc<[u8]>>>,
    fake_norms: Mutex<Option<Arc<[u8]>>>,
    num_docs: Mutex<Option<u64>>,
    has_deletions: AtomicBool,
}

impl SubReaderSet {
    /// Build the boundary table over `readers`. `decref_on_close[i]` says
    /// whether reader `i` is only borrowed (released with `dec_ref`) rather
    /// than owned (released with `close`).
    pub fn new(readers: Vec<Arc<dyn IndexReader>>, decref_on_close: Vec<bool>) -> Self {
        debug_assert_eq!(readers.len(), decref_on_close.len());
        let starts = DocStarts::from_max_docs(readers.iter().map(|r| r.max_doc()));
        let has_deletions = readers.iter().any(|r| r.has_deletions());
        SubReaderSet {
            id: next_reader_id(),
            readers,
            starts,
            decref_on_close,
            norms_cache: Mutex::new(AHashMap::new()),
            fake_norms: Mutex::new(None),
            num_docs: Mutex::new(None),
            has_deletions: AtomicBool::new(has_deletions),
        }
    }

    /// Id identifying the owning composite to merged iterators.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The sub-readers.
    pub fn readers(&self) -> &[Arc<dyn IndexReader>] {
        &self.readers
    }

    /// The doc id boundaries.
    pub fn starts(&self) -> &DocStarts {
        &self.starts
    }

    /// Total documents.
    pub fn max_doc(&self) -> u64 {
        self.starts.max_doc()
    }

    /// Live documents, computed once and cached until the next delete or
    /// undelete.
    pub fn num_docs(&self) -> u64 {
        let mut cached = self.num_docs.lock();
        *cached.get_or_insert_with(|| self.readers.iter().map(|r| r.num_docs()).sum())
    }

    /// Whether any sub-reader has deletions.
    pub fn has_deletions(&self) -> bool {
        self.has_deletions.load(Ordering::Acquire)
    }

    /// Override the deletions flag.
    pub fn set_has_deletions(&self, value: bool) {
        self.has_deletions.store(value, Ordering::Release);
    }

    /// Whether global doc `doc` is deleted.
    pub fn is_deleted(&self, doc: DocId) -> Result<bool> {
        let (i, local) = self.starts.locate(doc)?;
        self.readers[i].is_deleted(local)
    }

    /// Stored fields of global doc `doc`.
    pub fn document(&self, doc: DocId) -> Result<Document> {
        let (i, local) = self.starts.locate(doc)?;
        self.readers[i].document(local)
    }

    /// Term vectors of global doc `doc`.
    pub fn term_freq_vectors(&self, doc: DocId) -> Result<Vec<TermFreqVector>> {
        let (i, local) = self.starts.locate(doc)?;
        self.readers[i].term_freq_vectors(local)
    }

    /// Term vector of `field` in global doc `doc`.
    pub fn term_freq_vector(&self, doc: DocId, field: &str) -> Result<Option<TermFreqVector>> {
        let (i, local) = self.starts.locate(doc)?;
        self.readers[i].term_freq_vector(local, field)
    }

    /// Delete global doc `doc` in its sub-reader.
    pub fn delete_document(&self, doc: DocId) -> Result<()> {
        let (i, local) = self.starts.locate(doc)?;
        *self.num_docs.lock() = None;
        self.readers[i].delete_document(local)?;
        self.set_has_deletions(true);
        Ok(())
    }

    /// Undelete everything in every sub-reader.
    pub fn undelete_all(&self) -> Result<()> {
        *self.num_docs.lock() = None;
        for reader in &self.readers {
            reader.undelete_all()?;
        }
        self.set_has_deletions(false);
        Ok(())
    }

    /// Whether any sub-reader has norms for `field`.
    pub fn has_norms(&self, field: &str) -> Result<bool> {
        for reader in &self.readers {
            if reader.has_norms(field)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Norms of `field` over all sub-readers, cached per field.
    pub fn norms(&self, field: &str, disable_fake_norms: bool) -> Result<Option<Arc<[u8]>>> {
        let mut cache = self.norms_cache.lock();
        if let Some(bytes) = cache.get(field) {
            return Ok(Some(Arc::clone(bytes)));
        }
        if !self.has_norms(field)? {
            if disable_fake_norms {
                return Ok(None);
            }
            let mut fake = self.fake_norms.lock();
            let ones = fake.get_or_insert_with(|| fake_norms(self.max_doc() as usize));
            return Ok(Some(Arc::clone(ones)));
        }

        let mut bytes = vec![0u8; self.max_doc() as usize];
        for (i, reader) in self.readers.iter().enumerate() {
            reader.norms_into(field, &mut bytes, self.starts.start(i) as usize)?;
        }
        let bytes: Arc<[u8]> = Arc::from(bytes);
        cache.insert(field.to_string(), Arc::clone(&bytes));
        Ok(Some(bytes))
    }

    /// Copy the norms of `field` into `buf` at `offset`.
    pub fn norms_into(&self, field: &str, buf: &mut [u8], offset: usize) -> Result<()> {
        let max_doc = self.max_doc() as usize;
        let buf_len = buf.len();
        let target = buf.get_mut(offset..offset + max_doc).ok_or_else(|| {
            BraidError::invalid_argument(format!(
                "norms buffer of {buf_len} bytes cannot hold {max_doc} norms at offset {offset}"
            ))
        })?;

        let cache = self.norms_cache.lock();
        if let Some(bytes) = cache.get(field) {
            target.copy_from_slice(bytes);
        } else if !self.has_norms(field)? {
            target.fill(default_norm());
        } else {
            for (i, reader) in self.readers.iter().enumerate() {
                reader.norms_into(field, buf, offset + self.starts.start(i) as usize)?;
            }
        }
        Ok(())
    }

    /// Set a norm in the owning sub-reader and drop the cached norms of
    /// `field`.
    pub fn set_norm(&self, doc: DocId, field: &str, value: u8) -> Result<()> {
        let (i, local) = self.starts.locate(doc)?;
        let mut cache = self.norms_cache.lock();
        cache.remove(field);
        self.readers[i].set_norm(local, field, value)
    }

    /// Snapshot of the norms cache.
    pub fn cached_norms(&self) -> Vec<(String, Arc<[u8]>)> {
        self.norms_cache
            .lock()
            .iter()
            .map(|(field, bytes)| (field.clone(), Arc::clone(bytes)))
            .collect()
    }

    /// Seed the norms cache.
    pub fn insert_cached_norms(&self, field: String, bytes: Arc<[u8]>) {
        self.norms_cache.lock().insert(field, bytes);
    }

    /// Sum of the sub-readers' document frequencies.
    pub fn doc_freq(&self, term: &Term) -> Result<u32> {
        let mut total = 0;
        for reader in &self.readers {
            total += reader.doc_freq(term)?;
        }
        Ok(total)
    }

    /// Merged term enumeration.
    pub fn terms(&self, from: Option<&Term>) -> Result<Box<dyn TermEnum>> {
        Ok(Box::new(MultiTermEnum::new(
            self.id,
            &self.readers,
            &self.starts,
            from,
        )?))
    }

    /// Merged document iterator.
    pub fn term_docs(&self) -> Box<dyn TermDocs> {
        Box::new(MultiTermDocs::new(
            self.id,
            self.readers.clone(),
            self.starts.clone(),
        ))
    }

    /// Merged position iterator.
    pub fn term_positions(&self) -> Box<dyn TermPositions> {
        Box::new(MultiTermPositions::new(
            self.id,
            self.readers.clone(),
            self.starts.clone(),
        ))
    }

    /// Union of the sub-readers' field names.
    pub fn field_names(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for reader in &self.readers {
            names.extend(reader.field_names()?);
        }
        Ok(names)
    }

    /// Whether every sub-reader reflects the latest state.
    pub fn all_current(&self) -> Result<bool> {
        for reader in &self.readers {
            if !reader.is_current()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether any sub-reader has pending changes.
    pub fn any_changes(&self) -> bool {
        self.readers.iter().any(|r| r.has_changes())
    }

    /// Release every sub-reader, continuing past failures and returning the
    /// first one.
    pub fn release_all(&self) -> Result<()> {
        self.norms_cache.lock().clear();
        let mut first_error = None;
        for (reader, &decref) in self.readers.iter().zip(&self.decref_on_close) {
            let released = if decref {
                reader.dec_ref()
            } else {
                reader.close()
            };
            if let Err(e) = released {
                warn!("failed to release sub-reader: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_count() {
        let count = RefCount::new();
        assert_eq!(count.get(), 1);

        count.inc().unwrap();
        assert!(!count.dec().unwrap());
        assert!(count.dec().unwrap());
        assert_eq!(count.get(), 0);

        assert!(matches!(count.dec(), Err(BraidError::AlreadyClosed(_))));
        assert!(count.inc().is_err());
    }

    #[test]
    fn test_reader_ids_are_unique() {
        let a = next_reader_id();
        let b = next_reader_id();
        assert_ne!(a, b);
    }
}
