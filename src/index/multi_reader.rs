//! Composite reader over an arbitrary list of readers.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::DocId;
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::postings::{TermDocs, TermEnum, TermFreqVector, TermPositions};
use crate::index::reader::{AcquiredReaders, IndexReader, RefCount, SubReaderSet, same_reader};
use crate::index::term::Term;

/// Presents several readers, of any kind, as one index.
///
/// Doc ids of sub-reader `i` are shifted by the total `max_doc` of the
/// readers before it.
#[derive(Debug)]
pub struct MultiReader {
    subs: SubReaderSet,
    disable_fake_norms: AtomicBool,
    has_changes: Mutex<bool>,
    ref_count: RefCount,
    closed: AtomicBool,
}

impl MultiReader {
    /// Combine `subs`. With `close_subs` the new reader owns them and closes
    /// them when it is closed; otherwise it takes a reference on each and
    /// gives it back on close.
    pub fn new(subs: Vec<Arc<dyn IndexReader>>, close_subs: bool) -> Result<Arc<Self>> {
        if !close_subs {
            let mut acquired = AcquiredReaders::<dyn IndexReader>::new();
            for sub in &subs {
                acquired.push_shared(Arc::clone(sub))?;
            }
            acquired.finish();
        }
        let decref_on_close = vec![!close_subs; subs.len()];
        Ok(Self::assemble(subs, decref_on_close, false))
    }

    fn assemble(
        subs: Vec<Arc<dyn IndexReader>>,
        decref_on_close: Vec<bool>,
        disable_fake_norms: bool,
    ) -> Arc<Self> {
        Arc::new(MultiReader {
            subs: SubReaderSet::new(subs, decref_on_close),
            disable_fake_norms: AtomicBool::new(disable_fake_norms),
            has_changes: Mutex::new(false),
            ref_count: RefCount::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The doc id boundaries of the sub-readers.
    pub fn doc_starts(&self) -> &crate::index::boundary::DocStarts {
        self.subs.starts()
    }

    /// Return `None` from [`norms`](IndexReader::norms) for fields without
    /// norms.
    pub fn set_disable_fake_norms(&self, disable: bool) {
        self.disable_fake_norms.store(disable, Ordering::Relaxed);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.ref_count.get() == 0 {
            return Err(BraidError::already_closed("multi reader is closed"));
        }
        Ok(())
    }

    /// Reopen or clone every sub-reader. Returns this instance when every
    /// sub-reader came back unchanged.
    fn do_reopen(
        self: Arc<Self>,
        clone_mode: Option<bool>,
    ) -> Result<Arc<dyn IndexReader>> {
        self.ensure_open()?;

        let mut acquired = AcquiredReaders::<dyn IndexReader>::new();
        let mut reopened = false;
        for sub in self.subs.readers() {
            let new_sub = match clone_mode {
                Some(read_only) => Arc::clone(sub).clone_reader(read_only)?,
                None => Arc::clone(sub).reopen()?,
            };
            if same_reader(&new_sub, sub) {
                acquired.push_shared(new_sub)?;
            } else {
                reopened = true;
                acquired.push_fresh(new_sub);
            }
        }

        if !reopened {
            debug!("no sub-reader changed, reopen returns the same instance");
            drop(acquired);
            return Ok(self);
        }

        let (subs, decref_on_close) = acquired.finish().into_iter().unzip();
        Ok(Self::assemble(
            subs,
            decref_on_close,
            self.disable_fake_norms.load(Ordering::Relaxed),
        ))
    }

    fn modify<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&SubReaderSet) -> Result<()>,
    {
        self.ensure_open()?;
        let mut has_changes = self.has_changes.lock();
        op(&self.subs)?;
        *has_changes = true;
        Ok(())
    }

    fn do_commit(&self, user_data: Option<BTreeMap<String, String>>) -> Result<()> {
        let mut has_changes = self.has_changes.lock();
        if *has_changes {
            for sub in self.subs.readers() {
                sub.commit(user_data.clone())?;
            }
        }
        *has_changes = false;
        Ok(())
    }
}

impl IndexReader for MultiReader {
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
        self.subs
            .norms(field, self.disable_fake_norms.load(Ordering::Relaxed))
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
        *self.has_changes.lock()
    }

    fn commit(&self, user_data: Option<BTreeMap<String, String>>) -> Result<()> {
        self.ensure_open()?;
        self.do_commit(user_data)
    }

    fn version(&self) -> Result<u64> {
        Err(BraidError::other(
            "a multi reader spans several indexes and has no single version",
        ))
    }

    fn is_current(&self) -> Result<bool> {
        self.ensure_open()?;
        self.subs.all_current()
    }

    fn is_optimized(&self) -> bool {
        false
    }

    fn sequential_sub_readers(&self) -> Vec<Arc<dyn IndexReader>> {
        self.subs.readers().to_vec()
    }

    fn reopen(self: Arc<Self>) -> Result<Arc<dyn IndexReader>> {
        self.do_reopen(None)
    }

    fn clone_reader(self: Arc<Self>, read_only: bool) -> Result<Arc<dyn IndexReader>> {
        self.do_reopen(Some(read_only))
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
            self.do_commit(None)?;
        }
        if self.ref_count.dec()? {
            self.subs.release_all()?;
            debug!("closed multi reader");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_reader() {
        let reader = MultiReader::new(Vec::new(), true).unwrap();
        assert_eq!(reader.max_doc(), 0);
        assert_eq!(reader.num_docs(), 0);
        assert!(reader.field_names().unwrap().is_empty());

        let mut terms = reader.terms().unwrap();
        assert!(!terms.next().unwrap());
        assert!(reader.document(0).is_err());
    }

    #[test]
    fn test_nested_readers_and_shared_refcounts() {
        let inner = MultiReader::new(Vec::new(), true).unwrap();
        let inner_dyn: Arc<dyn IndexReader> = inner.clone();

        let outer = MultiReader::new(vec![Arc::clone(&inner_dyn)], false).unwrap();
        assert_eq!(inner.ref_count(), 2);

        let same = Arc::clone(&outer).reopen().unwrap();
        assert!(same_reader(&same, &(outer.clone() as Arc<dyn IndexReader>)));
        assert_eq!(inner.ref_count(), 2);

        outer.close().unwrap();
        assert_eq!(inner.ref_count(), 1);
        inner.close().unwrap();
        assert!(inner.is_closed());
    }
}
