//! Merged term and postings iteration over the sub-readers of a composite
//! reader.
//!
//! [`MultiTermEnum`] runs a k-way merge of the sub-readers' sorted term
//! enumerations. The sub-readers holding the current term form the matching
//! set, and the merged document frequency is the sum over that set.
//! [`MultiPostings`] visits the sub-readers in doc id order and adds each
//! one's base to its local doc ids. Seeded from a [`MultiTermEnum`] of the
//! same reader, it only visits the matching set.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::DocId;
use crate::error::{BraidError, Result};
use crate::index::boundary::DocStarts;
use crate::index::merge_queue::{SegmentMergeInfo, SegmentMergeQueue};
use crate::index::postings::{TermDocs, TermEnum, TermPositions, TermState};
use crate::index::reader::IndexReader;
use crate::index::term::Term;

/// Terms of several sub-readers merged into one sorted enumeration.
#[derive(Debug)]
pub struct MultiTermEnum {
    reader_id: u64,
    queue: SegmentMergeQueue,
    matching: Vec<SegmentMergeInfo>,
    term: Option<Term>,
    doc_freq: u32,
}

impl MultiTermEnum {
    /// Merge the terms of `readers`. Without `from` the enumeration starts
    /// before the first term; with it, on the first term `>= from`.
    pub fn new(
        reader_id: u64,
        readers: &[Arc<dyn IndexReader>],
        starts: &DocStarts,
        from: Option<&Term>,
    ) -> Result<Self> {
        let mut merged = MultiTermEnum {
            reader_id,
            queue: SegmentMergeQueue::with_capacity(readers.len()),
            matching: Vec::with_capacity(readers.len()),
            term: None,
            doc_freq: 0,
        };

        if let Err(e) = merged.fill_queue(readers, starts, from) {
            merged.close();
            return Err(e);
        }
        if from.is_some()
            && !merged.queue.is_empty()
            && let Err(e) = merged.next()
        {
            merged.close();
            return Err(e);
        }
        Ok(merged)
    }

    fn fill_queue(
        &mut self,
        readers: &[Arc<dyn IndexReader>],
        starts: &DocStarts,
        from: Option<&Term>,
    ) -> Result<()> {
        for (i, reader) in readers.iter().enumerate() {
            let term_enum = match from {
                Some(term) => reader.terms_from(term)?,
                None => reader.terms()?,
            };
            let mut info = SegmentMergeInfo::new(starts.start(i), i, term_enum, Arc::clone(reader));
            let positioned = match from {
                Some(_) => Ok(info.term().is_some()),
                None => info.next(),
            };
            match positioned {
                Ok(true) => self.queue.push(info),
                Ok(false) => info.close(),
                Err(e) => {
                    info.close();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Id of the composite reader this enumeration belongs to.
    pub fn reader_id(&self) -> u64 {
        self.reader_id
    }

    /// The sub-readers holding the current term, lowest base first. Valid
    /// until the next call to `next`.
    pub fn matching_segments(&self) -> &[SegmentMergeInfo] {
        &self.matching
    }

    fn advance_matching(&mut self) -> Result<()> {
        while let Some(mut info) = self.matching.pop() {
            match info.next() {
                Ok(true) => self.queue.push(info),
                Ok(false) => info.close(),
                Err(e) => {
                    info.close();
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl TermEnum for MultiTermEnum {
    fn next(&mut self) -> Result<bool> {
        self.advance_matching()?;

        let Some(term) = self.queue.top().and_then(|top| top.term()).cloned() else {
            self.term = None;
            self.doc_freq = 0;
            return Ok(false);
        };

        self.doc_freq = 0;
        while self
            .queue
            .top()
            .is_some_and(|top| top.term() == Some(&term))
        {
            if let Some(info) = self.queue.pop() {
                self.doc_freq += info.doc_freq();
                self.matching.push(info);
            }
        }
        self.term = Some(term);
        Ok(true)
    }

    fn term(&self) -> Option<&Term> {
        self.term.as_ref()
    }

    fn doc_freq(&self) -> u32 {
        self.doc_freq
    }

    fn close(&mut self) {
        for info in &mut self.matching {
            info.close();
        }
        self.matching.clear();
        self.queue.close();
        self.term = None;
        self.doc_freq = 0;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Postings of one term across several sub-readers, in global doc id order.
pub struct MultiPostings<P: TermDocs + ?Sized> {
    reader_id: u64,
    readers: Vec<Arc<dyn IndexReader>>,
    starts: DocStarts,
    opener: fn(&dyn IndexReader) -> Result<Box<P>>,
    reader_docs: Vec<Option<Box<P>>>,
    term: Option<Term>,
    matching: Option<Vec<(usize, Option<TermState>)>>,
    match_pos: usize,
    pointer: usize,
    base: DocId,
    current: Option<usize>,
}

/// Merged document iterator.
pub type MultiTermDocs = MultiPostings<dyn TermDocs>;

/// Merged position iterator.
pub type MultiTermPositions = MultiPostings<dyn TermPositions>;

fn open_term_docs(reader: &dyn IndexReader) -> Result<Box<dyn TermDocs>> {
    reader.term_docs()
}

fn open_term_positions(reader: &dyn IndexReader) -> Result<Box<dyn TermPositions>> {
    reader.term_positions()
}

impl MultiPostings<dyn TermDocs> {
    /// Unpositioned iterator over `readers`.
    pub fn new(reader_id: u64, readers: Vec<Arc<dyn IndexReader>>, starts: DocStarts) -> Self {
        Self::with_opener(reader_id, readers, starts, open_term_docs)
    }
}

impl MultiPostings<dyn TermPositions> {
    /// Unpositioned iterator over `readers`.
    pub fn new(reader_id: u64, readers: Vec<Arc<dyn IndexReader>>, starts: DocStarts) -> Self {
        Self::with_opener(reader_id, readers, starts, open_term_positions)
    }
}

impl<P: TermDocs + ?Sized> MultiPostings<P> {
    fn with_opener(
        reader_id: u64,
        readers: Vec<Arc<dyn IndexReader>>,
        starts: DocStarts,
        opener: fn(&dyn IndexReader) -> Result<Box<P>>,
    ) -> Self {
        let reader_docs = readers.iter().map(|_| None).collect();
        MultiPostings {
            reader_id,
            readers,
            starts,
            opener,
            reader_docs,
            term: None,
            matching: None,
            match_pos: 0,
            pointer: 0,
            base: 0,
            current: None,
        }
    }

    fn reset(&mut self, term: Option<Term>) {
        self.term = term;
        self.matching = None;
        self.match_pos = 0;
        self.pointer = 0;
        self.base = 0;
        self.current = None;
    }

    fn current_docs(&self) -> Option<&P> {
        match self.current {
            Some(i) => self.reader_docs[i].as_deref(),
            None => None,
        }
    }

    fn current_docs_mut(&mut self) -> Option<&mut P> {
        match self.current {
            Some(i) => self.reader_docs[i].as_deref_mut(),
            None => None,
        }
    }

    fn positioned(&mut self) -> Result<&mut P> {
        self.current_docs_mut()
            .ok_or_else(|| BraidError::invalid_argument("postings are not positioned on a document"))
    }

    /// Move to the next participating sub-reader. Returns false once every
    /// sub-reader has been visited.
    fn advance_segment(&mut self) -> Result<bool> {
        if self.pointer >= self.readers.len() {
            return Ok(false);
        }

        let mut state = None;
        if let Some(matching) = &self.matching {
            match matching.get(self.match_pos) {
                Some(&(ord, term_state)) => {
                    self.match_pos += 1;
                    self.pointer = ord;
                    state = term_state;
                }
                None => {
                    self.pointer = self.readers.len();
                    return Ok(false);
                }
            }
        }

        let i = self.pointer;
        self.pointer += 1;
        self.base = self.starts.start(i);
        self.current = self.seek_segment(i, state)?;
        Ok(true)
    }

    fn seek_segment(&mut self, i: usize, state: Option<TermState>) -> Result<Option<usize>> {
        let Some(term) = self.term.clone() else {
            return Ok(None);
        };
        let opener = self.opener;
        let docs = match &mut self.reader_docs[i] {
            Some(docs) => docs,
            slot @ None => slot.insert(opener(self.readers[i].as_ref())?),
        };
        docs.seek_state(&term, state.as_ref())?;
        Ok(Some(i))
    }
}

impl<P: TermDocs + ?Sized> fmt::Debug for MultiPostings<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiPostings")
            .field("reader_id", &self.reader_id)
            .field("readers", &self.readers.len())
            .field("term", &self.term)
            .field("pointer", &self.pointer)
            .field("base", &self.base)
            .field("current", &self.current)
            .finish()
    }
}

impl<P: TermDocs + ?Sized> TermDocs for MultiPostings<P> {
    fn seek(&mut self, term: &Term) -> Result<()> {
        self.reset(Some(term.clone()));
        Ok(())
    }

    fn seek_enum(&mut self, terms: &dyn TermEnum) -> Result<()> {
        self.reset(terms.term().cloned());
        if let Some(merged) = terms.as_any().downcast_ref::<MultiTermEnum>()
            && merged.reader_id() == self.reader_id
        {
            self.matching = Some(
                merged
                    .matching_segments()
                    .iter()
                    .map(|info| (info.ord(), info.term_state()))
                    .collect(),
            );
        }
        Ok(())
    }

    fn doc(&self) -> DocId {
        self.current_docs().map_or(0, |docs| self.base + docs.doc())
    }

    fn freq(&self) -> u32 {
        self.current_docs().map_or(0, |docs| docs.freq())
    }

    fn next(&mut self) -> Result<bool> {
        loop {
            if let Some(docs) = self.current_docs_mut()
                && docs.next()?
            {
                return Ok(true);
            }
            if !self.advance_segment()? {
                return Ok(false);
            }
        }
    }

    fn read(&mut self, docs: &mut [DocId], freqs: &mut [u32]) -> Result<usize> {
        loop {
            while self.current.is_none() {
                if !self.advance_segment()? {
                    return Ok(0);
                }
            }
            let base = self.base;
            let read = match self.current_docs_mut() {
                Some(current) => current.read(docs, freqs)?,
                None => 0,
            };
            if read == 0 {
                self.current = None;
            } else {
                for doc in &mut docs[..read] {
                    *doc += base;
                }
                return Ok(read);
            }
        }
    }

    fn skip_to(&mut self, target: DocId) -> Result<bool> {
        loop {
            // Targets before this segment clamp to its first document.
        let local = target.saturating_sub(self.base);
            if let Some(docs) = self.current_docs_mut()
                && docs.skip_to(local)?
            {
                return Ok(true);
            }
            if !self.advance_segment()? {
                return Ok(false);
            }
        }
    }

    fn close(&mut self) {
        for docs in self.reader_docs.iter_mut().flatten() {
            docs.close();
        }
        self.current = None;
    }
}

impl TermPositions for MultiPostings<dyn TermPositions> {
    fn next_position(&mut self) -> Result<u32> {
        self.positioned()?.next_position()
    }

    fn payload_length(&self) -> usize {
        self.current_docs().map_or(0, |p| p.payload_length())
    }

    fn payload(&mut self) -> Result<&[u8]> {
        self.positioned()?.payload()
    }

    fn is_payload_available(&self) -> bool {
        self.current_docs().is_some_and(|p| p.is_payload_available())
    }
}
