//! Per-segment term and postings iteration.
//!
//! A segment stores its terms sorted, each with two byte streams built by
//! the slab pool at write time:
//!
//! - freq stream: per document `vint(doc_delta)` then `vint(freq)`. The first
//!   delta is the doc id itself.
//! - prox stream: per document `freq` entries of
//!   `vint(position_delta << 1 | has_payload)`, followed by `vint(len)` and
//!   `len` payload bytes when the low bit is set. Positions restart from 0
//!   in every document.
//!
//! The traits here are what the merged iterators consume; composite readers
//! implement them too, so merges nest.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use bit_vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::DocId;
use crate::document::Document;
use crate::error::{BraidError, Result};
use crate::index::segment_reader::SegmentCore;
use crate::index::term::Term;
use crate::util::ByteCursor;

/// Per-field metadata of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,

    /// Whether the field produced terms.
    pub indexed: bool,

    /// Whether the field carries norms.
    pub has_norms: bool,

    /// Whether any position of the field carries a payload.
    pub stores_payloads: bool,
}

/// One term of a segment with its encoded postings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    /// The term.
    pub term: Term,

    /// Number of documents containing the term, deleted ones included.
    pub doc_freq: u32,

    /// Encoded documents and frequencies.
    pub freq: Vec<u8>,

    /// Encoded positions and payloads.
    pub prox: Vec<u8>,
}

/// Terms of one field of one document, sorted by text, with their
/// frequencies and positions.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TermFreqVector {
    /// Field the terms came from.
    pub field: String,

    /// Distinct term texts in ascending order.
    pub terms: Vec<String>,

    /// Frequency of each term in the document.
    pub freqs: Vec<u32>,

    /// Positions of each term, ascending.
    pub positions: Vec<Vec<u32>>,
}

impl TermFreqVector {
    /// Number of distinct terms.
    pub fn size(&self) -> usize {
        self.terms.len()
    }

    /// Index of `text` in [`terms`](TermFreqVector::terms).
    pub fn index_of(&self, text: &str) -> Option<usize> {
        self.terms
            .binary_search_by(|t| t.as_str().cmp(text))
            .ok()
    }

    /// Frequency of `text`, zero when absent.
    pub fn freq(&self, text: &str) -> u32 {
        self.index_of(text).map_or(0, |i| self.freqs[i])
    }
}

/// The contents of a segment data file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentData {
    /// Number of documents.
    pub max_doc: u64,

    /// Field metadata, sorted by name.
    pub fields: Vec<FieldInfo>,

    /// Terms in ascending order.
    pub terms: Vec<TermEntry>,

    /// Stored documents, by local doc id.
    pub documents: Vec<Document>,

    /// Norms as written, one byte per document.
    pub norms: BTreeMap<String, Vec<u8>>,

    /// Term vectors by local doc id, one per indexed field, sorted by field.
    pub term_vectors: Vec<Vec<TermFreqVector>>,
}

impl SegmentData {
    /// Position of `term`, or where it would be inserted.
    pub fn find(&self, term: &Term) -> std::result::Result<usize, usize> {
        self.terms.binary_search_by(|entry| entry.term.cmp(term))
    }

    /// Index of the first term `>= term`.
    pub fn seek_ceil(&self, term: &Term) -> usize {
        self.terms.partition_point(|entry| entry.term < *term)
    }

    /// Check the structural invariants a reader relies on.
    pub fn validate(&self) -> Result<()> {
        if self.documents.len() as u64 != self.max_doc {
            return Err(BraidError::corrupt(format!(
                "segment has {} stored documents but max_doc {}",
                self.documents.len(),
                self.max_doc
            )));
        }
        if self.term_vectors.len() as u64 != self.max_doc {
            return Err(BraidError::corrupt(format!(
                "segment has term vectors for {} documents but max_doc {}",
                self.term_vectors.len(),
                self.max_doc
            )));
        }
        if self.terms.windows(2).any(|w| w[0].term >= w[1].term) {
            return Err(BraidError::corrupt("segment terms are not sorted"));
        }
        for (field, norms) in &self.norms {
            if norms.len() as u64 != self.max_doc {
                return Err(BraidError::corrupt(format!(
                    "norms of field {field} cover {} documents, expected {}",
                    norms.len(),
                    self.max_doc
                )));
            }
        }
        Ok(())
    }
}

/// Handle to a term inside one segment core. Lets postings skip the term
/// lookup when seeded from an enumeration over the same core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermState {
    /// Id of the segment core the term belongs to.
    pub segment: u64,

    /// Ordinal of the term within the segment.
    pub ord: usize,
}

/// A sorted enumeration of terms.
pub trait TermEnum: Send + std::fmt::Debug {
    /// Advance to the next term. Returns false once exhausted.
    fn next(&mut self) -> Result<bool>;

    /// The current term, or `None` before the first `next` and once exhausted.
    fn term(&self) -> Option<&Term>;

    /// Number of documents containing the current term.
    fn doc_freq(&self) -> u32;

    /// Handle to the current term, when the enumeration reads one segment.
    fn term_state(&self) -> Option<TermState> {
        None
    }

    /// Release resources. Safe to call repeatedly.
    fn close(&mut self);

    /// Downcasting support, used to recognise merged enumerations.
    fn as_any(&self) -> &dyn Any;
}

/// Iterates the documents containing a term, in increasing doc id order.
pub trait TermDocs: Send + std::fmt::Debug {
    /// Position on the postings of `term`.
    fn seek(&mut self, term: &Term) -> Result<()>;

    /// Position on the postings of `term`, using `state` to skip the lookup
    /// when it belongs to this segment.
    fn seek_state(&mut self, term: &Term, _state: Option<&TermState>) -> Result<()> {
        self.seek(term)
    }

    /// Position on the postings of the enumeration's current term.
    fn seek_enum(&mut self, terms: &dyn TermEnum) -> Result<()>;

    /// Current document.
    fn doc(&self) -> DocId;

    /// Occurrences of the term in the current document.
    fn freq(&self) -> u32;

    /// Advance to the next document. Returns false once exhausted.
    fn next(&mut self) -> Result<bool>;

    /// Fill `docs` and `freqs` with the following documents, returning how
    /// many were read. Zero means exhausted.
    fn read(&mut self, docs: &mut [DocId], freqs: &mut [u32]) -> Result<usize>;

    /// Advance to the first document `>= target`, moving at least once.
    fn skip_to(&mut self, target: DocId) -> Result<bool>;

    /// Release resources. Safe to call repeatedly.
    fn close(&mut self);
}

/// [`TermDocs`] that also exposes positions and payloads.
pub trait TermPositions: TermDocs {
    /// Next position of the term in the current document.
    fn next_position(&mut self) -> Result<u32>;

    /// Length of the payload at the current position.
    fn payload_length(&self) -> usize;

    /// Payload at the current position. Can be read once per position.
    fn payload(&mut self) -> Result<&[u8]>;

    /// Whether the current position has a payload not yet read.
    fn is_payload_available(&self) -> bool;
}

/// Enumerates the terms of one segment.
#[derive(Debug)]
pub struct SegmentTermEnum {
    core: Arc<SegmentCore>,
    current: Option<usize>,
    next_ord: usize,
}

impl SegmentTermEnum {
    /// Enumeration positioned before the first term.
    pub fn new(core: Arc<SegmentCore>) -> Self {
        SegmentTermEnum {
            core,
            current: None,
            next_ord: 0,
        }
    }

    /// Enumeration positioned on the first term `>= term`.
    pub fn starting_at(core: Arc<SegmentCore>, term: &Term) -> Self {
        let ord = core.data().seek_ceil(term);
        let len = core.data().terms.len();
        let current = (ord < len).then_some(ord);
        SegmentTermEnum {
            core,
            current,
            next_ord: (ord + 1).min(len),
        }
    }
}

impl TermEnum for SegmentTermEnum {
    fn next(&mut self) -> Result<bool> {
        let len = self.core.data().terms.len();
        if self.next_ord < len {
            self.current = Some(self.next_ord);
            self.next_ord += 1;
            Ok(true)
        } else {
            self.current = None;
            self.next_ord = len;
            Ok(false)
        }
    }

    fn term(&self) -> Option<&Term> {
        self.current.map(|ord| &self.core.data().terms[ord].term)
    }

    fn doc_freq(&self) -> u32 {
        self.current
            .map_or(0, |ord| self.core.data().terms[ord].doc_freq)
    }

    fn term_state(&self) -> Option<TermState> {
        self.current.map(|ord| TermState {
            segment: self.core.id(),
            ord,
        })
    }

    fn close(&mut self) {
        self.current = None;
        self.next_ord = self.core.data().terms.len();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Documents and positions of one term in one segment.
///
/// Deleted documents are skipped using the deletions the segment had when
/// the iterator was created. Positions are decoded lazily: documents passed
/// over without reading their positions are skipped in the prox stream on
/// the next `next_position`.
#[derive(Debug)]
pub struct SegmentPostings {
    core: Arc<SegmentCore>,
    deleted: Option<Arc<BitVec>>,
    entry: Option<usize>,
    doc_freq: u32,
    count: u32,
    freq_pos: usize,
    doc: DocId,
    freq: u32,
    prox_pos: usize,
    positions_left: u32,
    unread_positions: u32,
    position: u32,
    payload: Option<(usize, usize)>,
    payload_available: bool,
}

impl SegmentPostings {
    /// Create an unpositioned iterator.
    pub fn new(core: Arc<SegmentCore>, deleted: Option<Arc<BitVec>>) -> Self {
        SegmentPostings {
            core,
            deleted,
            entry: None,
            doc_freq: 0,
            count: 0,
            freq_pos: 0,
            doc: 0,
            freq: 0,
            prox_pos: 0,
            positions_left: 0,
            unread_positions: 0,
            position: 0,
            payload: None,
            payload_available: false,
        }
    }

    fn reset_to(&mut self, entry: Option<usize>) {
        self.entry = entry;
        self.doc_freq = entry.map_or(0, |e| self.core.data().terms[e].doc_freq);
        self.count = 0;
        self.freq_pos = 0;
        self.doc = 0;
        self.freq = 0;
        self.prox_pos = 0;
        self.positions_left = 0;
        self.unread_positions = 0;
        self.position = 0;
        self.payload = None;
        self.payload_available = false;
    }

    fn is_deleted(&self, doc: DocId) -> bool {
        self.deleted
            .as_ref()
            .is_some_and(|bits| bits.get(doc as usize).unwrap_or(false))
    }

    fn read_entry(&mut self, entry: usize) -> Result<()> {
        let bytes = &self.core.data().terms[entry].freq;
        let mut cursor = ByteCursor::new(bytes, self.freq_pos);
        let delta = cursor.read_vint()?;
        let freq = cursor.read_vint()?;
        self.freq_pos = cursor.position();

        self.doc += u64::from(delta);
        self.freq = freq;
        self.count += 1;
        self.unread_positions += self.positions_left;
        self.positions_left = freq;
        self.position = 0;
        self.payload = None;
        self.payload_available = false;
        Ok(())
    }
}

impl TermDocs for SegmentPostings {
    fn seek(&mut self, term: &Term) -> Result<()> {
        let entry = self.core.data().find(term).ok();
        self.reset_to(entry);
        Ok(())
    }

    fn seek_state(&mut self, term: &Term, state: Option<&TermState>) -> Result<()> {
        if let Some(state) = state
            && state.segment == self.core.id()
            && self
                .core
                .data()
                .terms
                .get(state.ord)
                .is_some_and(|e| e.term == *term)
        {
            self.reset_to(Some(state.ord));
            return Ok(());
        }
        self.seek(term)
    }

    fn seek_enum(&mut self, terms: &dyn TermEnum) -> Result<()> {
        match terms.term() {
            Some(term) => self.seek_state(term, terms.term_state().as_ref()),
            None => {
                self.reset_to(None);
                Ok(())
            }
        }
    }

    fn doc(&self) -> DocId {
        self.doc
    }

    fn freq(&self) -> u32 {
        self.freq
    }

    fn next(&mut self) -> Result<bool> {
        let Some(entry) = self.entry else {
            return Ok(false);
        };
        while self.count < self.doc_freq {
            self.read_entry(entry)?;
            if !self.is_deleted(self.doc) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn read(&mut self, docs: &mut [DocId], freqs: &mut [u32]) -> Result<usize> {
        let len = docs.len().min(freqs.len());
        let mut i = 0;
        while i < len && self.next()? {
            docs[i] = self.doc;
            freqs[i] = self.freq;
            i += 1;
        }
        Ok(i)
    }

    fn skip_to(&mut self, target: DocId) -> Result<bool> {
        loop {
            if !self.next()? {
                return Ok(false);
            }
            if self.doc >= target {
                return Ok(true);
            }
        }
    }

    fn close(&mut self) {
        self.reset_to(None);
    }
}

impl TermPositions for SegmentPostings {
    fn next_position(&mut self) -> Result<u32> {
        let entry = self
            .entry
            .ok_or_else(|| BraidError::invalid_argument("postings are not positioned"))?;
        if self.positions_left == 0 {
            return Err(BraidError::invalid_argument(format!(
                "no more positions in doc {}",
                self.doc
            )));
        }

        let prox = &self.core.data().terms[entry].prox;
        let mut cursor = ByteCursor::new(prox, self.prox_pos);
        while self.unread_positions > 0 {
            let code = cursor.read_vint()?;
            if code & 1 != 0 {
                let len = cursor.read_vint()? as usize;
                cursor.skip(len)?;
            }
            self.unread_positions -= 1;
        }

        let code = cursor.read_vint()?;
        self.position += code >> 1;
        if code & 1 != 0 {
            let len = cursor.read_vint()? as usize;
            self.payload = Some((cursor.position(), len));
            self.payload_available = true;
            cursor.skip(len)?;
        } else {
            self.payload = None;
            self.payload_available = false;
        }
        self.prox_pos = cursor.position();
        self.positions_left -= 1;
        Ok(self.position)
    }

    fn payload_length(&self) -> usize {
        self.payload.map_or(0, |(_, len)| len)
    }

    fn payload(&mut self) -> Result<&[u8]> {
        let entry = self
            .entry
            .ok_or_else(|| BraidError::invalid_argument("postings are not positioned"))?;
        match self.payload {
            Some((start, len)) if self.payload_available => {
                self.payload_available = false;
                Ok(&self.core.data().terms[entry].prox[start..start + len])
            }
            _ => Err(BraidError::invalid_argument(
                "no payload available at this position",
            )),
        }
    }

    fn is_payload_available(&self) -> bool {
        self.payload_available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::document::Token;
    use crate::index::segment_writer::SegmentWriter;

    fn core(docs: Vec<Document>) -> Arc<SegmentCore> {
        let mut writer = SegmentWriter::new(&PoolConfig::default()).unwrap();
        for doc in docs {
            writer.add_document(doc).unwrap();
        }
        SegmentCore::from_data("_0", writer.flush().unwrap()).unwrap()
    }

    fn text(body: &str) -> Document {
        Document::builder().add_text("body", body).build()
    }

    #[test]
    fn test_term_enum_starting_at() {
        let core = core(vec![text("apple cherry"), text("banana")]);

        let mut terms = SegmentTermEnum::starting_at(Arc::clone(&core), &Term::new("body", "b"));
        assert_eq!(terms.term().unwrap().text(), "banana");
        assert!(terms.next().unwrap());
        assert_eq!(terms.term().unwrap().text(), "cherry");
        assert!(!terms.next().unwrap());
        assert!(terms.term().is_none());

        let past_end = SegmentTermEnum::starting_at(core, &Term::new("body", "zebra"));
        assert!(past_end.term().is_none());
    }

    #[test]
    fn test_postings_skip_deleted_docs() {
        let core = core(vec![text("x"), text("x"), text("y"), text("x")]);
        let mut deleted = BitVec::from_elem(4, false);
        deleted.set(1, true);

        let mut docs = SegmentPostings::new(core, Some(Arc::new(deleted)));
        docs.seek(&Term::new("body", "x")).unwrap();
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 0);
        assert!(docs.next().unwrap());
        assert_eq!(docs.doc(), 3);
        assert!(!docs.next().unwrap());

        docs.seek(&Term::new("body", "x")).unwrap();
        assert!(docs.skip_to(2).unwrap());
        assert_eq!(docs.doc(), 3);

        docs.seek(&Term::new("body", "missing")).unwrap();
        assert!(!docs.next().unwrap());
    }

    #[test]
    fn test_positions_skip_unread_documents() {
        let core = core(vec![
            text("a b a a"),
            text("b"),
            Document::builder()
                .add_tokens(
                    "body",
                    vec![
                        Token::new("a").with_payload(vec![1, 2, 3]),
                        Token::new("a").with_position_increment(4),
                    ],
                )
                .build(),
        ]);

        let mut positions = SegmentPostings::new(core, None);
        positions.seek(&Term::new("body", "a")).unwrap();
        assert!(positions.next().unwrap());
        assert_eq!(positions.freq(), 3);
        assert_eq!(positions.next_position().unwrap(), 0);

        // The remaining positions of doc 0 are never read.
        assert!(positions.next().unwrap());
        assert_eq!(positions.doc(), 2);
        assert_eq!(positions.next_position().unwrap(), 0);
        assert!(positions.is_payload_available());
        assert_eq!(positions.payload_length(), 3);
        assert_eq!(positions.payload().unwrap(), &[1, 2, 3]);
        assert!(positions.payload().is_err());

        assert_eq!(positions.next_position().unwrap(), 4);
        assert!(!positions.is_payload_available());
        assert!(positions.next_position().is_err());
    }

    #[test]
    fn test_seek_state_from_enum() {
        let core = core(vec![text("p q"), text("q")]);
        let mut terms = SegmentTermEnum::new(Arc::clone(&core));
        assert!(terms.next().unwrap());
        assert!(terms.next().unwrap());
        assert_eq!(terms.term().unwrap().text(), "q");

        let mut docs = SegmentPostings::new(core, None);
        docs.seek_enum(&terms).unwrap();
        let mut ids = vec![0; 4];
        let mut freqs = vec![0; 4];
        assert_eq!(docs.read(&mut ids, &mut freqs).unwrap(), 2);
        assert_eq!(&ids[..2], &[0, 1]);
        assert_eq!(docs.read(&mut ids, &mut freqs).unwrap(), 0);
    }
}
