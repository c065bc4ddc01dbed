//! Cursors over per-segment term enumerations and the queue merging them.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::DocId;
use crate::error::Result;
use crate::index::postings::{TermEnum, TermState};
use crate::index::reader::IndexReader;
use crate::index::term::Term;

/// One sub-reader taking part in a merge: its term enumeration, its
/// position among the participants and its first global doc id.
#[derive(Debug)]
pub struct SegmentMergeInfo {
    base: DocId,
    ord: usize,
    term_enum: Box<dyn TermEnum>,
    reader: Arc<dyn IndexReader>,
}

impl SegmentMergeInfo {
    /// Wrap `term_enum`, which enumerates the terms of `reader`.
    pub fn new(
        base: DocId,
        ord: usize,
        term_enum: Box<dyn TermEnum>,
        reader: Arc<dyn IndexReader>,
    ) -> Self {
        SegmentMergeInfo {
            base,
            ord,
            term_enum,
            reader,
        }
    }

    /// First global doc id of the sub-reader.
    pub fn base(&self) -> DocId {
        self.base
    }

    /// Position of the sub-reader among the merge participants.
    pub fn ord(&self) -> usize {
        self.ord
    }

    /// The sub-reader.
    pub fn reader(&self) -> &Arc<dyn IndexReader> {
        &self.reader
    }

    /// Current term.
    pub fn term(&self) -> Option<&Term> {
        self.term_enum.term()
    }

    /// Frequency of the current term within this sub-reader.
    pub fn doc_freq(&self) -> u32 {
        self.term_enum.doc_freq()
    }

    /// Handle to the current term for seeding postings.
    pub fn term_state(&self) -> Option<TermState> {
        self.term_enum.term_state()
    }

    /// Advance to the next term.
    pub fn next(&mut self) -> Result<bool> {
        self.term_enum.next()
    }

    /// Close the term enumeration.
    pub fn close(&mut self) {
        self.term_enum.close();
    }
}

// Reversed so the max-heap pops the smallest term, lowest base first.
impl Ord for SegmentMergeInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .term()
            .cmp(&self.term())
            .then_with(|| other.base.cmp(&self.base))
            .then_with(|| other.ord.cmp(&self.ord))
    }
}

impl PartialOrd for SegmentMergeInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SegmentMergeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SegmentMergeInfo {}

/// Priority queue of merge cursors ordered by current term, then base.
#[derive(Debug, Default)]
pub struct SegmentMergeQueue {
    heap: BinaryHeap<SegmentMergeInfo>,
}

impl SegmentMergeQueue {
    /// An empty queue sized for `capacity` cursors.
    pub fn with_capacity(capacity: usize) -> Self {
        SegmentMergeQueue {
            heap: BinaryHeap::with_capacity(capacity),
        }
    }

    /// Insert a cursor positioned on a term.
    pub fn push(&mut self, info: SegmentMergeInfo) {
        self.heap.push(info);
    }

    /// Remove the cursor with the smallest term.
    pub fn pop(&mut self) -> Option<SegmentMergeInfo> {
        self.heap.pop()
    }

    /// The cursor with the smallest term.
    pub fn top(&self) -> Option<&SegmentMergeInfo> {
        self.heap.peek()
    }

    /// Number of cursors.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Close and drop every cursor.
    pub fn close(&mut self) {
        for mut info in self.heap.drain() {
            info.close();
        }
    }
}
