//! Global document id boundaries of a composite reader.

use std::sync::Arc;

use crate::DocId;
use crate::error::{BraidError, Result};

/// Prefix sums of sub-reader sizes.
///
/// For `n` sub-readers there are `n + 1` entries: entry `i` is the first
/// global doc id of sub-reader `i` and the last entry is the total `max_doc`.
/// The table never changes once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocStarts {
    starts: Arc<[DocId]>,
}

impl DocStarts {
    /// Build the table from each sub-reader's `max_doc`, in order.
    pub fn from_max_docs<I: IntoIterator<Item = u64>>(max_docs: I) -> Self {
        let mut starts = vec![0];
        let mut total = 0;
        for max_doc in max_docs {
            total += max_doc;
            starts.push(total);
        }
        DocStarts {
            starts: Arc::from(starts),
        }
    }

    /// Number of sub-readers.
    pub fn num_readers(&self) -> usize {
        self.starts.len() - 1
    }

    /// Total number of documents.
    pub fn max_doc(&self) -> u64 {
        self.starts[self.starts.len() - 1]
    }

    /// First global doc id of sub-reader `i`. `start(num_readers())` is `max_doc`.
    pub fn start(&self, i: usize) -> DocId {
        self.starts[i]
    }

    /// Number of documents in sub-reader `i`.
    pub fn len_of(&self, i: usize) -> u64 {
        self.starts[i + 1] - self.starts[i]
    }

    /// The whole table.
    pub fn as_slice(&self) -> &[DocId] {
        &self.starts
    }

    /// Index of the sub-reader owning `doc`. See [`reader_index`].
    pub fn reader_index(&self, doc: DocId) -> usize {
        reader_index(doc, &self.starts, self.num_readers())
    }

    /// Resolve a global doc id to `(sub-reader index, local doc id)`.
    pub fn locate(&self, doc: DocId) -> Result<(usize, DocId)> {
        if doc >= self.max_doc() {
            return Err(BraidError::invalid_argument(format!(
                "doc {doc} out of range, max_doc is {}",
                self.max_doc()
            )));
        }
        let i = self.reader_index(doc);
        Ok((i, doc - self.starts[i]))
    }
}

/// Find the sub-reader owning global doc id `doc`.
///
/// Returns the greatest `i < num_readers` with `starts[i] <= doc`. Empty
/// sub-readers share their start with the next one, so on an exact hit the
/// search moves forward to the last index with that start: that is the only
/// candidate that can hold documents.
pub fn reader_index(doc: DocId, starts: &[DocId], num_readers: usize) -> usize {
    let mut lo = 0;
    let mut hi = num_readers;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let mid_value = starts[mid];
        if doc < mid_value {
            hi = mid;
        } else if doc > mid_value {
            lo = mid + 1;
        } else {
            let mut last = mid;
            while last + 1 < num_readers && starts[last + 1] == mid_value {
                last += 1;
            }
            return last;
        }
    }
    lo.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sums() {
        let starts = DocStarts::from_max_docs([3, 0, 5]);
        assert_eq!(starts.as_slice(), &[0, 3, 3, 8]);
        assert_eq!(starts.num_readers(), 3);
        assert_eq!(starts.max_doc(), 8);
        assert_eq!(starts.len_of(1), 0);
    }

    #[test]
    fn test_reader_index_skips_empty_readers() {
        let starts = DocStarts::from_max_docs([3, 0, 0, 5, 0]);
        assert_eq!(starts.reader_index(0), 0);
        assert_eq!(starts.reader_index(2), 0);
        assert_eq!(starts.reader_index(3), 3);
        assert_eq!(starts.reader_index(7), 3);
    }

    #[test]
    fn test_leading_empty_reader() {
        let starts = DocStarts::from_max_docs([0, 2]);
        assert_eq!(starts.reader_index(0), 1);
        assert_eq!(starts.locate(1).unwrap(), (1, 1));
    }

    #[test]
    fn test_locate() {
        let starts = DocStarts::from_max_docs([100, 10]);
        assert_eq!(starts.locate(104).unwrap(), (1, 4));
        assert_eq!(starts.locate(99).unwrap(), (0, 99));
        assert!(starts.locate(110).is_err());
    }

    #[test]
    fn test_every_doc_round_trips() {
        let sizes = [4u64, 0, 1, 0, 0, 7, 2, 0];
        let starts = DocStarts::from_max_docs(sizes);
        for doc in 0..starts.max_doc() {
            let i = starts.reader_index(doc);
            assert!(starts.start(i) <= doc && doc < starts.start(i + 1));
        }
    }

    #[test]
    fn test_no_readers() {
        let starts = DocStarts::from_max_docs([]);
        assert_eq!(starts.max_doc(), 0);
        assert_eq!(starts.reader_index(0), 0);
        assert!(starts.locate(0).is_err());
    }
}
