//! Segmented inverted index: segment readers and writers, and the composite
//! readers that present many segments as one index.
//!
//! A composite reader keeps an ordered list of sub-readers and the global
//! document id each one starts at. Per-document calls are routed to the
//! owning sub-reader by binary search over those starts; term enumeration
//! and postings merge the sub-readers' sorted streams through a priority
//! queue.

pub mod boundary;
pub mod deletion_policy;
pub mod directory_reader;
pub mod file_deleter;
pub mod merge_queue;
pub mod multi_reader;
pub mod multi_terms;
pub mod norms;
pub mod postings;
pub mod reader;
pub mod segment_info;
pub mod segment_reader;
pub mod segment_writer;
pub mod term;
pub mod writer;

// Re-export commonly used types
pub use boundary::{DocStarts, reader_index};
pub use deletion_policy::{
    IndexCommit, IndexDeletionPolicy, KeepAllCommitsDeletionPolicy,
    KeepOnlyLastCommitDeletionPolicy,
};
pub use directory_reader::DirectoryReader;
pub use file_deleter::IndexFileDeleter;
pub use merge_queue::{SegmentMergeInfo, SegmentMergeQueue};
pub use multi_reader::MultiReader;
pub use multi_terms::{MultiTermDocs, MultiTermEnum, MultiTermPositions};
pub use postings::{TermDocs, TermEnum, TermFreqVector, TermPositions, TermState};
pub use reader::IndexReader;
pub use segment_info::{SegmentInfo, SegmentInfos};
pub use segment_reader::SegmentReader;
pub use segment_writer::SegmentWriter;
pub use term::Term;
pub use writer::IndexWriter;
