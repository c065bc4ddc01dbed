//! # Braid
//!
//! Composite readers over a segmented inverted index.
//!
//! ## Features
//!
//! - Slab pools that buffer postings in chained byte slices
//! - Merged term and postings enumeration across segments
//! - Reference-counted segment readers shared between reopened readers
//! - Copy-on-write deletions and norms with transactional commit
//! - Stale-reader detection against newer commits
//! - Pluggable storage backends

pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod pool;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::config::{PoolConfig, ReaderConfig, WriterConfig};
    pub use crate::document::{Document, FieldValue, Token};
    pub use crate::error::{BraidError, Result};
    pub use crate::index::{
        DirectoryReader, IndexReader, IndexWriter, MultiReader, SegmentReader, Term, TermDocs,
        TermEnum, TermPositions,
    };
    pub use crate::storage::{FileStorage, MemoryStorage, Storage, StorageConfig};
}

/// Global document number inside a reader.
pub type DocId = u64;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
