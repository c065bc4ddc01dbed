//! Slab pools for buffering postings in memory.
//!
//! Postings are appended to byte streams while documents are indexed. Rather
//! than one growable buffer per term, every stream lives in a shared
//! [`ByteBlockPool`]: a sequence of fixed-size blocks carved into slices of
//! increasing size, chained together by forwarding addresses written into the
//! bytes themselves. [`IntBlockPool`] holds the per-term write addresses.

pub mod allocator;
pub mod byte_pool;
pub mod int_pool;
pub mod slice;

pub use allocator::{BlockAllocator, RecyclingBlockAllocator};
pub use byte_pool::{ByteBlockPool, FIRST_LEVEL_SIZE, LEVEL_SIZE, MAX_SLICE_SIZE, NEXT_LEVEL};
pub use int_pool::IntBlockPool;
pub use slice::{ByteSliceReader, ByteSliceWriter};
