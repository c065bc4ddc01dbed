//! Byte slab pool with forwarding-address slice chains.
//!
//! # Layout
//!
//! The pool is an ordered list of blocks of `block_size` bytes. Every byte
//! has a global address `block_index * block_size + offset`. A *slice* is a
//! run of bytes inside one block; its last byte is a tag `16 | level` and
//! every other byte starts out zero.
//!
//! A writer appends bytes until the next position holds a non-zero byte,
//! which can only be the tag. [`ByteBlockPool::alloc_slice`] then allocates
//! the next slice (size from [`LEVEL_SIZE`] at `NEXT_LEVEL[level]`), copies
//! the three bytes before the tag into the start of the new slice and
//! overwrites those three bytes plus the tag with the big-endian `u32`
//! global address of the new slice:
//!
//! ```text
//! old slice: [ d0 d1 .. dk | a3 a2 a1 a0 ]   a = address of new slice
//! new slice: [ copied 3 bytes | free ... | 16|level' ]
//! ```
//!
//! So a slice of size `s` that has been forwarded holds `s - 4` data bytes.
//! Addresses are stored in four bytes, so the pool spans at most 4GB.

use std::sync::Arc;

use log::trace;

use crate::error::{BraidError, Result};
use crate::pool::allocator::BlockAllocator;

/// Level of the slice following a slice of level `i`.
pub const NEXT_LEVEL: [usize; 10] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 9];

/// Size in bytes of a slice of level `i`.
pub const LEVEL_SIZE: [usize; 10] = [5, 14, 20, 30, 40, 40, 80, 80, 120, 200];

/// Size of the first slice of every stream.
pub const FIRST_LEVEL_SIZE: usize = LEVEL_SIZE[0];

/// Size of the largest slice.
pub const MAX_SLICE_SIZE: usize = LEVEL_SIZE[LEVEL_SIZE.len() - 1];

const TAG: u8 = 16;
const INITIAL_TABLE_SIZE: usize = 10;

/// Pool of byte blocks carved into chained slices.
#[derive(Debug)]
pub struct ByteBlockPool {
    buffers: Vec<Box<[u8]>>,
    /// Write position inside the head block.
    byte_upto: usize,
    /// Global address of the head block's first byte.
    byte_offset: usize,
    block_size: usize,
    allocator: Arc<dyn BlockAllocator<u8>>,
}

impl ByteBlockPool {
    /// Create an empty pool drawing blocks from `allocator`. Blocks must
    /// hold the largest slice.
    pub fn new(allocator: Arc<dyn BlockAllocator<u8>>) -> Result<Self> {
        let block_size = allocator.block_size();
        if block_size < MAX_SLICE_SIZE {
            return Err(BraidError::invalid_argument(format!(
                "byte block size {block_size} is smaller than the largest slice ({MAX_SLICE_SIZE})"
            )));
        }
        Ok(ByteBlockPool {
            buffers: Vec::with_capacity(INITIAL_TABLE_SIZE),
            byte_upto: block_size,
            byte_offset: 0,
            block_size,
            allocator,
        })
    }

    /// Size of every block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks currently held.
    pub fn num_blocks(&self) -> usize {
        self.buffers.len()
    }

    /// Capacity of the block table.
    pub fn table_capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Global address of the next free byte.
    pub fn position(&self) -> usize {
        self.byte_offset + self.byte_upto
    }

    /// Move to a fresh head block, growing the block table by half when full.
    pub fn next_buffer(&mut self) {
        if self.buffers.len() == self.buffers.capacity() {
            let grow = (self.buffers.capacity() / 2).max(1);
            self.buffers.reserve_exact(grow);
        }
        self.buffers.push(self.allocator.get_block());
        self.byte_offset = (self.buffers.len() - 1) * self.block_size;
        self.byte_upto = 0;
        trace!("byte pool moved to block {}", self.buffers.len() - 1);
    }

    /// Reserve a new slice of `size` bytes and return its global address.
    pub fn new_slice(&mut self, size: usize) -> Result<usize> {
        if size == 0 || size > self.block_size {
            return Err(BraidError::invalid_argument(format!(
                "slice size {size} does not fit block size {}",
                self.block_size
            )));
        }
        if self.byte_upto + size > self.block_size {
            self.next_buffer();
        }
        let upto = self.byte_upto;
        self.byte_upto += size;
        let head = self.buffers.len() - 1;
        self.buffers[head][self.byte_upto - 1] = TAG;
        let address = self.byte_offset + upto;
        Self::check_address(address)?;
        Ok(address)
    }

    /// Allocate the slice following the full slice whose tag byte is at
    /// global address `upto`, forward the old slice to it and return the
    /// address at which writing resumes.
    pub fn alloc_slice(&mut self, upto: usize) -> Result<usize> {
        if upto < 3 || upto >= self.position() {
            return Err(BraidError::invalid_argument(format!(
                "{upto} cannot be the tag of a full slice"
            )));
        }
        let tag = self.byte_at(upto);
        if tag & TAG == 0 {
            return Err(BraidError::index(format!(
                "byte at {upto} is not a slice tag"
            )));
        }
        let level = usize::from(tag & 15);
        let new_level = NEXT_LEVEL
            .get(level)
            .copied()
            .ok_or_else(|| BraidError::index(format!("invalid slice level {level}")))?;
        let new_size = LEVEL_SIZE[new_level];

        if self.byte_upto + new_size > self.block_size {
            self.next_buffer();
        }
        let new_upto = self.byte_upto;
        let address = self.byte_offset + new_upto;
        let forward = Self::check_address(address)?;
        self.byte_upto += new_size;

        let mut carried = [0u8; 3];
        for (i, byte) in carried.iter_mut().enumerate() {
            *byte = self.byte_at(upto - 3 + i);
        }

        let head = self.buffers.len() - 1;
        let block = &mut self.buffers[head];
        block[new_upto..new_upto + 3].copy_from_slice(&carried);
        block[self.byte_upto - 1] = TAG | new_level as u8;

        for (i, byte) in forward.to_be_bytes().into_iter().enumerate() {
            self.set_byte(upto - 3 + i, byte);
        }

        trace!("forwarded slice at {upto} to level {new_level} at {address}");
        Ok(address + 3)
    }

    /// Byte at a global address.
    pub fn byte_at(&self, address: usize) -> u8 {
        self.buffers[address / self.block_size][address % self.block_size]
    }

    /// Overwrite the byte at a global address.
    pub fn set_byte(&mut self, address: usize, value: u8) {
        let block_size = self.block_size;
        self.buffers[address / block_size][address % block_size] = value;
    }

    /// The block with the given index, if allocated.
    pub fn block(&self, index: usize) -> Option<&[u8]> {
        self.buffers.get(index).map(|b| &b[..])
    }

    /// Zero every used byte, recycle all blocks but the first and rewind to
    /// one empty block.
    pub fn reset(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        let head = self.buffers.len() - 1;
        for block in &mut self.buffers[..head] {
            block.fill(0);
        }
        self.buffers[head][..self.byte_upto].fill(0);

        if self.buffers.len() > 1 {
            let recycled = self.buffers.split_off(1);
            trace!("byte pool reset, recycling {} blocks", recycled.len());
            self.allocator.recycle_blocks(recycled);
        }
        self.byte_upto = 0;
        self.byte_offset = 0;
    }

    fn check_address(address: usize) -> Result<u32> {
        u32::try_from(address)
            .map_err(|_| BraidError::index("byte pool exceeded its 4GB address space"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::allocator::RecyclingBlockAllocator;

    fn pool(block_size: usize) -> (Arc<RecyclingBlockAllocator<u8>>, ByteBlockPool) {
        let allocator = Arc::new(RecyclingBlockAllocator::<u8>::new(block_size, 16));
        let pool = ByteBlockPool::new(allocator.clone()).unwrap();
        (allocator, pool)
    }

    #[test]
    fn test_new_slice_writes_tag() {
        let (_, mut pool) = pool(256);
        let start = pool.new_slice(FIRST_LEVEL_SIZE).unwrap();
        assert_eq!(start, 0);
        assert_eq!(pool.byte_at(4), 16);
        assert_eq!(pool.byte_at(0), 0);
        assert_eq!(pool.position(), 5);
    }

    #[test]
    fn test_new_slice_crosses_block() {
        let (_, mut pool) = pool(256);
        pool.new_slice(200).unwrap();
        let second = pool.new_slice(100).unwrap();
        assert_eq!(second, 256);
        assert_eq!(pool.num_blocks(), 2);
    }

    #[test]
    fn test_alloc_slice_forwards() {
        let (_, mut pool) = pool(256);
        let start = pool.new_slice(FIRST_LEVEL_SIZE).unwrap();
        for i in 0..4 {
            pool.set_byte(start + i, 10 + i as u8);
        }

        let resume = pool.alloc_slice(start + 4).unwrap();
        assert_eq!(resume, 5 + 3);

        // bytes 1..4 were carried forward, the old slice now holds the address
        assert_eq!(pool.byte_at(0), 10);
        assert_eq!(
            [pool.byte_at(1), pool.byte_at(2), pool.byte_at(3), pool.byte_at(4)],
            5u32.to_be_bytes()
        );
        assert_eq!([pool.byte_at(5), pool.byte_at(6), pool.byte_at(7)], [11, 12, 13]);
        assert_eq!(pool.byte_at(5 + LEVEL_SIZE[1] - 1), 16 | 1);
    }

    #[test]
    fn test_alloc_slice_rejects_data_byte() {
        let (_, mut pool) = pool(256);
        pool.new_slice(FIRST_LEVEL_SIZE).unwrap();
        assert!(pool.alloc_slice(0).is_err());
    }

    #[test]
    fn test_alloc_slice_rejects_address_before_first_slice() {
        let (_, mut pool) = pool(256);
        pool.new_slice(FIRST_LEVEL_SIZE).unwrap();
        pool.set_byte(2, 16);
        assert!(matches!(
            pool.alloc_slice(2),
            Err(BraidError::InvalidArgument(_))
        ));
        assert!(pool.alloc_slice(5).is_err());
    }

    #[test]
    fn test_block_smaller_than_largest_slice_is_rejected() {
        let allocator = Arc::new(RecyclingBlockAllocator::<u8>::new(MAX_SLICE_SIZE - 1, 4));
        assert!(matches!(
            ByteBlockPool::new(allocator),
            Err(BraidError::InvalidArgument(_))
        ));

        let allocator = Arc::new(RecyclingBlockAllocator::<u8>::new(MAX_SLICE_SIZE, 4));
        assert!(ByteBlockPool::new(allocator).is_ok());
    }

    #[test]
    fn test_table_grows_by_half() {
        let (_, mut pool) = pool(256);
        for _ in 0..11 {
            pool.next_buffer();
        }
        assert_eq!(pool.num_blocks(), 11);
        assert_eq!(pool.table_capacity(), 15);
    }

    #[test]
    fn test_reset_zero_fills_and_recycles() {
        let (allocator, mut pool) = pool(256);
        pool.new_slice(200).unwrap();
        pool.new_slice(200).unwrap();
        pool.set_byte(3, 7);
        assert_eq!(pool.num_blocks(), 2);

        pool.reset();
        assert_eq!(pool.num_blocks(), 1);
        assert_eq!(allocator.num_buffered(), 1);
        assert!(pool.block(0).unwrap().iter().all(|&b| b == 0));
        assert_eq!(pool.position(), 0);

        // the recycled block comes back clean
        pool.new_slice(200).unwrap();
        pool.new_slice(200).unwrap();
        assert!(pool.block(1).unwrap()[..199].iter().all(|&b| b == 0));
    }
}
