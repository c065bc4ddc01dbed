//! Int slab pool.

use std::sync::Arc;

use log::trace;

use crate::error::{BraidError, Result};
use crate::pool::allocator::BlockAllocator;

/// Pool of `u32` blocks. Records are reserved contiguously inside one block
/// and addressed globally like the byte pool.
#[derive(Debug)]
pub struct IntBlockPool {
    buffers: Vec<Box<[u32]>>,
    int_upto: usize,
    int_offset: usize,
    block_size: usize,
    allocator: Arc<dyn BlockAllocator<u32>>,
}

impl IntBlockPool {
    /// Create an empty pool drawing blocks from `allocator`.
    pub fn new(allocator: Arc<dyn BlockAllocator<u32>>) -> Self {
        let block_size = allocator.block_size();
        IntBlockPool {
            buffers: Vec::with_capacity(10),
            int_upto: block_size,
            int_offset: 0,
            block_size,
            allocator,
        }
    }

    /// Number of blocks currently held.
    pub fn num_blocks(&self) -> usize {
        self.buffers.len()
    }

    /// Move to a fresh head block.
    pub fn next_buffer(&mut self) {
        if self.buffers.len() == self.buffers.capacity() {
            let grow = (self.buffers.capacity() / 2).max(1);
            self.buffers.reserve_exact(grow);
        }
        self.buffers.push(self.allocator.get_block());
        self.int_offset = (self.buffers.len() - 1) * self.block_size;
        self.int_upto = 0;
    }

    /// Reserve `count` contiguous ints and return the global address of the first.
    pub fn alloc(&mut self, count: usize) -> Result<usize> {
        if count == 0 || count > self.block_size {
            return Err(BraidError::invalid_argument(format!(
                "int record of {count} does not fit block size {}",
                self.block_size
            )));
        }
        if self.int_upto + count > self.block_size {
            self.next_buffer();
        }
        let address = self.int_offset + self.int_upto;
        self.int_upto += count;
        Ok(address)
    }

    /// Int at a global address.
    pub fn get(&self, address: usize) -> u32 {
        self.buffers[address / self.block_size][address % self.block_size]
    }

    /// Overwrite the int at a global address.
    pub fn set(&mut self, address: usize, value: u32) {
        let block_size = self.block_size;
        self.buffers[address / block_size][address % block_size] = value;
    }

    /// Zero every used int, recycle all blocks but the first and rewind.
    pub fn reset(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        let head = self.buffers.len() - 1;
        for block in &mut self.buffers[..head] {
            block.fill(0);
        }
        self.buffers[head][..self.int_upto].fill(0);

        if self.buffers.len() > 1 {
            let recycled = self.buffers.split_off(1);
            trace!("int pool reset, recycling {} blocks", recycled.len());
            self.allocator.recycle_blocks(recycled);
        }
        self.int_upto = 0;
        self.int_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::allocator::RecyclingBlockAllocator;

    #[test]
    fn test_alloc_and_reset() {
        let allocator = Arc::new(RecyclingBlockAllocator::<u32>::new(8, 4));
        let mut pool = IntBlockPool::new(allocator.clone());

        let a = pool.alloc(2).unwrap();
        let b = pool.alloc(2).unwrap();
        let c = pool.alloc(6).unwrap();
        assert_eq!((a, b, c), (0, 2, 8));

        pool.set(b + 1, 42);
        pool.set(c, 7);
        assert_eq!(pool.get(b + 1), 42);
        assert_eq!(pool.num_blocks(), 2);

        pool.reset();
        assert_eq!(pool.num_blocks(), 1);
        assert_eq!(allocator.num_buffered(), 1);
        assert_eq!(pool.alloc(2).unwrap(), 0);
        assert_eq!(pool.get(1), 0);
        assert_eq!(pool.get(3), 0);
    }

    #[test]
    fn test_alloc_rejects_oversized_record() {
        let allocator = Arc::new(RecyclingBlockAllocator::<u32>::new(8, 4));
        let mut pool = IntBlockPool::new(allocator);
        assert!(pool.alloc(9).is_err());
    }
}
