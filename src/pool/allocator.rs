//! Block allocation and recycling shared by the slab pools.

use std::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::Mutex;

/// Hands out zero-filled fixed-size blocks and takes them back for reuse.
pub trait BlockAllocator<T>: Send + Sync + std::fmt::Debug {
    /// Size of every block, in elements.
    fn block_size(&self) -> usize;

    /// Get a zero-filled block.
    fn get_block(&self) -> Box<[T]>;

    /// Return blocks for reuse. Blocks must already be zero-filled.
    fn recycle_blocks(&self, blocks: Vec<Box<[T]>>);

    /// Bytes currently handed out and not yet recycled.
    fn bytes_used(&self) -> usize;
}

/// A [`BlockAllocator`] that keeps up to `max_buffered` recycled blocks in a
/// free list and frees the rest.
#[derive(Debug)]
pub struct RecyclingBlockAllocator<T> {
    block_size: usize,
    max_buffered: usize,
    free: Mutex<Vec<Box<[T]>>>,
    bytes_used: AtomicUsize,
}

impl<T: Copy + Default> RecyclingBlockAllocator<T> {
    /// Create an allocator for blocks of `block_size` elements.
    pub fn new(block_size: usize, max_buffered: usize) -> Self {
        RecyclingBlockAllocator {
            block_size,
            max_buffered,
            free: Mutex::new(Vec::new()),
            bytes_used: AtomicUsize::new(0),
        }
    }

    /// Number of blocks waiting in the free list.
    pub fn num_buffered(&self) -> usize {
        self.free.lock().len()
    }

    fn block_bytes(&self) -> usize {
        self.block_size * std::mem::size_of::<T>()
    }
}

impl<T> BlockAllocator<T> for RecyclingBlockAllocator<T>
where
    T: Copy + Default + Send + Sync + std::fmt::Debug,
{
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn get_block(&self) -> Box<[T]> {
        self.bytes_used
            .fetch_add(self.block_bytes(), Ordering::Relaxed);
        if let Some(block) = self.free.lock().pop() {
            return block;
        }
        trace!("allocating new block of {} elements", self.block_size);
        vec![T::default(); self.block_size].into_boxed_slice()
    }

    fn recycle_blocks(&self, blocks: Vec<Box<[T]>>) {
        let count = blocks.len();
        self.bytes_used
            .fetch_sub(count * self.block_bytes(), Ordering::Relaxed);

        let mut free = self.free.lock();
        for block in blocks {
            if free.len() >= self.max_buffered {
                break;
            }
            debug_assert_eq!(block.len(), self.block_size);
            free.push(block);
        }
        trace!("recycled {count} blocks, {} buffered", free.len());
    }

    fn bytes_used(&self) -> usize {
        self.bytes_used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_recycle() {
        let allocator = RecyclingBlockAllocator::<u8>::new(16, 1);

        let a = allocator.get_block();
        let b = allocator.get_block();
        assert_eq!(a.len(), 16);
        assert!(a.iter().all(|&x| x == 0));
        assert_eq!(allocator.bytes_used(), 32);

        allocator.recycle_blocks(vec![a, b]);
        assert_eq!(allocator.bytes_used(), 0);
        assert_eq!(allocator.num_buffered(), 1);

        let _c = allocator.get_block();
        assert_eq!(allocator.num_buffered(), 0);
    }

    #[test]
    fn test_int_blocks_track_element_size() {
        let allocator = RecyclingBlockAllocator::<u32>::new(8, 4);
        let block = allocator.get_block();
        assert_eq!(allocator.bytes_used(), 32);
        allocator.recycle_blocks(vec![block]);
        assert_eq!(allocator.bytes_used(), 0);
    }
}
