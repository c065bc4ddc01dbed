//! Writing and reading byte streams threaded through slab-pool slices.

use std::io::Read;

use crate::error::{BraidError, Result};
use crate::pool::byte_pool::{ByteBlockPool, FIRST_LEVEL_SIZE, LEVEL_SIZE, NEXT_LEVEL};

/// Appends bytes to a slice chain.
///
/// The writer only holds the global address of its next byte, so many
/// writers can share one pool and be kept in an int pool between writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSliceWriter {
    upto: usize,
}

impl ByteSliceWriter {
    /// Start a new stream in a fresh first-level slice.
    pub fn start(pool: &mut ByteBlockPool) -> Result<Self> {
        let upto = pool.new_slice(FIRST_LEVEL_SIZE)?;
        Ok(ByteSliceWriter { upto })
    }

    /// Resume a stream whose next byte goes to `address`.
    pub fn at(address: usize) -> Self {
        ByteSliceWriter { upto: address }
    }

    /// Global address of the next byte to be written.
    pub fn address(&self) -> usize {
        self.upto
    }

    /// Append one byte, forwarding to a new slice when the current one is full.
    pub fn write_byte(&mut self, pool: &mut ByteBlockPool, byte: u8) -> Result<()> {
        if pool.byte_at(self.upto) != 0 {
            self.upto = pool.alloc_slice(self.upto)?;
        }
        pool.set_byte(self.upto, byte);
        self.upto += 1;
        Ok(())
    }

    /// Append a run of bytes.
    pub fn write_bytes(&mut self, pool: &mut ByteBlockPool, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            self.write_byte(pool, byte)?;
        }
        Ok(())
    }

    /// Append a variable-length u32.
    pub fn write_vint(&mut self, pool: &mut ByteBlockPool, mut value: u32) -> Result<()> {
        while value >= 0x80 {
            self.write_byte(pool, (value as u8 & 0x7F) | 0x80)?;
            value >>= 7;
        }
        self.write_byte(pool, value as u8)
    }
}

/// Reads a slice chain back from its start address up to its end address.
#[derive(Debug)]
pub struct ByteSliceReader<'a> {
    pool: &'a ByteBlockPool,
    block: &'a [u8],
    level: usize,
    /// Global address of `block[0]`.
    buffer_offset: usize,
    upto: usize,
    /// End of readable data in `block`; a forwarding address starts here
    /// unless this is the last slice.
    limit: usize,
    end: usize,
}

impl<'a> ByteSliceReader<'a> {
    /// Read the stream that starts at `start` and whose writer stopped at `end`.
    pub fn new(pool: &'a ByteBlockPool, start: usize, end: usize) -> Result<Self> {
        if end < start {
            return Err(BraidError::invalid_argument(format!(
                "slice chain end {end} precedes start {start}"
            )));
        }
        let (block, buffer_offset) = Self::locate(pool, start)?;
        let upto = start - buffer_offset;
        let limit = if start + FIRST_LEVEL_SIZE >= end {
            end - buffer_offset
        } else {
            upto + FIRST_LEVEL_SIZE - 4
        };

        Ok(ByteSliceReader {
            pool,
            block,
            level: 0,
            buffer_offset,
            upto,
            limit,
            end,
        })
    }

    /// Whether every byte has been read.
    pub fn eof(&self) -> bool {
        self.buffer_offset + self.upto == self.end
    }

    /// Read one byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        if self.eof() {
            return Err(BraidError::corrupt("read past the end of a slice chain"));
        }
        if self.upto == self.limit {
            self.next_slice()?;
        }
        let byte = self.block[self.upto];
        self.upto += 1;
        Ok(byte)
    }

    /// Read a variable-length u32.
    pub fn read_vint(&mut self) -> Result<u32> {
        let mut result = 0u32;
        let mut shift = 0;
        loop {
            let byte = self.read_byte()?;
            if shift >= 32 {
                return Err(BraidError::corrupt("VarInt overflow"));
            }
            result |= ((byte & 0x7F) as u32) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// Copy the rest of the chain into `out`, one slice run at a time.
    pub fn write_to(&mut self, out: &mut Vec<u8>) -> Result<()> {
        while !self.eof() {
            if self.upto == self.limit {
                self.next_slice()?;
            }
            let run = self.limit.min(self.end - self.buffer_offset);
            out.extend_from_slice(&self.block[self.upto..run]);
            self.upto = run;
        }
        Ok(())
    }

    fn next_slice(&mut self) -> Result<()> {
        let pointer = self
            .block
            .get(self.limit..self.limit + 4)
            .ok_or_else(|| BraidError::corrupt("forwarding address out of block bounds"))?;
        let next = u32::from_be_bytes([pointer[0], pointer[1], pointer[2], pointer[3]]) as usize;

        self.level = NEXT_LEVEL[self.level];
        let size = LEVEL_SIZE[self.level];

        let (block, buffer_offset) = Self::locate(self.pool, next)?;
        self.block = block;
        self.buffer_offset = buffer_offset;
        self.upto = next - buffer_offset;
        self.limit = if next + size >= self.end {
            self.end - buffer_offset
        } else {
            self.upto + size - 4
        };
        if self.limit > self.block.len() {
            return Err(BraidError::corrupt("slice chain runs past its block"));
        }
        Ok(())
    }

    fn locate(pool: &'a ByteBlockPool, address: usize) -> Result<(&'a [u8], usize)> {
        let index = address / pool.block_size();
        let block = pool
            .block(index)
            .ok_or_else(|| BraidError::corrupt(format!("no block for address {address}")))?;
        Ok((block, index * pool.block_size()))
    }
}

impl Read for ByteSliceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut read = 0;
        while read < buf.len() && !self.eof() {
            buf[read] = self.read_byte().map_err(std::io::Error::other)?;
            read += 1;
        }
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::pool::allocator::RecyclingBlockAllocator;

    fn pool(block_size: usize) -> ByteBlockPool {
        ByteBlockPool::new(Arc::new(RecyclingBlockAllocator::<u8>::new(block_size, 8))).unwrap()
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 1).collect()
    }

    #[test]
    fn test_one_forward_per_level_transition() {
        let mut pool = pool(32768);
        let mut writer = ByteSliceWriter::start(&mut pool).unwrap();
        let start = writer.address();

        writer.write_bytes(&mut pool, &data(100)).unwrap();

        // levels 0..=5 hold 1 + 10 + 16 + 26 + 36 forwarded bytes and 11 in the last slice
        let allocated: usize = LEVEL_SIZE[..6].iter().sum();
        assert_eq!(pool.position(), allocated);

        let mut out = Vec::new();
        ByteSliceReader::new(&pool, start, writer.address())
            .unwrap()
            .write_to(&mut out)
            .unwrap();
        assert_eq!(out, data(100));
    }

    #[test]
    fn test_short_stream_stays_in_first_slice() {
        let mut pool = pool(256);
        let mut writer = ByteSliceWriter::start(&mut pool).unwrap();
        writer.write_bytes(&mut pool, &[9, 8, 7, 6]).unwrap();
        assert_eq!(pool.position(), FIRST_LEVEL_SIZE);

        let mut reader = ByteSliceReader::new(&pool, 0, writer.address()).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, vec![9, 8, 7, 6]);
        assert!(reader.read_byte().is_err());
    }

    #[test]
    fn test_interleaved_streams_across_blocks() {
        let mut pool = pool(256);
        let mut writers: Vec<ByteSliceWriter> = (0..4)
            .map(|_| ByteSliceWriter::start(&mut pool).unwrap())
            .collect();
        let starts: Vec<usize> = writers.iter().map(|w| w.address()).collect();

        for round in 0..300u32 {
            for (i, writer) in writers.iter_mut().enumerate() {
                writer.write_vint(&mut pool, round * 7 + i as u32).unwrap();
            }
        }
        assert!(pool.num_blocks() > 1);

        for (i, writer) in writers.iter().enumerate() {
            let mut reader = ByteSliceReader::new(&pool, starts[i], writer.address()).unwrap();
            for round in 0..300u32 {
                assert_eq!(reader.read_vint().unwrap(), round * 7 + i as u32);
            }
            assert!(reader.eof());
        }
    }

    #[test]
    fn test_resume_writer_from_address() {
        let mut pool = pool(256);
        let mut writer = ByteSliceWriter::start(&mut pool).unwrap();
        let start = writer.address();
        writer.write_bytes(&mut pool, &data(30)).unwrap();

        let mut resumed = ByteSliceWriter::at(writer.address());
        resumed.write_bytes(&mut pool, &data(30)).unwrap();

        let mut out = Vec::new();
        ByteSliceReader::new(&pool, start, resumed.address())
            .unwrap()
            .write_to(&mut out)
            .unwrap();
        let mut expected = data(30);
        expected.extend(data(30));
        assert_eq!(out, expected);
    }
}
