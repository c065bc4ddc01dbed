//! Variable-length integer encoding for postings streams.
//!
//! Seven payload bits per byte, low-order group first, high bit set on every
//! byte except the last. The same encoding is written into slab-pool slices
//! at index time and decoded by the per-segment postings iterators.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{BraidError, Result};

/// Append a variable-length encoded u32 to a byte vector.
pub fn push_u32(out: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Encode a u32 value using variable-length encoding.
pub fn encode_u32(value: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(5);
    push_u32(&mut bytes, value);
    bytes
}

/// Decode a u32 value from the front of `bytes`, returning it with the
/// number of bytes consumed.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize)> {
    let mut result = 0u32;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 32 {
            return Err(BraidError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(BraidError::corrupt("Incomplete VarInt"))
}

/// Write a variable-length encoded u32 to a writer.
pub fn write_u32<W: Write>(writer: &mut W, value: u32) -> Result<usize> {
    let bytes = encode_u32(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u32 from a reader.
pub fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    let mut result = 0u32;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 32 {
            return Err(BraidError::corrupt("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// A forward-only cursor over an encoded byte stream.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Create a cursor positioned at `pos`.
    pub fn new(bytes: &'a [u8], pos: usize) -> Self {
        ByteCursor { bytes, pos }
    }

    /// Current position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Whether the cursor reached the end of the stream.
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Read one variable-length u32.
    pub fn read_vint(&mut self) -> Result<u32> {
        let rest = self
            .bytes
            .get(self.pos..)
            .ok_or_else(|| BraidError::corrupt("read past end of postings stream"))?;
        let (value, len) = decode_u32(rest)?;
        self.pos += len;
        Ok(value)
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| BraidError::corrupt("read past end of postings stream"))?;
        self.pos = end;
        Ok(slice)
    }

    /// Skip `len` raw bytes.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encode_decode_u32() {
        let test_values = [0, 1, 127, 128, 255, 256, 16383, 16384, u32::MAX];

        for &value in &test_values {
            let encoded = encode_u32(value);
            let (decoded, bytes_read) = decode_u32(&encoded).unwrap();

            assert_eq!(value, decoded);
            assert_eq!(encoded.len(), bytes_read);
        }
    }

    #[test]
    fn test_write_read_u32() {
        let mut buffer = Vec::new();
        let value = 12345u32;

        let bytes_written = write_u32(&mut buffer, value).unwrap();
        assert_eq!(bytes_written, buffer.len());

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_u32(&mut cursor).unwrap(), value);
    }

    #[test]
    fn test_encoding_efficiency() {
        assert_eq!(encode_u32(0).len(), 1);
        assert_eq!(encode_u32(127).len(), 1);
        assert_eq!(encode_u32(128).len(), 2);
        assert_eq!(encode_u32(16384).len(), 3);
        assert_eq!(encode_u32(u32::MAX).len(), 5);
    }

    #[test]
    fn test_incomplete_varint() {
        assert!(decode_u32(&[0x80]).is_err());
        assert!(decode_u32(&[0xFF; 6]).is_err());
    }

    #[test]
    fn test_byte_cursor() {
        let mut bytes = Vec::new();
        push_u32(&mut bytes, 300);
        push_u32(&mut bytes, 2);
        bytes.extend_from_slice(b"ab");

        let mut cursor = ByteCursor::new(&bytes, 0);
        assert_eq!(cursor.read_vint().unwrap(), 300);
        assert_eq!(cursor.read_vint().unwrap(), 2);
        assert_eq!(cursor.read_bytes(2).unwrap(), b"ab");
        assert!(cursor.is_at_end());
        assert!(cursor.read_vint().is_err());
    }
}
