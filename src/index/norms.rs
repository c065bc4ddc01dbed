//! One-byte norm encoding.
//!
//! A norm is a float squeezed into one byte: three mantissa bits and a
//! five-bit exponent, so values from about 5.8e-10 to 7.5e9 keep roughly one
//! significant decimal digit. Zero and negative values encode as 0.

use std::sync::Arc;

const MANTISSA_BITS: i32 = 3;
const ZERO_EXP: i32 = 15;
const FZERO: i32 = (63 - ZERO_EXP) << MANTISSA_BITS;

/// Encode a float as a norm byte, rounding down.
pub fn encode_norm(value: f32) -> u8 {
    let bits = value.to_bits() as i32;
    let small = bits >> (24 - MANTISSA_BITS);
    if small <= FZERO {
        if bits <= 0 { 0 } else { 1 }
    } else if small >= FZERO + 0x100 {
        0xFF
    } else {
        (small - FZERO) as u8
    }
}

/// Decode a norm byte.
pub fn decode_norm(norm: u8) -> f32 {
    if norm == 0 {
        return 0.0;
    }
    let mut bits = (norm as i32) << (24 - MANTISSA_BITS);
    bits += (63 - ZERO_EXP) << 24;
    f32::from_bits(bits as u32)
}

/// Norm of a field with `num_terms` tokens: `1 / sqrt(num_terms)`.
pub fn length_norm(num_terms: usize) -> u8 {
    if num_terms == 0 {
        return default_norm();
    }
    encode_norm(1.0 / (num_terms as f32).sqrt())
}

/// The norm used for documents and fields without one.
pub fn default_norm() -> u8 {
    encode_norm(1.0)
}

/// All-default norms for `max_doc` documents.
pub fn fake_norms(max_doc: usize) -> Arc<[u8]> {
    Arc::from(vec![default_norm(); max_doc])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_round_trips() {
        assert_eq!(encode_norm(1.0), 124);
        assert_eq!(decode_norm(124), 1.0);
        assert_eq!(default_norm(), 124);
    }

    #[test]
    fn test_edges() {
        assert_eq!(encode_norm(0.0), 0);
        assert_eq!(encode_norm(-3.0), 0);
        assert_eq!(encode_norm(1e-20), 1);
        assert_eq!(encode_norm(f32::MAX), 0xFF);
        assert_eq!(decode_norm(0), 0.0);
    }

    #[test]
    fn test_monotonic() {
        let mut last = 0.0;
        for b in 1..=255u8 {
            let v = decode_norm(b);
            assert!(v > last);
            assert_eq!(encode_norm(v), b);
            last = v;
        }
    }

    #[test]
    fn test_length_norm_shrinks() {
        assert!(decode_norm(length_norm(4)) < decode_norm(length_norm(1)));
        assert_eq!(decode_norm(length_norm(4)), 0.5);
        assert_eq!(fake_norms(3).as_ref(), &[124, 124, 124]);
    }
}
