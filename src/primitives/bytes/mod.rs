#![forbid(unsafe_code)]
//! Varint and key-prefix utilities shared by the cell codec and the insert index.

pub mod var {
    //! Unsigned varints and ZigZag signed integers.

    use crate::types::{Result, SombraError};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes `encode_u64` produces for `v`.
    pub fn encoded_len(v: u64) -> usize {
        let bits = 64 - (v | 1).leading_zeros() as usize;
        (bits + 6) / 7
    }

    /// Decodes a u64 varint from a slice, updating the offset.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(SombraError::Corruption("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(SombraError::Corruption("varint overflow"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(SombraError::Corruption("varint too long"))
    }

    /// Encodes an i64 as a ZigZag-encoded varint.
    pub fn encode_i64(v: i64, out: &mut Vec<u8>) {
        let zigzag = ((v << 1) ^ (v >> 63)) as u64;
        encode_u64(zigzag, out);
    }

    /// Decodes a ZigZag-encoded i64 varint from a slice, updating the offset.
    pub fn decode_i64(src: &[u8], off: &mut usize) -> Result<i64> {
        let zigzag = decode_u64(src, off)?;
        Ok(((zigzag >> 1) as i64) ^ (-((zigzag & 1) as i64)))
    }
}

pub mod prefix {
    //! Byte-key prefix helpers used for key compression and separators.

    use core::cmp::Ordering;

    /// Length of the common prefix of `a` and `b`.
    pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
        a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
    }

    /// Compares `a` and `b` assuming their first `*skip` bytes are equal.
    ///
    /// On return `*skip` holds the length of the common prefix, which lets a
    /// caller descending an ordered structure avoid re-comparing bytes it has
    /// already matched against both neighbours.
    pub fn compare_skip(a: &[u8], b: &[u8], skip: &mut usize) -> Ordering {
        let start = (*skip).min(a.len()).min(b.len());
        let matched = start + common_prefix_len(&a[start..], &b[start..]);
        *skip = matched;
        match (a.get(matched), b.get(matched)) {
            (Some(x), Some(y)) => x.cmp(y),
            _ => a.len().cmp(&b.len()),
        }
    }

    /// Shortest key `s` with `left < s <= right`.
    ///
    /// Used as the separator between two split chunks: every key of the left
    /// chunk sorts before it and the first key of the right chunk does not.
    pub fn shortest_separator(left: &[u8], right: &[u8]) -> Vec<u8> {
        debug_assert!(left < right);
        let common = common_prefix_len(left, right);
        right[..(common + 1).min(right.len())].to_vec()
    }
}
