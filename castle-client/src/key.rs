//! Multi-dimensional key codec (C1, §4.1).
//!
//! On the wire a key is a contiguous blob: a 16-byte fixed header (`length` — the blob's
//! total byte count *excluding this field* — `dim_count`, and 8 reserved bytes), followed
//! by `dim_count` 8-byte per-dimension headers (`offset` into the blob, a flag byte, and 3
//! padding bytes), followed by the concatenated dimension payloads back to back with no
//! gaps. A dimension's length is never stored explicitly: it is `next_offset - offset` (or
//! `blob_len - offset` for the last dimension), which is why offsets must be monotonically
//! non-decreasing and why `EncodedKey::validate` recomputes them rather than trusting a
//! stored length.
//!
//! This module only ever borrows or copies byte slices — there is no pointer+NUL-terminator
//! fallback here the way the original C ABI needed, because a Rust `&[u8]` always carries
//! its own length.

use std::convert::TryFrom;

use thiserror::Error;

const HEADER_LEN: usize = 16;
const DIM_HEADER_LEN: usize = 8;

/// Errors raised by the key codec.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The destination buffer is smaller than the byte count that would be required.
    #[error("destination buffer too small: need {0} bytes")]
    TooSmall(usize),
    /// The encoded key would need more than `u32::MAX` bytes to represent its length.
    #[error("encoded key would exceed the maximum representable length")]
    Oversize,
    /// The byte slice handed to [`EncodedKey::from_bytes`] is not a valid encoding.
    #[error("corrupt encoded key: {0}")]
    Corrupt(&'static str),
    /// An out-of-range dimension index was requested.
    #[error("dimension index {0} out of range (dim_count = {1})")]
    IndexOutOfRange(u32, u32),
}

/// One key dimension, as supplied by the caller before encoding: a byte payload plus an
/// engine-defined flag byte (defaults to zero per §4.1's edge-case note).
#[derive(Debug, Clone, Copy)]
pub struct Dim<'a> {
    pub bytes: &'a [u8],
    pub flags: u8,
}

impl<'a> Dim<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Dim { bytes, flags: 0 }
    }

    pub fn with_flags(bytes: &'a [u8], flags: u8) -> Self {
        Dim { bytes, flags }
    }
}

/// Pure size computation: the number of bytes `encode` would need for these dimensions.
/// Zero-dimensional keys (header only) are permitted.
pub fn size_compute(dims: &[Dim]) -> usize {
    let payload: usize = dims.iter().map(|d| d.bytes.len()).sum();
    HEADER_LEN + dims.len() * DIM_HEADER_LEN + payload
}

/// Encodes `dims` into `dst`. Returns the number of bytes written on success, or
/// `Err(KeyError::TooSmall(needed))` if `dst` is not large enough — the caller can retry
/// with a buffer of at least `needed` bytes (this is the safe-Rust equivalent of the
/// C ABI's "return required byte count" size-query convention; there is no separate
/// "size query only" mode because `size_compute` above already serves that purpose without
/// needing to pass null pointers through).
pub fn encode(dst: &mut [u8], dims: &[Dim]) -> Result<usize, KeyError> {
    let needed = size_compute(dims);
    if needed > u32::MAX as usize + 4 {
        return Err(KeyError::Oversize);
    }
    if dst.len() < needed {
        return Err(KeyError::TooSmall(needed));
    }

    let dim_count = u32::try_from(dims.len()).map_err(|_| KeyError::Oversize)?;
    let length = (needed - 4) as u32;

    dst[0..4].copy_from_slice(&length.to_le_bytes());
    dst[4..8].copy_from_slice(&dim_count.to_le_bytes());
    dst[8..16].fill(0);

    let mut offset = (HEADER_LEN + dims.len() * DIM_HEADER_LEN) as u32;
    for (i, dim) in dims.iter().enumerate() {
        let hdr_off = HEADER_LEN + i * DIM_HEADER_LEN;
        dst[hdr_off..hdr_off + 4].copy_from_slice(&offset.to_le_bytes());
        dst[hdr_off + 4] = dim.flags;
        dst[hdr_off + 5..hdr_off + 8].fill(0);
        offset += dim.bytes.len() as u32;
    }

    let mut payload_off = (HEADER_LEN + dims.len() * DIM_HEADER_LEN) as usize;
    for dim in dims {
        dst[payload_off..payload_off + dim.bytes.len()].copy_from_slice(dim.bytes);
        payload_off += dim.bytes.len();
    }

    Ok(needed)
}

/// Convenience: encode into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec(dims: &[Dim]) -> Result<Vec<u8>, KeyError> {
    let mut buf = vec![0u8; size_compute(dims)];
    let n = encode(&mut buf, dims)?;
    buf.truncate(n);
    Ok(buf)
}

/// A borrowed, validated view over an encoded key (§4.1: "element accessors must work
/// without copying").
#[derive(Debug, Clone, Copy)]
pub struct EncodedKey<'a> {
    bytes: &'a [u8],
    dim_count: u32,
}

impl<'a> EncodedKey<'a> {
    /// Validates `bytes` as an encoded key: the declared length matches the slice, offsets
    /// are monotonically non-decreasing, and the first offset lands past the header.
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, KeyError> {
        if bytes.len() < HEADER_LEN {
            return Err(KeyError::Corrupt("shorter than the fixed header"));
        }
        let length = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let dim_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap());

        let declared_total = length as usize + 4;
        if declared_total != bytes.len() {
            return Err(KeyError::Corrupt("declared length does not match slice length"));
        }

        let headers_end = HEADER_LEN + dim_count as usize * DIM_HEADER_LEN;
        if headers_end > bytes.len() {
            return Err(KeyError::Corrupt("dimension header array overruns the blob"));
        }

        let mut prev_offset = headers_end as u32;
        for i in 0..dim_count {
            let off = HEADER_LEN + i as usize * DIM_HEADER_LEN;
            let offset = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap());
            if offset < prev_offset || offset as usize > bytes.len() {
                return Err(KeyError::Corrupt("dimension offsets are not monotonically ordered"));
            }
            prev_offset = offset;
        }

        Ok(EncodedKey { bytes, dim_count })
    }

    /// Number of dimensions in this key.
    pub fn dim_count(&self) -> u32 {
        self.dim_count
    }

    fn offset_of(&self, i: u32) -> u32 {
        let off = HEADER_LEN + i as usize * DIM_HEADER_LEN;
        u32::from_le_bytes(self.bytes[off..off + 4].try_into().unwrap())
    }

    /// The flag byte for dimension `i`.
    pub fn element_flags(&self, i: u32) -> Result<u8, KeyError> {
        if i >= self.dim_count {
            return Err(KeyError::IndexOutOfRange(i, self.dim_count));
        }
        let off = HEADER_LEN + i as usize * DIM_HEADER_LEN + 4;
        Ok(self.bytes[off])
    }

    /// The byte length of dimension `i`'s payload, derived from consecutive offsets.
    pub fn element_len(&self, i: u32) -> Result<u32, KeyError> {
        if i >= self.dim_count {
            return Err(KeyError::IndexOutOfRange(i, self.dim_count));
        }
        let start = self.offset_of(i);
        let end = if i + 1 < self.dim_count {
            self.offset_of(i + 1)
        } else {
            self.bytes.len() as u32
        };
        Ok(end - start)
    }

    /// A zero-copy view of dimension `i`'s payload bytes.
    pub fn element_data(&self, i: u32) -> Result<&'a [u8], KeyError> {
        let start = self.offset_of(i) as usize;
        let len = self.element_len(i)? as usize;
        Ok(&self.bytes[start..start + len])
    }

    /// The full encoded blob, for copying into another shared buffer.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Copies the encoded blob into `dst`, returning the byte count, or the required size
    /// if `dst` is too small — mirrors `encode`'s size-query convention.
    pub fn copy_into(&self, dst: &mut [u8]) -> Result<usize, KeyError> {
        if dst.len() < self.bytes.len() {
            return Err(KeyError::TooSmall(self.bytes.len()));
        }
        dst[..self.bytes.len()].copy_from_slice(self.bytes);
        Ok(self.bytes.len())
    }
}
