#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Alignment of every on-media region (info block, map, flog).
pub const BTT_ALIGNMENT: u64 = 4096;

/// Largest size a single arena may occupy (512 GiB).
pub const BTT_MAX_ARENA: u64 = 1 << 39;

/// Smallest usable namespace, and the threshold below which a trailing
/// remainder does not become an arena of its own (16 MiB).
pub const BTT_MIN_SIZE: u64 = 16 * (1 << 20);

/// Smallest supported external LBA size; smaller requests are rounded up.
pub const BTT_MIN_LBA: u32 = 512;

/// Internal blocks are sized in multiples of this.
pub const BTT_INTERNAL_LBA_ALIGNMENT: u32 = 256;

/// Free blocks (and therefore lanes) per arena unless configured lower.
pub const BTT_DEFAULT_NFREE: u32 = 256;

/// Each flog pair is padded out to this boundary.
pub const BTT_FLOG_PAIR_ALIGN: u64 = 64;

/// A map entry is a single little-endian u32.
pub const BTT_MAP_ENTRY_SIZE: u64 = 4;

/// Total size of an arena info block, reserved padding included.
pub const BTT_INFO_SIZE: u64 = 4096;

/// Signature at the head of every arena info block. The final two bytes
/// are NULs, making the full 16-byte field.
pub const BTTINFO_SIG: [u8; 16] = *b"BTT_ARENA_INFO\0\0";

pub const BTTINFO_UUID_LEN: usize = 16;

pub const BTTINFO_MAJOR_VERSION: u16 = 1;
pub const BTTINFO_MINOR_VERSION: u16 = 1;

/// Info-block flag: the arena took a consistency fault and is read-only.
pub const BTTINFO_FLAG_ERROR: u32 = 0x0000_0001;

/// All flag bits that disable writes to an arena.
pub const BTTINFO_FLAG_ERROR_MASK: u32 = 0x0000_0001;

/// Caller-assigned concurrency slot, `0..nlane`.
///
/// A lane identifies one concurrent thread inside the library; the free
/// pool and the read tracking table are partitioned by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lane(pub u32);

impl Lane {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte offset into the namespace (pread/pwrite semantics).
///
/// Unit-carrying wrapper so byte offsets and block numbers cannot be mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Saturating add for offsets already validated against the namespace.
    #[must_use]
    pub fn add(self, bytes: u64) -> Self {
        Self(self.0.saturating_add(bytes))
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Round `value` up to the next multiple of `align`.
#[must_use]
pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_basics() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(32, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }

    #[test]
    fn le_readers() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0x0201);
        assert_eq!(read_le_u32(&data, 0).unwrap(), 0x0403_0201);
        assert_eq!(read_le_u64(&data, 0).unwrap(), 0x0807_0605_0403_0201);
        assert!(matches!(
            read_le_u32(&data, 6),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn byte_offset_checked_math() {
        assert_eq!(ByteOffset(10).checked_add(5), Some(ByteOffset(15)));
        assert_eq!(ByteOffset(u64::MAX).checked_add(1), None);
    }
}
