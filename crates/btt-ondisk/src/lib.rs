#![forbid(unsafe_code)]
//! On-media structures of the BTT layout.
//!
//! Everything stored on media is little-endian; everything in memory is
//! host order. Encoding happens at the last moment before a namespace
//! write, decoding immediately after a namespace read.
//!
//! Three structures make up the format:
//!
//! - [`ArenaInfo`]: a 4096-byte info block duplicated at the start and
//!   end of every arena, validated by signature, major version, and a
//!   Fletcher64 checksum over the block with its checksum field zeroed.
//! - [`MapEntry`]: one little-endian u32 per external block; the low 30
//!   bits name the internal block, bit 30 reads as zeros, bit 31 fails
//!   reads.
//! - [`FlogEntry`]: a 16-byte free-list/log record. Entries live in
//!   pairs; a 2-bit sequence number cycling 1 -> 2 -> 3 -> 1 selects the
//!   current half, and writing it last is what makes a block remap
//!   atomic.

use btt_types::{
    read_fixed, read_le_u16, read_le_u32, read_le_u64, ByteOffset, ParseError, BTTINFO_SIG,
    BTTINFO_UUID_LEN, BTT_FLOG_PAIR_ALIGN, BTT_INFO_SIZE,
};

pub const BTT_FLOG_ENTRY_SIZE: u64 = 16;

/// Distance between consecutive flog pairs.
pub const BTT_FLOG_PAIR_STRIDE: u64 = {
    let raw = 2 * BTT_FLOG_ENTRY_SIZE;
    (raw + BTT_FLOG_PAIR_ALIGN - 1) / BTT_FLOG_PAIR_ALIGN * BTT_FLOG_PAIR_ALIGN
};

/// Map entry flag: block reads as an error.
pub const BTT_MAP_ENTRY_ERROR: u32 = 0x8000_0000;

/// Map entry flag: block reads as zeros.
pub const BTT_MAP_ENTRY_ZERO: u32 = 0x4000_0000;

/// Low 30 bits of a map entry: the post-map (internal) LBA.
pub const BTT_MAP_ENTRY_LBA_MASK: u32 = 0x3fff_ffff;

const INFO_OFF_SIG: usize = 0;
const INFO_OFF_UUID: usize = 16;
const INFO_OFF_FLAGS: usize = 32;
const INFO_OFF_MAJOR: usize = 36;
const INFO_OFF_MINOR: usize = 38;
const INFO_OFF_EXTERNAL_LBASIZE: usize = 40;
const INFO_OFF_EXTERNAL_NLBA: usize = 44;
const INFO_OFF_INTERNAL_LBASIZE: usize = 48;
const INFO_OFF_INTERNAL_NLBA: usize = 52;
const INFO_OFF_NFREE: usize = 56;
const INFO_OFF_INFOSIZE: usize = 60;
const INFO_OFF_NEXTOFF: usize = 64;
const INFO_OFF_DATAOFF: usize = 72;
const INFO_OFF_MAPOFF: usize = 80;
const INFO_OFF_FLOGOFF: usize = 88;
const INFO_OFF_INFOOFF: usize = 96;
const INFO_OFF_CHECKSUM: usize = BTT_INFO_SIZE as usize - 8;

/// Fletcher64 over little-endian u32 words.
///
/// `data.len()` must be a multiple of 4; trailing bytes are not summed.
#[must_use]
pub fn fletcher64(data: &[u8]) -> u64 {
    let mut lo: u32 = 0;
    let mut hi: u32 = 0;
    for word in data.chunks_exact(4) {
        let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
        lo = lo.wrapping_add(value);
        hi = hi.wrapping_add(lo);
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Advance a flog sequence number: 1 -> 2 -> 3 -> 1. Zero maps to zero,
/// matching an unwritten half.
#[must_use]
pub fn next_seq(seq: u32) -> u32 {
    const NSEQ: [u32; 4] = [0, 2, 3, 1];
    NSEQ[(seq & 3) as usize]
}

/// One slot of the BTT map: post-map LBA plus the ZERO/ERROR flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MapEntry(u32);

impl MapEntry {
    /// Idle sentinel for read-tracking-table slots. Published entries
    /// always have both flag bits clear, so no live entry matches it.
    pub const RTT_IDLE: u32 = BTT_MAP_ENTRY_ERROR;

    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Initial map contents: entry `i` points at internal block `i` and
    /// reads as zeros.
    #[must_use]
    pub fn identity(premap_lba: u32) -> Self {
        Self(premap_lba | BTT_MAP_ENTRY_ZERO)
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Post-map LBA with the flag bits masked off.
    #[must_use]
    pub fn postmap_lba(self) -> u32 {
        self.0 & BTT_MAP_ENTRY_LBA_MASK
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self.0 & BTT_MAP_ENTRY_ERROR != 0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 & BTT_MAP_ENTRY_ZERO != 0
    }

    #[must_use]
    pub fn with_flag(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    #[must_use]
    pub fn encode(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    #[must_use]
    pub fn decode(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

/// A flog record in host byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlogEntry {
    /// Pre-map LBA this record remapped.
    pub lba: u32,
    /// Map entry that was displaced; once the record commits, this is
    /// the lane's free block.
    pub old_map: u32,
    /// Map entry that was installed.
    pub new_map: u32,
    /// 2-bit sequence number; 0 means the half was never written.
    pub seq: u32,
}

impl FlogEntry {
    #[must_use]
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0_u8; 16];
        buf[0..4].copy_from_slice(&self.lba.to_le_bytes());
        buf[4..8].copy_from_slice(&self.old_map.to_le_bytes());
        buf[8..12].copy_from_slice(&self.new_map.to_le_bytes());
        buf[12..16].copy_from_slice(&self.seq.to_le_bytes());
        buf
    }

    /// Encode only `{lba, old_map, new_map}`, the 12-byte body written
    /// ahead of the sequence number.
    #[must_use]
    pub fn encode_body(&self) -> [u8; 12] {
        let mut buf = [0_u8; 12];
        buf[0..4].copy_from_slice(&self.lba.to_le_bytes());
        buf[4..8].copy_from_slice(&self.old_map.to_le_bytes());
        buf[8..12].copy_from_slice(&self.new_map.to_le_bytes());
        buf
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            lba: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            old_map: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            new_map: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            seq: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            lba: read_le_u32(bytes, 0)?,
            old_map: read_le_u32(bytes, 4)?,
            new_map: read_le_u32(bytes, 8)?,
            seq: read_le_u32(bytes, 12)?,
        })
    }
}

/// Arena info block, duplicated at both ends of each arena.
///
/// All offsets are arena-relative on media. `infosize` records the
/// encoded size so a future revision can grow the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaInfo {
    pub parent_uuid: [u8; BTTINFO_UUID_LEN],
    pub flags: u32,
    pub major: u16,
    pub minor: u16,
    pub external_lbasize: u32,
    pub external_nlba: u32,
    pub internal_lbasize: u32,
    pub internal_nlba: u32,
    pub nfree: u32,
    pub infosize: u32,
    pub nextoff: u64,
    pub dataoff: u64,
    pub mapoff: u64,
    pub flogoff: u64,
    pub infooff: u64,
}

impl ArenaInfo {
    /// Encode to the full info block, inserting the checksum last.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BTT_INFO_SIZE as usize];
        buf[INFO_OFF_SIG..INFO_OFF_SIG + 16].copy_from_slice(&BTTINFO_SIG);
        buf[INFO_OFF_UUID..INFO_OFF_UUID + 16].copy_from_slice(&self.parent_uuid);
        buf[INFO_OFF_FLAGS..INFO_OFF_FLAGS + 4].copy_from_slice(&self.flags.to_le_bytes());
        buf[INFO_OFF_MAJOR..INFO_OFF_MAJOR + 2].copy_from_slice(&self.major.to_le_bytes());
        buf[INFO_OFF_MINOR..INFO_OFF_MINOR + 2].copy_from_slice(&self.minor.to_le_bytes());
        buf[INFO_OFF_EXTERNAL_LBASIZE..INFO_OFF_EXTERNAL_LBASIZE + 4]
            .copy_from_slice(&self.external_lbasize.to_le_bytes());
        buf[INFO_OFF_EXTERNAL_NLBA..INFO_OFF_EXTERNAL_NLBA + 4]
            .copy_from_slice(&self.external_nlba.to_le_bytes());
        buf[INFO_OFF_INTERNAL_LBASIZE..INFO_OFF_INTERNAL_LBASIZE + 4]
            .copy_from_slice(&self.internal_lbasize.to_le_bytes());
        buf[INFO_OFF_INTERNAL_NLBA..INFO_OFF_INTERNAL_NLBA + 4]
            .copy_from_slice(&self.internal_nlba.to_le_bytes());
        buf[INFO_OFF_NFREE..INFO_OFF_NFREE + 4].copy_from_slice(&self.nfree.to_le_bytes());
        buf[INFO_OFF_INFOSIZE..INFO_OFF_INFOSIZE + 4].copy_from_slice(&self.infosize.to_le_bytes());
        buf[INFO_OFF_NEXTOFF..INFO_OFF_NEXTOFF + 8].copy_from_slice(&self.nextoff.to_le_bytes());
        buf[INFO_OFF_DATAOFF..INFO_OFF_DATAOFF + 8].copy_from_slice(&self.dataoff.to_le_bytes());
        buf[INFO_OFF_MAPOFF..INFO_OFF_MAPOFF + 8].copy_from_slice(&self.mapoff.to_le_bytes());
        buf[INFO_OFF_FLOGOFF..INFO_OFF_FLOGOFF + 8].copy_from_slice(&self.flogoff.to_le_bytes());
        buf[INFO_OFF_INFOOFF..INFO_OFF_INFOOFF + 8].copy_from_slice(&self.infooff.to_le_bytes());

        let checksum = fletcher64(&buf);
        buf[INFO_OFF_CHECKSUM..INFO_OFF_CHECKSUM + 8].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Decode and validate an info block: signature, major version of at
    /// least 1, and checksum. A failure here means "no layout", not a
    /// hard error.
    pub fn decode(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < BTT_INFO_SIZE as usize {
            return Err(ParseError::InsufficientData {
                needed: BTT_INFO_SIZE as usize,
                offset: 0,
                actual: block.len(),
            });
        }

        let sig = read_fixed::<16>(block, INFO_OFF_SIG)?;
        if sig != BTTINFO_SIG {
            return Err(ParseError::InvalidSignature);
        }

        let major = read_le_u16(block, INFO_OFF_MAJOR)?;
        if major == 0 {
            return Err(ParseError::InvalidField {
                field: "major",
                reason: "must be at least 1",
            });
        }

        let stored = read_le_u64(block, INFO_OFF_CHECKSUM)?;
        let mut zeroed = block[..BTT_INFO_SIZE as usize].to_vec();
        zeroed[INFO_OFF_CHECKSUM..INFO_OFF_CHECKSUM + 8].fill(0);
        let computed = fletcher64(&zeroed);
        if stored != computed {
            return Err(ParseError::ChecksumMismatch { stored, computed });
        }

        Ok(Self {
            parent_uuid: read_fixed::<16>(block, INFO_OFF_UUID)?,
            flags: read_le_u32(block, INFO_OFF_FLAGS)?,
            major,
            minor: read_le_u16(block, INFO_OFF_MINOR)?,
            external_lbasize: read_le_u32(block, INFO_OFF_EXTERNAL_LBASIZE)?,
            external_nlba: read_le_u32(block, INFO_OFF_EXTERNAL_NLBA)?,
            internal_lbasize: read_le_u32(block, INFO_OFF_INTERNAL_LBASIZE)?,
            internal_nlba: read_le_u32(block, INFO_OFF_INTERNAL_NLBA)?,
            nfree: read_le_u32(block, INFO_OFF_NFREE)?,
            infosize: read_le_u32(block, INFO_OFF_INFOSIZE)?,
            nextoff: read_le_u64(block, INFO_OFF_NEXTOFF)?,
            dataoff: read_le_u64(block, INFO_OFF_DATAOFF)?,
            mapoff: read_le_u64(block, INFO_OFF_MAPOFF)?,
            flogoff: read_le_u64(block, INFO_OFF_FLOGOFF)?,
            infooff: read_le_u64(block, INFO_OFF_INFOOFF)?,
        })
    }
}

/// Byte offset of the map entry for `premap_lba` within a map region
/// starting at `mapoff`.
#[must_use]
pub fn map_entry_offset(mapoff: ByteOffset, premap_lba: u32) -> ByteOffset {
    mapoff.add(u64::from(premap_lba) * btt_types::BTT_MAP_ENTRY_SIZE)
}
