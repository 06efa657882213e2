//! Offline consistency check: every internal block referenced exactly
//! once across the map and the flog free blocks.
//!
//! The scan is single-threaded; the caller quiesces all other
//! operations (enforced by `Btt::check` taking `&mut self`). Findings
//! are logged and folded into a boolean outcome: duplicates and gaps
//! mean "inconsistent", not a raised error.

use crate::arena::Arena;
use btt_error::{BttError, Result};
use btt_ns::Namespace;
use btt_ondisk::{MapEntry, BTT_MAP_ENTRY_LBA_MASK};
use btt_types::{Lane, BTT_MAP_ENTRY_SIZE};
use tracing::{debug, warn};

struct BlockBitmap {
    words: Vec<u64>,
    len: usize,
}

impl BlockBitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0_u64; len.div_ceil(64)],
            len,
        }
    }

    /// Set bit `index`; returns whether it was already set.
    fn test_and_set(&mut self, index: usize) -> bool {
        let mask = 1_u64 << (index % 64);
        let word = &mut self.words[index / 64];
        let seen = *word & mask != 0;
        *word |= mask;
        seen
    }

    fn get(&self, index: usize) -> bool {
        self.words[index / 64] & (1_u64 << (index % 64)) != 0
    }

    fn len(&self) -> usize {
        self.len
    }
}

fn zero_length_window() -> BttError {
    BttError::Io(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "namespace returned a zero-length map window",
    ))
}

/// Scan one arena. Returns `Ok(false)` on duplicates, out-of-range
/// entries, or unreferenced internal blocks.
pub(crate) fn check_arena(ns: &dyn Namespace, arena: &Arena) -> Result<bool> {
    let lane = Lane(0);
    let mut consistent = true;
    let mut bitmap = BlockBitmap::new(arena.internal_nlba as usize);

    let mut note = |postmap: u32, source: &str, index: u32, bitmap: &mut BlockBitmap| {
        if postmap as usize >= bitmap.len() {
            warn!(
                target: "btt::check",
                event = "postmap_out_of_range",
                source,
                index,
                postmap,
            );
            return false;
        }
        if bitmap.test_and_set(postmap as usize) {
            warn!(
                target: "btt::check",
                event = "duplicate_postmap",
                source,
                index,
                postmap,
            );
            return false;
        }
        true
    };

    // Pass 1: every post-map LBA named by the map.
    let mut premap = 0_u32;
    let mut off = arena.mapoff;
    while premap < arena.external_nlba {
        let wanted = (arena.external_nlba - premap) as usize * BTT_MAP_ENTRY_SIZE as usize;
        let window = ns.map_at(lane, off, wanted)?;
        let usable = window.len() / BTT_MAP_ENTRY_SIZE as usize;
        if usable == 0 {
            return Err(zero_length_window());
        }

        let bytes = window.as_slice();
        for slot in 0..usable {
            let raw = u32::from_le_bytes([
                bytes[slot * 4],
                bytes[slot * 4 + 1],
                bytes[slot * 4 + 2],
                bytes[slot * 4 + 3],
            ]);
            let postmap = MapEntry::from_raw(raw).postmap_lba();
            if !note(postmap, "map", premap + slot as u32, &mut bitmap) {
                consistent = false;
            }
        }

        premap += usable as u32;
        off = off.add(usable as u64 * BTT_MAP_ENTRY_SIZE);
    }

    // Pass 2: the free block held by each flog slot. The in-memory
    // runtime is authoritative here; it already absorbed any recovery.
    for (index, slot) in arena.flogs.iter().enumerate() {
        let postmap = slot.lock().flog.old_map & BTT_MAP_ENTRY_LBA_MASK;
        if !note(postmap, "flog", index as u32, &mut bitmap) {
            consistent = false;
        }
    }

    // Pass 3: no internal block may be left unreferenced.
    for postmap in 0..arena.internal_nlba {
        if !bitmap.get(postmap as usize) {
            warn!(
                target: "btt::check",
                event = "unreferenced_postmap",
                postmap,
            );
            consistent = false;
        }
    }

    debug!(
        target: "btt::check",
        event = "arena_checked",
        consistent,
        internal_nlba = arena.internal_nlba,
    );
    Ok(consistent)
}

#[cfg(test)]
mod tests {
    use super::BlockBitmap;

    #[test]
    fn bitmap_tracks_duplicates_and_gaps() {
        let mut bitmap = BlockBitmap::new(130);
        assert!(!bitmap.test_and_set(0));
        assert!(bitmap.test_and_set(0));
        assert!(!bitmap.test_and_set(129));
        assert!(bitmap.get(129));
        assert!(!bitmap.get(64));
    }
}
